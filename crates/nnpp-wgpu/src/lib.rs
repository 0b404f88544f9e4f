//! GPU inference engine for fixed-topology image CNNs
//!
//! This crate executes a compiled [`nnpp_wgpu_model::Architecture`] entirely on GPU compute
//! kernels, once per rendered frame. The host hands in a frame, records the inference into its own
//! command encoder and receives an RGBA image it can composite.
//!
//! A typical host drives an [`InferenceModel`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use nnpp_wgpu::{ComputeDevice, DeviceOptions, InferenceModel, KernelRegistry, ModelOptions, WgpuDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(WgpuDevice::request(&DeviceOptions::default())?);
//! let registry = Arc::new(KernelRegistry::new(device.as_ref())?);
//! let mut model = InferenceModel::new(device.clone(), registry, ModelOptions::default());
//! model.load_file("model.json")?;
//!
//! let frame = device.create_image("frame", 1280, 720)?;
//! model.setup(frame, 720, 1280)?;
//! let mut encoder = device.create_encoder("frame");
//! model.predict(&mut encoder)?;
//! device.submit(encoder);
//! # Ok(())
//! # }
//! ```

mod device;
mod error;
mod graph;
mod kernels;
mod layer;
mod model;
mod params;
mod wgpu_device;

#[cfg(test)]
mod recording;

pub use device::{Bindings, ComputeDevice, DeviceError, WorkgroupCount};
pub use error::{EngineError, EngineResult};
pub use graph::ModelGraph;
pub use kernels::{KernelKind, KernelRegistry, NN_LAYERS_WGSL};
pub use layer::{Layer, LayerInput, LayerOutput, PendingOutput};
pub use model::{InferenceModel, ModelOptions, ModelState, ValueRange};
pub use params::LayerParams;
pub use wgpu_device::{DeviceOptions, IMAGE_FORMAT, WgpuDevice};

pub use nnpp_wgpu_model as model_description;
