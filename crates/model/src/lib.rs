//! Model description for the nnpp-wgpu inference engine
//!
//! This crate reads a Keras-style model export (layer topology and a flat, ordered weight list)
//! and compiles it into the linear operator sequence executed by the GPU engine. Everything here
//! runs on the CPU and is shared with the CPU reference implementation used for verification.

pub mod architecture;
pub mod description;
pub mod error;
mod shape;
pub mod weights;

pub use architecture::{Architecture, BatchNormConfig, Conv2dConfig, LayerDef, Operator};
pub use description::ModelDescription;
pub use error::{ModelError, ModelResult};
pub use shape::Shape;
pub use weights::{WeightCursor, WeightData, WeightEntry};

/// Reads a model description file and compiles it
///
/// # Arguments
/// * `path` - Path to the JSON model export
///
/// # Returns
/// The compiled architecture together with its weight export
pub fn load_architecture<P: AsRef<std::path::Path>>(path: P) -> ModelResult<Architecture> {
    Architecture::from_description(ModelDescription::from_file(path)?)
}
