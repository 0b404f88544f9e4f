//! Inference orchestrator
//!
//! [`InferenceModel`] is what a host drives once per frame. It owns the model graph and tracks its
//! lifecycle:
//!
//! ```text
//! Unloaded --load--> Loaded --init(h, w)--> Initialized --setup(frame, h, w)--> Ready --predict--> Ready
//!     ^                                                                            |
//!     +------------------------------------ release -------------------------------+
//! ```

use crate::device::ComputeDevice;
use crate::error::{EngineError, EngineResult};
use crate::graph::ModelGraph;
use crate::kernels::KernelRegistry;
use nnpp_wgpu_model::{Architecture, ModelDescription};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Value range of image data on the model side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// `[0, 1]`, the range of the image itself
    Unit,
    /// `[-1, 1]`, as produced by tanh-terminated image generators
    #[default]
    Signed,
}

impl ValueRange {
    /// `(scale, bias)` mapping `[0, 1]` texels into this range
    pub fn input_transform(self) -> (f32, f32) {
        match self {
            Self::Unit => (1.0, 0.0),
            Self::Signed => (2.0, -1.0),
        }
    }

    /// `(scale, bias)` mapping this range back into `[0, 1]` texels
    pub fn output_transform(self) -> (f32, f32) {
        match self {
            Self::Unit => (1.0, 0.0),
            Self::Signed => (0.5, 0.5),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Range the input stage maps the source frame into
    pub input_range: ValueRange,
    /// Range the last layer produces, mapped back to texels by the output stage
    pub output_range: ValueRange,
}

/// Lifecycle state of an [`InferenceModel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loaded,
    Initialized { height: u32, width: u32 },
    Ready { height: u32, width: u32 },
}

impl ModelState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized { .. } => "initialized",
            Self::Ready { .. } => "ready",
        }
    }

    /// Resolution the layer outputs are allocated for
    pub fn resolution(&self) -> Option<(u32, u32)> {
        match *self {
            Self::Initialized { height, width } | Self::Ready { height, width } => Some((height, width)),
            Self::Unloaded | Self::Loaded => None,
        }
    }
}

/// Per-frame driver of one model on one device
pub struct InferenceModel<D: ComputeDevice> {
    device: Arc<D>,
    registry: Arc<KernelRegistry<D>>,
    options: ModelOptions,
    state: ModelState,
    graph: Option<ModelGraph<D>>,
    frame: Option<D::Image>,
}

impl<D: ComputeDevice> InferenceModel<D> {
    pub fn new(device: Arc<D>, registry: Arc<KernelRegistry<D>>, options: ModelOptions) -> Self {
        Self {
            device,
            registry,
            options,
            state: ModelState::Unloaded,
            graph: None,
            frame: None,
        }
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn graph(&self) -> Option<&ModelGraph<D>> {
        self.graph.as_ref()
    }

    /// Output image of the last prediction
    pub fn output_image(&self) -> Option<&D::Image> {
        self.graph.as_ref().and_then(ModelGraph::output_image)
    }

    /// Reads, compiles and loads a model description file
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading model");
        self.release();
        let description = ModelDescription::from_file(path)?;
        self.load(description)
    }

    /// Compiles and loads a model description
    pub fn load(&mut self, description: ModelDescription) -> EngineResult<()> {
        self.release();
        self.load_architecture(&Architecture::from_description(description)?)
    }

    /// Loads a compiled architecture, replacing any previous model
    ///
    /// On failure the model is left unloaded.
    pub fn load_architecture(&mut self, architecture: &Architecture) -> EngineResult<()> {
        self.release();
        let graph = ModelGraph::new(self.device.as_ref(), &self.registry, architecture, &self.options)?;
        self.graph = Some(graph);
        self.state = ModelState::Loaded;
        Ok(())
    }

    /// Allocates every layer output for a `height` x `width` frame
    ///
    /// A failed initialisation leaves the previous state and allocations untouched.
    pub fn init(&mut self, height: u32, width: u32) -> EngineResult<()> {
        let graph = self.graph.as_mut().ok_or(EngineError::NotLoaded)?;
        graph.init(self.device.as_ref(), height, width)?;
        self.state = ModelState::Initialized { height, width };
        Ok(())
    }

    /// Binds the frame to run on, re-initialising only when the resolution changed
    ///
    /// All bind groups are built here, so subsequent predictions record dispatches without
    /// allocating. A frame that does not match `height` x `width` is rejected.
    pub fn setup(&mut self, frame: D::Image, height: u32, width: u32) -> EngineResult<()> {
        if self.graph.is_none() {
            return Err(EngineError::NotLoaded);
        }
        if self.state.resolution() != Some((height, width)) {
            debug!(height, width, previous = ?self.state.resolution(), "Resolution changed, re-initialising");
            self.init(height, width)?;
        }
        let graph = self.graph.as_mut().ok_or(EngineError::NotLoaded)?;
        graph.bind_source(self.device.as_ref(), &frame)?;
        self.frame = Some(frame);
        self.state = ModelState::Ready { height, width };
        Ok(())
    }

    /// Records one inference of the bound frame into `encoder`
    ///
    /// # Returns
    /// The output image, holding the result once the encoder's work has completed
    pub fn predict(&self, encoder: &mut D::Encoder) -> EngineResult<&D::Image> {
        let (ModelState::Ready { .. }, Some(graph), Some(_)) = (self.state, self.graph.as_ref(), self.frame.as_ref()) else {
            return Err(EngineError::NotReady { state: self.state.name() });
        };
        graph.run(self.device.as_ref(), encoder)
    }

    /// Releases all device memory and returns to the unloaded state; safe in every state
    pub fn release(&mut self) {
        if let Some(mut graph) = self.graph.take() {
            graph.release(self.device.as_ref());
            info!(model = %graph.name(), "Released model");
        }
        self.frame = None;
        self.state = ModelState::Unloaded;
    }
}

impl<D: ComputeDevice> Drop for InferenceModel<D> {
    fn drop(&mut self) {
        self.release();
    }
}
