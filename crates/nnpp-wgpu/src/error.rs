use crate::device::DeviceError;
use nnpp_wgpu_model::ModelError;
use thiserror::Error;

/// Errors produced by the inference engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("kernel program has no entry point '{name}'")]
    MissingKernel { name: String },

    #[error("no kernel named '{name}'")]
    UnknownKernel { name: String },

    #[error("layer '{layer}' was run before it was initialised")]
    NotInitialized { layer: String },

    #[error("layer '{layer}' has no bound input")]
    Unbound { layer: String },

    #[error("layer '{layer}' received the wrong kind of input")]
    InvalidInput { layer: String },

    #[error("no model is loaded")]
    NotLoaded,

    #[error("model is {state}, not ready to predict")]
    NotReady { state: &'static str },

    #[error("invalid resolution {height}x{width}: {reason}")]
    InvalidResolution { height: u32, width: u32, reason: String },

    #[error("source image is {actual_width}x{actual_height}, model is initialised for {width}x{height}")]
    SourceMismatch { width: u32, height: u32, actual_width: u32, actual_height: u32 },
}

/// Result alias used throughout the engine
pub type EngineResult<T> = std::result::Result<T, EngineError>;
