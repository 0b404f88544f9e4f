//! Configuration errors raised while reading a model description

use thiserror::Error;

/// Errors produced while parsing or compiling a model description
///
/// Every variant is a load-time configuration error: a model that fails here must never reach
/// the point where frames are dispatched.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read model description {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model description: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown layer class '{class_name}' at index {index}")]
    UnknownLayerClass { index: usize, class_name: String },

    #[error("layer '{layer}' ({class_name}) is not supported: {reason}")]
    Unsupported { layer: String, class_name: String, reason: String },

    #[error("layer '{layer}' does not continue a linear chain (inbound: {inbound:?}, expected '{expected}')")]
    NonLinearTopology { layer: String, inbound: Vec<String>, expected: String },

    #[error("layer '{layer}' has malformed inbound_nodes metadata")]
    InvalidInboundNodes { layer: String },

    #[error("model declares more than one InputLayer ('{first}' and '{second}')")]
    DuplicateInput { first: String, second: String },

    #[error("layer '{layer}' is missing required field '{field}'")]
    MissingField { layer: String, field: &'static str },

    #[error("layer '{layer}' has an invalid configuration: {reason}")]
    InvalidLayerConfig { layer: String, reason: String },

    #[error("layer '{layer}' uses unsupported activation '{activation}'")]
    UnsupportedActivation { layer: String, activation: String },

    #[error("weight entry has shape {shape:?} ({expected} values) but carries {actual} values")]
    WeightDataMismatch { shape: Vec<usize>, expected: usize, actual: usize },

    #[error("weight entry carries no data")]
    MissingWeightData,

    #[error("layer {layer_index} ('{layer}') expects {expected} weight entries but only {available} remain")]
    WeightCountMismatch { layer_index: usize, layer: String, expected: usize, available: usize },

    #[error("model consumed {consumed} of {total} weight entries")]
    UnusedWeights { consumed: usize, total: usize },

    #[error("weights of layer '{layer}' do not match its configuration: {reason}")]
    WeightShapeMismatch { layer: String, reason: String },

    #[error("model contains no layers")]
    EmptyModel,
}

/// Result alias used throughout the model crate
pub type ModelResult<T> = std::result::Result<T, ModelError>;
