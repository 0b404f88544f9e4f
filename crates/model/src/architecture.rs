//! Compiles a layer description into the linear operator sequence the engine executes
//!
//! The compiler maps every declared layer class to zero, one or two [`Operator`]s, checks that the
//! declared adjacency forms a single chain and validates the hyperparameters the kernels rely on.

use crate::Shape;
use crate::description::{LayerSpec, ModelDescription};
use crate::error::{ModelError, ModelResult};
use crate::weights::{WeightEntry, batch_norm_layout, conv2d_layout};
use tracing::{debug, info};

/// Default LeakyReLU slope used by Keras when the config carries none
pub const DEFAULT_LEAKY_ALPHA: f32 = 0.3;

/// Default BatchNormalization epsilon used by Keras
pub const DEFAULT_BATCH_NORM_EPSILON: f32 = 1e-3;

/// Merge layers; the engine only executes linear chains
const MERGE_CLASSES: &[&str] = &["Concatenate", "Add", "Subtract", "Multiply", "Average", "Maximum", "Minimum", "Dot"];

/// Convolution hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    /// Output channel count
    pub filters: u32,
    /// Kernel extent as (rows, columns)
    pub kernel_size: (u32, u32),
    /// Stride as (rows, columns)
    pub strides: (u32, u32),
    /// Whether a bias array follows the kernel in the weight export
    pub use_bias: bool,
}

impl Conv2dConfig {
    /// Number of weight entries consumed (kernel and optional bias)
    pub fn weight_count(&self) -> usize {
        1 + usize::from(self.use_bias)
    }

    /// Output shape under "same" padding
    pub fn output_shape(&self, input: Shape) -> Shape {
        Shape::new(input.x / self.strides.0, input.y / self.strides.1, self.filters)
    }

    /// Zero padding `(top, left)` applied before the first row and column
    ///
    /// Follows the TensorFlow "same" rule: the total padding along an axis is
    /// `max((out - 1) * stride + kernel - in, 0)` and the smaller half goes first.
    pub fn padding(&self, input: Shape) -> (u32, u32) {
        let output = self.output_shape(input);
        let before = |input: u32, output: u32, stride: u32, kernel: u32| {
            let needed = (output.saturating_sub(1) * stride + kernel) as i64 - input as i64;
            (needed.max(0) / 2) as u32
        };
        (
            before(input.x, output.x, self.strides.0, self.kernel_size.0),
            before(input.y, output.y, self.strides.1, self.kernel_size.1),
        )
    }
}

/// BatchNormalization hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    pub epsilon: f32,
    /// Whether an offset (beta) array is exported
    pub center: bool,
    /// Whether a scale (gamma) array is exported
    pub scale: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_BATCH_NORM_EPSILON,
            center: true,
            scale: true,
        }
    }
}

impl BatchNormConfig {
    /// Number of weight entries consumed (optional scale and offset, then mean and variance)
    pub fn weight_count(&self) -> usize {
        2 + usize::from(self.scale) + usize::from(self.center)
    }
}

/// One executable operator and its hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    /// Converts the source image into the first activation buffer
    Input,
    Conv2D(Conv2dConfig),
    BatchNorm(BatchNormConfig),
    ReLU,
    LeakyReLU { alpha: f32 },
    Tanh,
    /// Nearest-neighbour upsampling by (rows, columns)
    UpSampling2D { size: (u32, u32) },
    /// Converts the last activation buffer into the output image
    Output,
}

impl Operator {
    /// Shape produced by this operator for the given input shape
    pub fn output_shape(&self, input: Shape) -> Shape {
        match self {
            Self::Conv2D(config) => config.output_shape(input),
            Self::UpSampling2D { size } => Shape::new(input.x * size.0, input.y * size.1, input.z),
            Self::Input | Self::BatchNorm(_) | Self::ReLU | Self::LeakyReLU { .. } | Self::Tanh | Self::Output => input,
        }
    }

    /// Number of consecutive weight entries this operator consumes
    pub fn weight_count(&self) -> usize {
        match self {
            Self::Conv2D(config) => config.weight_count(),
            Self::BatchNorm(config) => config.weight_count(),
            _ => 0,
        }
    }

    /// Name of the compute kernel entry point executing this operator
    pub fn kernel_name(&self) -> &'static str {
        match self {
            Self::Input => "InputLayer",
            Self::Conv2D(_) => "Conv2D",
            Self::BatchNorm(_) => "BatchNormalization",
            Self::ReLU => "ReLU",
            Self::LeakyReLU { .. } => "LeakyReLU",
            Self::Tanh => "Tanh",
            Self::UpSampling2D { .. } => "UpSampling2D",
            Self::Output => "OutputLayer",
        }
    }

    /// Turns the weight entries of this operator into its device buffer layout
    ///
    /// # Returns
    /// `None` for operators without weights, otherwise the weight shape and the flat buffer
    pub fn weight_layout(&self, layer: &str, entries: &[WeightEntry]) -> ModelResult<Option<(Shape, Vec<f32>)>> {
        match self {
            Self::Conv2D(config) => conv2d_layout(layer, config, entries).map(Some),
            Self::BatchNorm(config) => batch_norm_layout(layer, config, entries).map(Some),
            _ if entries.is_empty() => Ok(None),
            _ => Err(ModelError::WeightShapeMismatch {
                layer: layer.to_string(),
                reason: format!("{} takes no weights, got {} entries", self.kernel_name(), entries.len()),
            }),
        }
    }
}

/// A named operator of the compiled sequence
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDef {
    pub name: String,
    pub operator: Operator,
}

impl LayerDef {
    fn new(name: impl Into<String>, operator: Operator) -> Self {
        Self { name: name.into(), operator }
    }
}

/// Executable form of a model description
///
/// `layers` holds the operators between the implicit input and output stages, in execution
/// order. `weights` is the untouched flat export; it is consumed positionally when the graph loads.
#[derive(Debug, Clone)]
pub struct Architecture {
    pub name: String,
    pub input_name: String,
    pub layers: Vec<LayerDef>,
    pub weights: Vec<WeightEntry>,
}

impl Architecture {
    /// Compiles a model description
    ///
    /// # Errors
    /// Unknown layer classes, merge layers, branching adjacency, unsupported activations or
    /// invalid hyperparameters are configuration errors.
    pub fn from_description(description: ModelDescription) -> ModelResult<Self> {
        let ModelDescription { model, weights } = description;
        let name = model.config.name.clone().unwrap_or_else(|| "model".to_string());

        let mut input_name: Option<String> = None;
        let mut layers = Vec::new();
        // Name downstream layers must reference to continue the chain
        let mut current: Option<String> = None;

        for (index, spec) in model.config.layers.iter().enumerate() {
            let layer_name = spec.display_name(index);
            check_inbound(spec, index, &layer_name, current.as_deref())?;

            if spec.class_name == "InputLayer" {
                if let Some(first) = &input_name {
                    return Err(ModelError::DuplicateInput {
                        first: first.clone(),
                        second: layer_name,
                    });
                }
                if !layers.is_empty() {
                    return Err(ModelError::InvalidLayerConfig {
                        layer: layer_name,
                        reason: "InputLayer must precede every other layer".to_string(),
                    });
                }
                input_name = Some(layer_name.clone());
            } else {
                let operators = compile_layer(spec, index, &layer_name)?;
                debug!(layer = %layer_name, class = %spec.class_name, operators = operators.len(), "Compiled layer");
                layers.extend(operators);
            }
            current = Some(layer_name);
        }

        if layers.is_empty() {
            return Err(ModelError::EmptyModel);
        }

        let input_name = input_name.unwrap_or_else(|| "input".to_string());
        info!(model = %name, operators = layers.len(), weight_entries = weights.len(), "Compiled model architecture");
        Ok(Self {
            name,
            input_name,
            layers,
            weights,
        })
    }

    /// Total number of weight entries the operators consume
    pub fn weight_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.operator.weight_count()).sum()
    }

    /// Output shape of every operator for an input frame of `height` x `width`
    ///
    /// The first element is the input stage output, the last one the shape fed to the output stage.
    pub fn propagate(&self, height: u32, width: u32) -> Vec<Shape> {
        let mut shape = Operator::Input.output_shape(Shape::new(height, width, 3));
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        shapes.push(shape);
        for layer in &self.layers {
            shape = layer.operator.output_shape(shape);
            shapes.push(shape);
        }
        shapes
    }
}

fn check_inbound(spec: &LayerSpec, index: usize, layer_name: &str, current: Option<&str>) -> ModelResult<()> {
    let inbound = spec.inbound_layers(index)?;
    if inbound.is_empty() {
        return Ok(());
    }
    if MERGE_CLASSES.contains(&spec.class_name.as_str()) {
        // Reported as unsupported by the class mapping instead
        return Ok(());
    }
    let expected = current.unwrap_or_default();
    let continues = match (inbound.as_slice(), current) {
        ([only], Some(current)) => only == current,
        ([_], None) => true,
        _ => false,
    };
    if !continues {
        return Err(ModelError::NonLinearTopology {
            layer: layer_name.to_string(),
            inbound,
            expected: expected.to_string(),
        });
    }
    Ok(())
}

fn compile_layer(spec: &LayerSpec, index: usize, name: &str) -> ModelResult<Vec<LayerDef>> {
    let config = &spec.config;
    let unsupported = |reason: &str| ModelError::Unsupported {
        layer: name.to_string(),
        class_name: spec.class_name.clone(),
        reason: reason.to_string(),
    };

    let operators = match spec.class_name.as_str() {
        "Conv2D" => {
            let filters = config.filters.ok_or_else(|| missing(name, "filters"))?;
            let [kernel_rows, kernel_cols] = config.kernel_size.ok_or_else(|| missing(name, "kernel_size"))?;
            let [stride_rows, stride_cols] = config.strides.unwrap_or([1, 1]);
            if filters == 0 || kernel_rows == 0 || kernel_cols == 0 || stride_rows == 0 || stride_cols == 0 {
                return Err(invalid(name, format!("filters {filters}, kernel {kernel_rows}x{kernel_cols} and strides {stride_rows}x{stride_cols} must be positive")));
            }
            if config.padding.as_deref() == Some("valid") && (kernel_rows, kernel_cols) != (1, 1) {
                return Err(unsupported("only \"same\" padding is supported for kernels larger than 1x1"));
            }
            if config.dilation_rate.is_some_and(|rate| rate != [1, 1]) {
                return Err(unsupported("dilated convolutions are not supported"));
            }
            let conv = LayerDef::new(
                name,
                Operator::Conv2D(Conv2dConfig {
                    filters,
                    kernel_size: (kernel_rows, kernel_cols),
                    strides: (stride_rows, stride_cols),
                    use_bias: config.use_bias.unwrap_or(true),
                }),
            );
            let mut operators = vec![conv];
            operators.extend(activation(name, config.activation.as_deref())?);
            operators
        }
        "BatchNormalization" => {
            let epsilon = config.epsilon.unwrap_or(DEFAULT_BATCH_NORM_EPSILON);
            if epsilon.is_nan() || epsilon < 0.0 {
                return Err(invalid(name, format!("epsilon {epsilon} must be non-negative")));
            }
            vec![LayerDef::new(
                name,
                Operator::BatchNorm(BatchNormConfig {
                    epsilon,
                    center: config.center.unwrap_or(true),
                    scale: config.scale.unwrap_or(true),
                }),
            )]
        }
        "LeakyReLU" => vec![LayerDef::new(
            name,
            Operator::LeakyReLU {
                alpha: config.alpha.unwrap_or(DEFAULT_LEAKY_ALPHA),
            },
        )],
        "ReLU" if config.max_value.is_some() => return Err(unsupported("clamped ReLU (max_value) is not supported")),
        "ReLU" if config.threshold.is_some_and(|threshold| threshold != 0.0) => return Err(unsupported("ReLU thresholds other than 0 are not supported")),
        "ReLU" => match config.alpha {
            Some(alpha) if alpha != 0.0 => vec![LayerDef::new(name, Operator::LeakyReLU { alpha })],
            _ => vec![LayerDef::new(name, Operator::ReLU)],
        },
        "Activation" => {
            let kind = config.activation.as_deref().ok_or_else(|| missing(name, "activation"))?;
            match kind {
                "relu" => vec![LayerDef::new(name, Operator::ReLU)],
                "tanh" => vec![LayerDef::new(name, Operator::Tanh)],
                "linear" => Vec::new(),
                other => {
                    return Err(ModelError::UnsupportedActivation {
                        layer: name.to_string(),
                        activation: other.to_string(),
                    });
                }
            }
        }
        "UpSampling2D" => {
            let [rows, cols] = config.size.unwrap_or([2, 2]);
            if rows == 0 || cols == 0 {
                return Err(invalid(name, format!("upsampling factors {rows}x{cols} must be positive")));
            }
            if let Some(interpolation) = config.interpolation.as_deref()
                && interpolation != "nearest"
            {
                return Err(unsupported("only nearest interpolation is supported"));
            }
            vec![LayerDef::new(name, Operator::UpSampling2D { size: (rows, cols) })]
        }
        "Dropout" => Vec::new(),
        class if MERGE_CLASSES.contains(&class) => return Err(unsupported("merge layers are not supported, the model must be a linear chain")),
        class => {
            return Err(ModelError::UnknownLayerClass {
                index,
                class_name: class.to_string(),
            });
        }
    };
    Ok(operators)
}

/// Operator appended after a convolution for its fused activation
fn activation(layer: &str, activation: Option<&str>) -> ModelResult<Option<LayerDef>> {
    match activation {
        None | Some("linear") => Ok(None),
        Some("relu") => Ok(Some(LayerDef::new(format!("{layer}_relu"), Operator::ReLU))),
        Some("tanh") => Ok(Some(LayerDef::new(format!("{layer}_tanh"), Operator::Tanh))),
        Some(other) => Err(ModelError::UnsupportedActivation {
            layer: layer.to_string(),
            activation: other.to_string(),
        }),
    }
}

fn missing(layer: &str, field: &'static str) -> ModelError {
    ModelError::MissingField { layer: layer.to_string(), field }
}

fn invalid(layer: &str, reason: String) -> ModelError {
    ModelError::InvalidLayerConfig { layer: layer.to_string(), reason }
}
