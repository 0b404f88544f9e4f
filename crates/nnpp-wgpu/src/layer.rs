//! Layer operators
//!
//! A [`Layer`] binds one [`Operator`] to its kernel and owns the device memory the operator writes
//! to: an activation buffer, or the output image for the final stage. Convolution and batch
//! normalisation layers additionally own their weight buffer.
//!
//! Once its input is known a layer builds its bind group, so recording a frame only encodes
//! dispatches and never allocates.

use crate::device::{Bindings, ComputeDevice, WorkgroupCount};
use crate::error::{EngineError, EngineResult};
use crate::kernels::{KernelKind, KernelRegistry};
use crate::params::LayerParams;
use nnpp_wgpu_model::{ModelError, Operator, Shape, WeightEntry};
use tracing::{debug, trace};

/// Workgroup edge of the 2-D image and upsampling kernels
const TILE: u32 = 8;
/// Invocations per workgroup of the linear kernels
const LANES: u32 = 32;

/// Device memory written by a layer
pub enum LayerOutput<D: ComputeDevice> {
    Buffer(D::Buffer),
    Image(D::Image),
}

impl<D: ComputeDevice> LayerOutput<D> {
    fn release(self, device: &D) {
        match self {
            Self::Buffer(buffer) => device.release_buffer(buffer),
            Self::Image(image) => device.release_image(image),
        }
    }
}

/// What a layer reads when it runs
pub enum LayerInput<'a, D: ComputeDevice> {
    /// The source frame, read by the input stage
    Image(&'a D::Image),
    /// The previous layer's activation buffer
    Buffer(&'a D::Buffer),
}

/// Output allocated for a new input shape but not yet swapped into its layer
pub struct PendingOutput<D: ComputeDevice> {
    input_shape: Shape,
    output_shape: Shape,
    output: LayerOutput<D>,
    bind_group: Option<D::BindGroup>,
}

impl<D: ComputeDevice> PendingOutput<D> {
    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    /// Activation buffer the next layer will read
    pub fn buffer(&self) -> Option<&D::Buffer> {
        match &self.output {
            LayerOutput::Buffer(buffer) => Some(buffer),
            LayerOutput::Image(_) => None,
        }
    }

    /// Releases the allocation without committing it
    pub fn discard(self, device: &D) {
        if let Some(bind_group) = self.bind_group {
            device.release_bind_group(bind_group);
        }
        self.output.release(device);
    }
}

/// One executable stage of the model graph
pub struct Layer<D: ComputeDevice> {
    name: String,
    operator: Operator,
    kind: KernelKind,
    kernel: D::Kernel,
    input_shape: Shape,
    output_shape: Shape,
    weight_shape: Shape,
    output: Option<LayerOutput<D>>,
    weights: Option<D::Buffer>,
    /// Bind group of the current input, output and weights
    bind_group: Option<D::BindGroup>,
    /// `(scale, bias)` applied by the input and output stages
    value_transform: (f32, f32),
}

impl<D: ComputeDevice> Layer<D> {
    pub fn new(name: impl Into<String>, operator: Operator, registry: &KernelRegistry<D>) -> Self {
        let kind = KernelKind::for_operator(&operator);
        Self {
            name: name.into(),
            operator,
            kind,
            kernel: registry.kernel(kind).clone(),
            input_shape: Shape::default(),
            output_shape: Shape::default(),
            weight_shape: Shape::default(),
            output: None,
            weights: None,
            bind_group: None,
            value_transform: (1.0, 0.0),
        }
    }

    /// Sets the affine transform `value * scale + bias` of the input and output stages
    pub fn with_value_transform(mut self, scale: f32, bias: f32) -> Self {
        self.value_transform = (scale, bias);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    pub fn weight_shape(&self) -> Shape {
        self.weight_shape
    }

    pub fn is_initialized(&self) -> bool {
        self.output.is_some()
    }

    /// Whether the layer can be dispatched without further setup
    pub fn is_bound(&self) -> bool {
        self.bind_group.is_some()
    }

    /// Activation buffer written by this layer, `None` for the output stage or before `init`
    pub fn output_buffer(&self) -> Option<&D::Buffer> {
        match &self.output {
            Some(LayerOutput::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// Image written by the output stage
    pub fn output_image(&self) -> Option<&D::Image> {
        match &self.output {
            Some(LayerOutput::Image(image)) => Some(image),
            _ => None,
        }
    }

    pub fn weight_buffer(&self) -> Option<&D::Buffer> {
        self.weights.as_ref()
    }

    /// Allocates the output for `input_shape` without touching the current one
    ///
    /// # Errors
    /// Fails when the input channels disagree with the loaded weights, when the output would be
    /// empty, or when the device cannot allocate it.
    pub fn allocate(&self, device: &D, input_shape: Shape) -> EngineResult<PendingOutput<D>> {
        self.check_input_channels(input_shape)?;

        let output_shape = self.operator.output_shape(input_shape);
        if output_shape.volume() == 0 {
            return Err(EngineError::InvalidResolution {
                height: input_shape.x,
                width: input_shape.y,
                reason: format!("layer '{}' would produce an empty {output_shape} output", self.name),
            });
        }

        let output = match self.operator {
            Operator::Output => LayerOutput::Image(device.create_image(&self.name, output_shape.y, output_shape.x)?),
            _ => LayerOutput::Buffer(device.create_buffer(&self.name, output_shape.volume())?),
        };
        debug!(layer = %self.name, input = %input_shape, output = %output_shape, "Allocated layer output");
        Ok(PendingOutput {
            input_shape,
            output_shape,
            output,
            bind_group: None,
        })
    }

    /// Builds the bind group of a pending output reading `input`
    pub fn bind_pending(&self, device: &D, pending: &mut PendingOutput<D>, input: LayerInput<'_, D>) -> EngineResult<()> {
        let bind_group = self.create_bind_group(device, input, &pending.output, pending.input_shape, pending.output_shape)?;
        if let Some(previous) = pending.bind_group.replace(bind_group) {
            device.release_bind_group(previous);
        }
        Ok(())
    }

    /// Rebuilds the bind group of the current output so the layer reads `input`
    pub fn bind(&mut self, device: &D, input: LayerInput<'_, D>) -> EngineResult<()> {
        let output = self.output.as_ref().ok_or_else(|| EngineError::NotInitialized { layer: self.name.clone() })?;
        let bind_group = self.create_bind_group(device, input, output, self.input_shape, self.output_shape)?;
        self.replace_bind_group(device, Some(bind_group));
        Ok(())
    }

    /// Swaps in a pending output and its bind group, releasing the previous ones
    ///
    /// A pending output committed unbound leaves the layer unbound until [`Layer::bind`].
    pub fn commit(&mut self, device: &D, pending: PendingOutput<D>) {
        self.replace_bind_group(device, pending.bind_group);
        if let Some(previous) = self.output.replace(pending.output) {
            previous.release(device);
        }
        self.input_shape = pending.input_shape;
        self.output_shape = pending.output_shape;
    }

    /// Computes the output shape for `input_shape` and (re)allocates the output
    ///
    /// # Returns
    /// The output shape, which is the input shape of the next layer
    pub fn init(&mut self, device: &D, input_shape: Shape) -> EngineResult<Shape> {
        let pending = self.allocate(device, input_shape)?;
        let output_shape = pending.output_shape;
        self.commit(device, pending);
        Ok(output_shape)
    }

    /// Transforms and uploads this layer's weight entries
    ///
    /// Layers without weights accept only an empty slice.
    pub fn load_weight(&mut self, device: &D, entries: &[WeightEntry]) -> EngineResult<()> {
        let Some((shape, values)) = self.operator.weight_layout(&self.name, entries)? else {
            return Ok(());
        };
        let buffer = device.create_buffer_init(&format!("{} weights", self.name), &values)?;
        // The current bind group still references the old weights
        self.replace_bind_group(device, None);
        if let Some(previous) = self.weights.replace(buffer) {
            device.release_buffer(previous);
        }
        self.weight_shape = shape;
        debug!(layer = %self.name, shape = %shape, values = values.len(), "Uploaded layer weights");
        Ok(())
    }

    /// Uniform parameters of this layer's dispatch
    pub fn params(&self) -> LayerParams {
        self.params_for(self.input_shape, self.output_shape)
    }

    fn params_for(&self, input_shape: Shape, output_shape: Shape) -> LayerParams {
        let params = LayerParams::new(input_shape, output_shape);
        match &self.operator {
            Operator::Input | Operator::Output => params.with_value_transform(self.value_transform.0, self.value_transform.1),
            Operator::Conv2D(config) => params
                .with_weights(self.weight_shape)
                .with_convolution(config.strides, config.padding(input_shape)),
            Operator::BatchNorm(config) => params.with_weights(self.weight_shape).with_epsilon(config.epsilon),
            Operator::LeakyReLU { alpha } => params.with_alpha(*alpha),
            Operator::UpSampling2D { size } => params.with_upsampling(*size),
            Operator::ReLU | Operator::Tanh => params,
        }
    }

    /// Dispatch grid of this layer; x always runs over rows
    ///
    /// Linear grids longer than `limit` are folded into z.
    pub fn workgroups(&self, limit: u32) -> WorkgroupCount {
        let output = self.output_shape;
        match self.operator {
            Operator::Input | Operator::Output => WorkgroupCount::new(output.x.div_ceil(TILE), output.y.div_ceil(TILE), 1),
            Operator::Conv2D(_) => WorkgroupCount::new(output.x, output.y, output.z.div_ceil(LANES)),
            Operator::BatchNorm(_) => WorkgroupCount::linear((output.x * output.y).div_ceil(LANES), output.z, limit),
            Operator::ReLU | Operator::LeakyReLU { .. } | Operator::Tanh => WorkgroupCount::linear((output.volume() as u32).div_ceil(LANES), 1, limit),
            Operator::UpSampling2D { .. } => WorkgroupCount::new(output.x.div_ceil(TILE), output.y.div_ceil(TILE), output.z),
        }
    }

    /// Records this layer's dispatch into `encoder`
    ///
    /// Uses the bind group built by [`Layer::bind`] or at commit; allocates nothing.
    pub fn run(&self, device: &D, encoder: &mut D::Encoder) -> EngineResult<()> {
        if self.output.is_none() {
            return Err(EngineError::NotInitialized { layer: self.name.clone() });
        }
        let bind_group = self.bind_group.as_ref().ok_or_else(|| EngineError::Unbound { layer: self.name.clone() })?;

        let workgroups = self.workgroups(device.max_workgroups_per_dimension());
        trace!(layer = %self.name, kernel = %self.kind, ?workgroups, "Dispatching layer");
        device.dispatch(encoder, &self.kernel, bind_group, &self.name, workgroups)?;
        Ok(())
    }

    /// Releases the bind group, output and weights; calling it again is a no-op
    pub fn release(&mut self, device: &D) {
        self.replace_bind_group(device, None);
        if let Some(output) = self.output.take() {
            output.release(device);
        }
        if let Some(weights) = self.weights.take() {
            device.release_buffer(weights);
        }
    }

    /// The input stage reads the source image; every other layer reads its predecessor's buffer.
    fn create_bind_group(&self, device: &D, input: LayerInput<'_, D>, output: &LayerOutput<D>, input_shape: Shape, output_shape: Shape) -> EngineResult<D::BindGroup> {
        let bindings = Bindings::<D>::new(&self.name, self.params_for(input_shape, output_shape));
        let bindings = match (input, output) {
            (LayerInput::Image(source), LayerOutput::Buffer(buffer)) if self.kind == KernelKind::InputLayer => bindings.source_image(source).output(buffer),
            (LayerInput::Buffer(previous), LayerOutput::Image(image)) if self.kind == KernelKind::OutputLayer => bindings.input(previous).output_image(image),
            (LayerInput::Buffer(previous), LayerOutput::Buffer(buffer)) if !matches!(self.kind, KernelKind::InputLayer | KernelKind::OutputLayer) => {
                bindings.input(previous).output(buffer).weights(self.weights.as_ref())
            }
            _ => return Err(EngineError::InvalidInput { layer: self.name.clone() }),
        };
        let bind_group = device.create_bind_group(&self.kernel, &bindings)?;
        debug!(layer = %self.name, input = %input_shape, output = %output_shape, "Bound layer");
        Ok(bind_group)
    }

    fn replace_bind_group(&mut self, device: &D, bind_group: Option<D::BindGroup>) {
        if let Some(previous) = std::mem::replace(&mut self.bind_group, bind_group) {
            device.release_bind_group(previous);
        }
    }

    fn check_input_channels(&self, input_shape: Shape) -> EngineResult<()> {
        let expected = match self.operator {
            Operator::Conv2D(_) => self.weight_shape.z,
            Operator::BatchNorm(_) => self.weight_shape.x,
            _ => return Ok(()),
        };
        if self.weights.is_some() && expected != input_shape.z {
            return Err(ModelError::WeightShapeMismatch {
                layer: self.name.clone(),
                reason: format!("weights expect {expected} input channels, layer receives {}", input_shape.z),
            }
            .into());
        }
        Ok(())
    }
}
