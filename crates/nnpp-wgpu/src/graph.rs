//! Model graph
//!
//! The graph is the ordered layer sequence `input -> operators -> output`. Each layer reads the
//! activation buffer of its predecessor, so a frame is executed by dispatching the layers in order.
//! Bind groups are built when the graph is initialised and when a source frame is bound; running
//! a frame only records dispatches.

use crate::device::ComputeDevice;
use crate::error::{EngineError, EngineResult};
use crate::kernels::KernelRegistry;
use crate::layer::{Layer, LayerInput};
use crate::model::ModelOptions;
use nnpp_wgpu_model::{Architecture, Operator, Shape, WeightCursor};
use tracing::{debug, info, warn};

/// Instantiated layers of one model, bound to one device
pub struct ModelGraph<D: ComputeDevice> {
    name: String,
    layers: Vec<Layer<D>>,
    /// `(height, width)` the layer outputs are currently allocated for
    resolution: Option<(u32, u32)>,
}

impl<D: ComputeDevice> ModelGraph<D> {
    /// Instantiates every layer of `architecture` and uploads its weights
    ///
    /// Weights are assigned positionally: each layer takes as many consecutive entries of the
    /// export as its operator consumes, and the export must be consumed exactly.
    pub fn new(device: &D, registry: &KernelRegistry<D>, architecture: &Architecture, options: &ModelOptions) -> EngineResult<Self> {
        let (input_scale, input_bias) = options.input_range.input_transform();
        let (output_scale, output_bias) = options.output_range.output_transform();

        let mut layers = Vec::with_capacity(architecture.layers.len() + 2);
        layers.push(Layer::new(architecture.input_name.clone(), Operator::Input, registry).with_value_transform(input_scale, input_bias));
        for layer in &architecture.layers {
            layers.push(Layer::new(layer.name.clone(), layer.operator.clone(), registry));
        }
        layers.push(Layer::new("output", Operator::Output, registry).with_value_transform(output_scale, output_bias));

        let mut graph = Self {
            name: architecture.name.clone(),
            layers,
            resolution: None,
        };
        if let Err(error) = graph.load_weights(device, architecture) {
            graph.release(device);
            return Err(error);
        }

        info!(model = %graph.name, layers = graph.layers.len(), "Built model graph");
        Ok(graph)
    }

    fn load_weights(&mut self, device: &D, architecture: &Architecture) -> EngineResult<()> {
        let mut cursor = WeightCursor::new(&architecture.weights);
        for (index, layer) in self.layers.iter_mut().enumerate() {
            let entries = cursor.take(index, layer.name(), layer.operator().weight_count())?;
            layer.load_weight(device, entries)?;
        }
        cursor.finish()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer<D>] {
        &self.layers
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    /// Shape of the activation fed to the output stage, once initialised
    pub fn output_shape(&self) -> Option<Shape> {
        self.resolution?;
        self.layers.last().map(Layer::input_shape)
    }

    /// Image written by the output stage, once initialised
    pub fn output_image(&self) -> Option<&D::Image> {
        self.layers.last().and_then(Layer::output_image)
    }

    /// Propagates shapes for a `height` x `width` frame, allocates every layer output and binds
    /// each layer after the input stage to its predecessor
    ///
    /// All new outputs are allocated and bound before any is swapped in. If one step fails the new
    /// resources are released and the graph keeps its previous resolution, buffers and bindings.
    /// The input stage stays unbound until [`ModelGraph::bind_source`].
    pub fn init(&mut self, device: &D, height: u32, width: u32) -> EngineResult<()> {
        if height == 0 || width == 0 {
            return Err(EngineError::InvalidResolution {
                height,
                width,
                reason: "frame dimensions must be positive".to_string(),
            });
        }

        let mut pending = Vec::with_capacity(self.layers.len());
        let mut shape = Shape::new(height, width, 3);
        for layer in &self.layers {
            match layer.allocate(device, shape) {
                Ok(output) => {
                    shape = output.output_shape();
                    pending.push(output);
                }
                Err(error) => {
                    warn!(model = %self.name, layer = %layer.name(), height, width, %error, "Failed to initialise model graph, keeping previous allocation");
                    for output in pending {
                        output.discard(device);
                    }
                    return Err(error);
                }
            }
        }

        for index in 1..self.layers.len() {
            let (previous, rest) = pending.split_at_mut(index);
            let layer = &self.layers[index];
            let result = match previous[index - 1].buffer() {
                Some(buffer) => layer.bind_pending(device, &mut rest[0], LayerInput::Buffer(buffer)),
                None => Err(EngineError::InvalidInput { layer: layer.name().to_string() }),
            };
            if let Err(error) = result {
                warn!(model = %self.name, layer = %layer.name(), height, width, %error, "Failed to bind model graph, keeping previous allocation");
                for output in pending {
                    output.discard(device);
                }
                return Err(error);
            }
        }

        for (layer, output) in self.layers.iter_mut().zip(pending) {
            layer.commit(device, output);
            debug!(layer = %layer.name(), input = %layer.input_shape(), output = %layer.output_shape(), "Propagated shape");
        }
        self.resolution = Some((height, width));
        info!(model = %self.name, height, width, "Initialised model graph");
        Ok(())
    }

    /// Binds `source` as the frame read by the input stage
    ///
    /// # Errors
    /// Fails when the graph is not initialised or the frame does not match its resolution; the
    /// previous binding is kept in both cases.
    pub fn bind_source(&mut self, device: &D, source: &D::Image) -> EngineResult<()> {
        let Some((height, width)) = self.resolution else {
            return Err(EngineError::NotInitialized { layer: self.name.clone() });
        };
        let (actual_width, actual_height) = device.image_extent(source);
        if (actual_width, actual_height) != (width, height) {
            return Err(EngineError::SourceMismatch {
                width,
                height,
                actual_width,
                actual_height,
            });
        }
        let input = self.layers.first_mut().ok_or_else(|| EngineError::NotInitialized { layer: self.name.clone() })?;
        input.bind(device, LayerInput::Image(source))
    }

    /// Records one frame: the input stage reads the bound source, every other layer its
    /// predecessor
    ///
    /// # Returns
    /// The output image, valid once the recorded work has been submitted and completed
    pub fn run(&self, device: &D, encoder: &mut D::Encoder) -> EngineResult<&D::Image> {
        if self.resolution.is_none() {
            return Err(EngineError::NotInitialized { layer: self.name.clone() });
        }
        for layer in &self.layers {
            layer.run(device, encoder)?;
        }
        self.output_image().ok_or_else(|| EngineError::NotInitialized { layer: "output".to_string() })
    }

    /// Releases every layer's buffers and bind groups; safe to call repeatedly
    pub fn release(&mut self, device: &D) {
        for layer in &mut self.layers {
            layer.release(device);
        }
        self.resolution = None;
    }
}
