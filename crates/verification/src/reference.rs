//! CPU reference execution of a compiled model
//!
//! Evaluates every operator with the same tensor layouts as the compute kernels: HWC activations,
//! `(kH, kW, Cin, Cout)` convolution kernels followed by their bias, and BatchNorm statistics
//! interleaved per channel. Outputs are quantized the way an `Rgba8Unorm` storage write is.

use crate::{VerificationError, VerificationResult};
use image::{Rgba, RgbaImage};
use nnpp_wgpu::ModelOptions;
use nnpp_wgpu_model::{Architecture, ModelError, ModelResult, Operator, Shape, WeightCursor};
use tracing::debug;

struct ReferenceLayer {
    name: String,
    operator: Operator,
    weights: Option<(Shape, Vec<f32>)>,
}

/// A model prepared for CPU execution
pub struct ReferenceEngine {
    name: String,
    input_transform: (f32, f32),
    output_transform: (f32, f32),
    layers: Vec<ReferenceLayer>,
}

/// An activation tensor in HWC order
struct Activation {
    shape: Shape,
    data: Vec<f32>,
}

impl ReferenceEngine {
    /// Lays out the weights of every operator
    ///
    /// Weight entries are consumed in the same positional order as the GPU graph, so an export the
    /// engine rejects is rejected here as well.
    pub fn new(architecture: &Architecture, options: ModelOptions) -> ModelResult<Self> {
        let mut cursor = WeightCursor::new(&architecture.weights);
        let mut layers = Vec::with_capacity(architecture.layers.len());
        // Position 0 is the input stage
        for (index, layer) in architecture.layers.iter().enumerate() {
            let entries = cursor.take(index + 1, &layer.name, layer.operator.weight_count())?;
            layers.push(ReferenceLayer {
                name: layer.name.clone(),
                operator: layer.operator.clone(),
                weights: layer.operator.weight_layout(&layer.name, entries)?,
            });
        }
        cursor.finish()?;

        Ok(Self {
            name: architecture.name.clone(),
            input_transform: options.input_range.input_transform(),
            output_transform: options.output_range.output_transform(),
            layers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the model on `image` and returns the output frame
    pub fn run(&self, image: &RgbaImage) -> VerificationResult<RgbaImage> {
        let (width, height) = image.dimensions();
        let mut activation = self.input(image);
        if activation.data.is_empty() {
            return Err(VerificationError::EmptyActivation {
                layer: "input".to_string(),
                height,
                width,
            });
        }

        for layer in &self.layers {
            activation = layer.forward(&activation)?;
            debug!(layer = %layer.name, shape = %activation.shape, "Reference layer evaluated");
            if activation.data.is_empty() {
                return Err(VerificationError::EmptyActivation {
                    layer: layer.name.clone(),
                    height,
                    width,
                });
            }
        }

        Ok(self.output(&activation))
    }

    fn input(&self, image: &RgbaImage) -> Activation {
        let (width, height) = image.dimensions();
        let shape = Shape::new(height, width, 3);
        let (scale, bias) = self.input_transform;
        let mut data = vec![0.0; shape.volume()];
        for (column, row, pixel) in image.enumerate_pixels() {
            let base = shape.offset(row, column, 0);
            for channel in 0..3 {
                data[base + channel] = f32::from(pixel[channel]) / 255.0 * scale + bias;
            }
        }
        Activation { shape, data }
    }

    fn output(&self, activation: &Activation) -> RgbaImage {
        let shape = activation.shape;
        let (scale, bias) = self.output_transform;
        let last = shape.z as usize - 1;
        RgbaImage::from_fn(shape.y, shape.x, |column, row| {
            let base = shape.offset(row, column, 0);
            let mut pixel = [0u8, 0, 0, 255];
            for (channel, texel) in pixel.iter_mut().take(3).enumerate() {
                let value = (activation.data[base + channel.min(last)] * scale + bias).clamp(0.0, 1.0);
                *texel = (value * 255.0).round() as u8;
            }
            Rgba(pixel)
        })
    }
}

impl ReferenceLayer {
    fn forward(&self, input: &Activation) -> VerificationResult<Activation> {
        self.check_input_channels(input.shape)?;
        let shape = self.operator.output_shape(input.shape);
        let data = match (&self.operator, &self.weights) {
            (Operator::Conv2D(config), Some((kernel, weights))) => {
                let (pad_top, pad_left) = config.padding(input.shape);
                convolve(input, shape, *kernel, weights, config.strides, (pad_top, pad_left))
            }
            (Operator::BatchNorm(config), Some((_, weights))) => input
                .data
                .iter()
                .enumerate()
                .map(|(index, &value)| {
                    let stats = &weights[(index % input.shape.z as usize) * 4..][..4];
                    stats[0] * (value - stats[2]) / (stats[3] + config.epsilon).sqrt() + stats[1]
                })
                .collect(),
            (Operator::ReLU, _) => input.data.iter().map(|value| value.max(0.0)).collect(),
            (Operator::LeakyReLU { alpha }, _) => input.data.iter().map(|&value| if value >= 0.0 { value } else { alpha * value }).collect(),
            (Operator::Tanh, _) => input.data.iter().map(|value| value.tanh()).collect(),
            (Operator::UpSampling2D { size }, _) => {
                let mut data = vec![0.0; shape.volume()];
                for row in 0..shape.x {
                    for column in 0..shape.y {
                        let source = input.shape.offset(row / size.0, column / size.1, 0);
                        let target = shape.offset(row, column, 0);
                        let channels = shape.z as usize;
                        data[target..target + channels].copy_from_slice(&input.data[source..source + channels]);
                    }
                }
                data
            }
            // Weighted operators always carry their layout, and the input and output stages never
            // appear in the operator sequence
            _ => input.data.clone(),
        };
        Ok(Activation { shape, data })
    }

    fn check_input_channels(&self, input_shape: Shape) -> ModelResult<()> {
        let expected = match (&self.operator, &self.weights) {
            (Operator::Conv2D(_), Some((kernel, _))) => kernel.z,
            (Operator::BatchNorm(_), Some((stats, _))) => stats.x,
            _ => return Ok(()),
        };
        if expected != input_shape.z {
            return Err(ModelError::WeightShapeMismatch {
                layer: self.name.clone(),
                reason: format!("weights expect {expected} input channels, layer receives {}", input_shape.z),
            });
        }
        Ok(())
    }
}

fn convolve(input: &Activation, shape: Shape, kernel: Shape, weights: &[f32], strides: (u32, u32), padding: (u32, u32)) -> Vec<f32> {
    let [kernel_row_stride, kernel_column_stride, kernel_channel_stride, _] = kernel.weight_id_multiplier();
    let bias = &weights[kernel.weight_volume()..];
    let mut data = vec![0.0; shape.volume()];

    for row in 0..shape.x {
        for column in 0..shape.y {
            let origin_row = (row * strides.0) as i64 - padding.0 as i64;
            let origin_column = (column * strides.1) as i64 - padding.1 as i64;
            for filter in 0..shape.z {
                let mut sum = bias[filter as usize];
                for i in 0..kernel.x {
                    let source_row = origin_row + i as i64;
                    if source_row < 0 || source_row >= input.shape.x as i64 {
                        continue;
                    }
                    for j in 0..kernel.y {
                        let source_column = origin_column + j as i64;
                        if source_column < 0 || source_column >= input.shape.y as i64 {
                            continue;
                        }
                        let input_base = input.shape.offset(source_row as u32, source_column as u32, 0);
                        let weight_base = (i * kernel_row_stride + j * kernel_column_stride + filter) as usize;
                        for k in 0..kernel.z as usize {
                            sum += input.data[input_base + k] * weights[weight_base + k * kernel_channel_stride as usize];
                        }
                    }
                }
                data[shape.offset(row, column, filter)] = sum;
            }
        }
    }
    data
}
