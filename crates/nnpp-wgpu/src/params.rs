//! Uniform block shared by every layer kernel

use bytemuck::{Pod, Zeroable};
use nnpp_wgpu_model::Shape;

/// Per-dispatch parameters, laid out to match `LayerParams` in `nn_layers.wgsl`
///
/// Every field is a 16-byte vector so the struct has the same layout under the uniform address
/// space rules as in Rust.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LayerParams {
    pub input_shape: [u32; 4],
    pub input_stride: [u32; 4],
    pub output_shape: [u32; 4],
    pub output_stride: [u32; 4],
    pub weight_shape: [u32; 4],
    pub weight_stride: [u32; 4],
    /// Stride rows, stride columns, padding top, padding left
    pub conv: [u32; 4],
    /// Upsampling rows, upsampling columns, element count, unused
    pub extent: [u32; 4],
    /// Alpha, epsilon, value scale, value bias
    pub scalars: [f32; 4],
}

fn shape_vec(shape: Shape) -> [u32; 4] {
    [shape.x, shape.y, shape.z, shape.w]
}

fn stride_vec(shape: Shape) -> [u32; 4] {
    let [row, column, channel] = shape.id_multiplier();
    [row, column, channel, 0]
}

impl LayerParams {
    /// Parameters describing an input and output activation
    pub fn new(input: Shape, output: Shape) -> Self {
        Self {
            input_shape: shape_vec(input),
            input_stride: stride_vec(input),
            output_shape: shape_vec(output),
            output_stride: stride_vec(output),
            extent: [0, 0, output.volume() as u32, 0],
            ..Self::zeroed()
        }
    }

    pub fn with_weights(mut self, shape: Shape) -> Self {
        self.weight_shape = shape_vec(shape);
        self.weight_stride = shape.weight_id_multiplier();
        self
    }

    pub fn with_convolution(mut self, strides: (u32, u32), padding: (u32, u32)) -> Self {
        self.conv = [strides.0, strides.1, padding.0, padding.1];
        self
    }

    pub fn with_upsampling(mut self, size: (u32, u32)) -> Self {
        self.extent[0] = size.0;
        self.extent[1] = size.1;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.scalars[0] = alpha;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.scalars[1] = epsilon;
        self
    }

    /// Affine transform `value * scale + bias` applied by the image conversion kernels
    pub fn with_value_transform(mut self, scale: f32, bias: f32) -> Self {
        self.scalars[2] = scale;
        self.scalars[3] = bias;
        self
    }

    /// Number of activation elements written by the dispatch
    pub fn element_count(&self) -> u32 {
        self.extent[2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_uniform_block() {
        assert_eq!(std::mem::size_of::<LayerParams>(), 9 * 16);
        assert_eq!(std::mem::align_of::<LayerParams>(), 4);
    }

    #[test]
    fn test_strides_and_counts() {
        let params = LayerParams::new(Shape::new(64, 32, 3), Shape::new(32, 16, 8))
            .with_weights(Shape::new4(3, 3, 3, 8))
            .with_convolution((2, 2), (0, 0));

        assert_eq!(params.input_stride, [32 * 3, 3, 1, 0]);
        assert_eq!(params.output_stride, [16 * 8, 8, 1, 0]);
        assert_eq!(params.weight_stride, [3 * 3 * 8, 3 * 8, 8, 1]);
        assert_eq!(params.element_count(), 32 * 16 * 8);
        assert_eq!(params.conv, [2, 2, 0, 0]);
    }

    #[test]
    fn test_scalar_slots() {
        let params = LayerParams::new(Shape::new(1, 1, 1), Shape::new(1, 1, 1))
            .with_alpha(0.2)
            .with_epsilon(1e-3)
            .with_value_transform(2.0, -1.0)
            .with_upsampling((2, 3));
        assert_eq!(params.scalars, [0.2, 1e-3, 2.0, -1.0]);
        assert_eq!(&params.extent[..2], &[2, 3]);
    }
}
