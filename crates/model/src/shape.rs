//! Static tensor extents
//!
//! Every tensor the engine touches is described by a [`Shape`]. Activations use the first three axes
//! (rows, columns, channels) and are stored row-major in HWC order; convolution weight tensors use all
//! four axes (kernel rows, kernel columns, input channels, output channels).

use std::fmt;

/// Extents of a tensor
///
/// `x` is the height-like axis (rows), `y` the width-like axis (columns), `z` the channel count and
/// `w` a spare axis only used by 4-D weight tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Rows
    pub x: u32,
    /// Columns
    pub y: u32,
    /// Channels
    pub z: u32,
    /// Spare axis (output channels of a convolution kernel)
    pub w: u32,
}

impl Shape {
    /// Creates a 3-D activation shape
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z, w: 0 }
    }

    /// Creates a 4-D weight shape
    pub const fn new4(x: u32, y: u32, z: u32, w: u32) -> Self {
        Self { x, y, z, w }
    }

    /// Number of f32 elements in an activation buffer of this shape (`x * y * z`)
    pub fn volume(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    /// Number of elements of a 4-D weight tensor of this shape (`x * y * z * w`)
    pub fn weight_volume(&self) -> usize {
        self.volume() * self.w as usize
    }

    /// Per-axis multipliers turning `(row, column, channel)` into a flat HWC offset
    pub fn id_multiplier(&self) -> [u32; 3] {
        [self.y * self.z, self.z, 1]
    }

    /// Per-axis multipliers turning `(kernel row, kernel column, input channel, output channel)`
    /// into a flat offset of a row-major 4-D weight tensor
    pub fn weight_id_multiplier(&self) -> [u32; 4] {
        [self.y * self.z * self.w, self.z * self.w, self.w, 1]
    }

    /// Flat offset of an activation element
    pub fn offset(&self, row: u32, column: u32, channel: u32) -> usize {
        let [row_stride, column_stride, _] = self.id_multiplier();
        row as usize * row_stride as usize + column as usize * column_stride as usize + channel as usize
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.w == 0 {
            write!(f, "({}, {}, {})", self.x, self.y, self.z)
        } else {
            write!(f, "({}, {}, {}, {})", self.x, self.y, self.z, self.w)
        }
    }
}
