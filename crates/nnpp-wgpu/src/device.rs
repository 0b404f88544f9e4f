//! Compute substrate abstraction
//!
//! The engine never talks to a graphics API directly. Everything it needs from the host (program
//! loading, kernel lookup, buffer and image lifetime, dispatch) goes through [`ComputeDevice`], which
//! is implemented for wgpu in [`crate::WgpuDevice`].

use crate::params::LayerParams;
use thiserror::Error;

/// Errors reported by a compute substrate
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to compile program '{label}': {message}")]
    ProgramCompilation { label: String, message: String },

    #[error("out of device memory allocating '{label}' ({bytes} bytes)")]
    OutOfMemory { label: String, bytes: u64 },

    #[error("buffer '{label}' needs {bytes} bytes, device limit is {limit}")]
    BufferTooLarge { label: String, bytes: u64, limit: u64 },

    #[error("image '{label}' is {width}x{height}, device limit is {limit}")]
    ImageTooLarge { label: String, width: u32, height: u32, limit: u32 },

    #[error("dispatch '{label}' needs {workgroups:?} workgroups, device limit is {limit} per dimension")]
    GridTooLarge { label: String, workgroups: [u32; 3], limit: u32 },

    #[error("invalid bindings for '{label}': {message}")]
    InvalidBindings { label: String, message: String },

    #[error("no suitable adapter: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),

    #[error("failed to create device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Number of workgroups of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkgroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupCount {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Grid for a linear range of `groups` workgroups along x, folded into z when it exceeds `limit`
    ///
    /// Kernels dispatched this way rebuild the linear workgroup index as `wg.z * groups.x + wg.x`
    /// and discard indices past the end.
    pub fn linear(groups: u32, y: u32, limit: u32) -> Self {
        if groups <= limit {
            Self::new(groups, y, 1)
        } else {
            Self::new(limit, y, groups.div_ceil(limit))
        }
    }

    /// Returns true when every dimension is within `limit`
    pub fn fits(&self, limit: u32) -> bool {
        self.x <= limit && self.y <= limit && self.z <= limit
    }

    /// Total number of workgroups
    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Resources bound to a layer's kernel
///
/// Every parameter a kernel reads is carried here and baked into one bind group, so a dispatch can
/// never observe parameters left over from a previous layer.
pub struct Bindings<'a, D: ComputeDevice + ?Sized> {
    /// Debug label (the layer name)
    pub label: &'a str,
    pub params: LayerParams,
    pub input: Option<&'a D::Buffer>,
    pub output: Option<&'a D::Buffer>,
    pub weights: Option<&'a D::Buffer>,
    pub source_image: Option<&'a D::Image>,
    pub output_image: Option<&'a D::Image>,
}

impl<'a, D: ComputeDevice + ?Sized> Bindings<'a, D> {
    pub fn new(label: &'a str, params: LayerParams) -> Self {
        Self {
            label,
            params,
            input: None,
            output: None,
            weights: None,
            source_image: None,
            output_image: None,
        }
    }

    pub fn input(mut self, buffer: &'a D::Buffer) -> Self {
        self.input = Some(buffer);
        self
    }

    pub fn output(mut self, buffer: &'a D::Buffer) -> Self {
        self.output = Some(buffer);
        self
    }

    pub fn weights(mut self, buffer: Option<&'a D::Buffer>) -> Self {
        self.weights = buffer;
        self
    }

    pub fn source_image(mut self, image: &'a D::Image) -> Self {
        self.source_image = Some(image);
        self
    }

    pub fn output_image(mut self, image: &'a D::Image) -> Self {
        self.output_image = Some(image);
        self
    }
}

/// Host capability the engine runs on
///
/// Buffers hold f32 elements. Releasing a resource must be safe while previously recorded work
/// that references it is still pending; implementations defer the actual free until that work
/// has completed.
pub trait ComputeDevice {
    /// A compiled kernel program
    type Program;
    /// A dispatchable entry point of a program
    type Kernel: Clone;
    type Buffer;
    /// A 2-D RGBA8 image
    type Image;
    /// Kernel parameters and resources bound for repeated dispatch
    type BindGroup;
    /// Command recorder that dispatches are appended to
    type Encoder;

    /// Compiles a kernel program
    fn load_program(&self, label: &str, source: &str) -> Result<Self::Program, DeviceError>;

    /// Resolves an entry point of a program, or `None` when the program has no such entry point
    fn find_kernel(&self, program: &Self::Program, entry_point: &str) -> Option<Self::Kernel>;

    /// Allocates an uninitialised buffer of `elements` f32 values
    fn create_buffer(&self, label: &str, elements: usize) -> Result<Self::Buffer, DeviceError>;

    /// Allocates a buffer holding `contents`
    fn create_buffer_init(&self, label: &str, contents: &[f32]) -> Result<Self::Buffer, DeviceError>;

    fn release_buffer(&self, buffer: Self::Buffer);

    /// Allocates a `width` x `height` RGBA8 image usable as kernel output and kernel input
    fn create_image(&self, label: &str, width: u32, height: u32) -> Result<Self::Image, DeviceError>;

    fn release_image(&self, image: Self::Image);

    /// Image extent as `(width, height)`
    fn image_extent(&self, image: &Self::Image) -> (u32, u32);

    /// Builds the bind group of `kernel`, uploading `bindings.params` into its own uniform
    ///
    /// Bind groups live as long as the resources they reference and are reused by every dispatch
    /// until those resources change.
    fn create_bind_group(&self, kernel: &Self::Kernel, bindings: &Bindings<'_, Self>) -> Result<Self::BindGroup, DeviceError>;

    fn release_bind_group(&self, bind_group: Self::BindGroup);

    /// Records one dispatch of `kernel` over `workgroups`; allocates nothing
    fn dispatch(&self, encoder: &mut Self::Encoder, kernel: &Self::Kernel, bind_group: &Self::BindGroup, label: &str, workgroups: WorkgroupCount) -> Result<(), DeviceError>;

    /// Largest workgroup count accepted along any grid dimension
    fn max_workgroups_per_dimension(&self) -> u32;
}
