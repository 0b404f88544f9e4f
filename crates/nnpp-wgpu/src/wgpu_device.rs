//! wgpu implementation of the compute substrate

use crate::device::{Bindings, ComputeDevice, DeviceError, WorkgroupCount};
use tracing::{debug, info, trace};
use wgpu::util::DeviceExt;

/// Binding slots of `nn_layers.wgsl`
mod slot {
    pub const PARAMS: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const OUTPUT: u32 = 2;
    pub const WEIGHTS: u32 = 3;
    pub const SOURCE_IMAGE: u32 = 4;
    pub const OUTPUT_IMAGE: u32 = 5;
}

/// Texture format of every engine image
pub const IMAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Options used when [`WgpuDevice::request`] creates its own adapter and device
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Backends considered when enumerating adapters
    pub backends: wgpu::Backends,
    /// Adapter preference (high-performance vs low-power)
    pub power_preference: wgpu::PowerPreference,
    /// Force wgpu to pick its fallback (software) adapter
    pub force_fallback_adapter: bool,
    /// Debug label of the logical device
    pub label: Option<String>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: Some("nnpp-wgpu device".to_string()),
        }
    }
}

/// Compute substrate backed by a wgpu device and queue
///
/// Programs are WGSL shader modules and kernels are compute pipelines whose bind group layout is
/// derived from the resources the entry point actually uses.
#[derive(Debug, Clone)]
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
}

impl WgpuDevice {
    /// Wraps an existing device, typically the one the host renders with
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let limits = device.limits();
        Self { device, queue, limits }
    }

    /// Creates an instance, adapter and device of its own
    ///
    /// # Errors
    /// Fails when no adapter matches `options` or the device cannot be created.
    pub fn request(options: &DeviceOptions) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))?;
        let adapter_info = adapter.get_info();
        info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "Selected GPU adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: options.label.as_deref(),
            required_limits: adapter.limits(),
            ..Default::default()
        }))?;

        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Creates a command encoder for recording a frame
    pub fn create_encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submits recorded work to the queue
    pub fn submit(&self, encoder: wgpu::CommandEncoder) -> wgpu::SubmissionIndex {
        self.queue.submit(std::iter::once(encoder.finish()))
    }

    /// Runs `create` inside an error scope and returns the first captured error
    fn scoped<T>(&self, filter: wgpu::ErrorFilter, create: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = create();
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn check_buffer_size(&self, label: &str, bytes: u64) -> Result<(), DeviceError> {
        let limit = (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size);
        if bytes > limit {
            return Err(DeviceError::BufferTooLarge {
                label: label.to_string(),
                bytes,
                limit,
            });
        }
        Ok(())
    }
}

fn buffer_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
}

impl ComputeDevice for WgpuDevice {
    type Program = wgpu::ShaderModule;
    type Kernel = wgpu::ComputePipeline;
    type Buffer = wgpu::Buffer;
    type Image = wgpu::Texture;
    type BindGroup = wgpu::BindGroup;
    type Encoder = wgpu::CommandEncoder;

    fn load_program(&self, label: &str, source: &str) -> Result<Self::Program, DeviceError> {
        let (module, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::ProgramCompilation {
                label: label.to_string(),
                message: error.to_string(),
            });
        }
        debug!(program = label, "Loaded kernel program");
        Ok(module)
    }

    fn find_kernel(&self, program: &Self::Program, entry_point: &str) -> Option<Self::Kernel> {
        let (pipeline, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: program,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        match error {
            Some(error) => {
                debug!(entry_point, %error, "Entry point could not be resolved");
                None
            }
            None => Some(pipeline),
        }
    }

    fn create_buffer(&self, label: &str, elements: usize) -> Result<Self::Buffer, DeviceError> {
        let bytes = (elements.max(1) * std::mem::size_of::<f32>()) as u64;
        self.check_buffer_size(label, bytes)?;
        let (buffer, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: buffer_usage(),
                mapped_at_creation: false,
            })
        });
        if error.is_some() {
            return Err(DeviceError::OutOfMemory { label: label.to_string(), bytes });
        }
        trace!(buffer = label, bytes, "Allocated buffer");
        Ok(buffer)
    }

    fn create_buffer_init(&self, label: &str, contents: &[f32]) -> Result<Self::Buffer, DeviceError> {
        let bytes = std::mem::size_of_val(contents) as u64;
        self.check_buffer_size(label, bytes)?;
        let (buffer, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(contents),
                usage: buffer_usage(),
            })
        });
        if error.is_some() {
            return Err(DeviceError::OutOfMemory { label: label.to_string(), bytes });
        }
        trace!(buffer = label, bytes, "Uploaded buffer");
        Ok(buffer)
    }

    fn release_buffer(&self, buffer: Self::Buffer) {
        // wgpu frees the allocation once every submission referencing it has completed
        drop(buffer);
    }

    fn create_image(&self, label: &str, width: u32, height: u32) -> Result<Self::Image, DeviceError> {
        let limit = self.limits.max_texture_dimension_2d;
        if width > limit || height > limit {
            return Err(DeviceError::ImageTooLarge {
                label: label.to_string(),
                width,
                height,
                limit,
            });
        }
        let (texture, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: IMAGE_FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        });
        if error.is_some() {
            return Err(DeviceError::OutOfMemory {
                label: label.to_string(),
                bytes: width as u64 * height as u64 * 4,
            });
        }
        trace!(image = label, width, height, "Allocated image");
        Ok(texture)
    }

    fn release_image(&self, image: Self::Image) {
        drop(image);
    }

    fn image_extent(&self, image: &Self::Image) -> (u32, u32) {
        (image.width(), image.height())
    }

    fn create_bind_group(&self, kernel: &Self::Kernel, bindings: &Bindings<'_, Self>) -> Result<Self::BindGroup, DeviceError> {
        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(bindings.label),
            contents: bytemuck::bytes_of(&bindings.params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let source_view = bindings.source_image.map(|image| image.create_view(&wgpu::TextureViewDescriptor::default()));
        let output_view = bindings.output_image.map(|image| image.create_view(&wgpu::TextureViewDescriptor::default()));

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: slot::PARAMS,
            resource: params.as_entire_binding(),
        }];
        for (binding, buffer) in [(slot::INPUT, bindings.input), (slot::OUTPUT, bindings.output), (slot::WEIGHTS, bindings.weights)] {
            if let Some(buffer) = buffer {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buffer.as_entire_binding(),
                });
            }
        }
        for (binding, view) in [(slot::SOURCE_IMAGE, source_view.as_ref()), (slot::OUTPUT_IMAGE, output_view.as_ref())] {
            if let Some(view) = view {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::TextureView(view),
                });
            }
        }

        let (bind_group, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(bindings.label),
                layout: &kernel.get_bind_group_layout(0),
                entries: &entries,
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::InvalidBindings {
                label: bindings.label.to_string(),
                message: error.to_string(),
            });
        }
        trace!(bind_group = bindings.label, entries = entries.len(), "Created bind group");
        Ok(bind_group)
    }

    fn release_bind_group(&self, bind_group: Self::BindGroup) {
        drop(bind_group);
    }

    fn dispatch(&self, encoder: &mut Self::Encoder, kernel: &Self::Kernel, bind_group: &Self::BindGroup, label: &str, workgroups: WorkgroupCount) -> Result<(), DeviceError> {
        let limit = self.max_workgroups_per_dimension();
        if !workgroups.fits(limit) {
            return Err(DeviceError::GridTooLarge {
                label: label.to_string(),
                workgroups: workgroups.as_array(),
                limit,
            });
        }

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(kernel);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.dispatch_workgroups(workgroups.x, workgroups.y, workgroups.z);
        Ok(())
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }
}
