//! In-memory compute device for tests
//!
//! Records every allocation, release and dispatch instead of executing anything, and can be told
//! to fail allocations or to lack kernels.

use crate::device::{Bindings, ComputeDevice, DeviceError, WorkgroupCount};
use crate::params::LayerParams;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDispatch {
    pub kernel: String,
    pub label: String,
    pub workgroups: WorkgroupCount,
    pub params: LayerParams,
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub weights: Option<u64>,
    pub source_image: Option<u64>,
    pub output_image: Option<u64>,
}

/// Bindings captured when a bind group is created
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBindGroup {
    pub id: u64,
    pub kernel: String,
    pub params: LayerParams,
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub weights: Option<u64>,
    pub source_image: Option<u64>,
    pub output_image: Option<u64>,
}

#[derive(Default)]
struct Recording {
    next_id: u64,
    live_buffers: HashMap<u64, usize>,
    live_images: HashMap<u64, (u32, u32)>,
    released: HashSet<u64>,
    double_releases: usize,
    dispatches: Vec<RecordedDispatch>,
    uploads: HashMap<u64, Vec<f32>>,
    allocations_left: Option<usize>,
    next_bind_group: u64,
    live_bind_groups: HashSet<u64>,
}

impl Recording {
    fn allocate(&mut self, label: &str) -> Result<u64, DeviceError> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(DeviceError::OutOfMemory {
                    label: label.to_string(),
                    bytes: 0,
                });
            }
            *left -= 1;
        }
        self.next_id += 1;
        Ok(self.next_id)
    }
}

pub struct RecordingDevice {
    recording: RefCell<Recording>,
    missing_kernels: Vec<String>,
    max_workgroups: u32,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            recording: RefCell::new(Recording::default()),
            missing_kernels: Vec::new(),
            max_workgroups: 65535,
        }
    }

    pub fn without_kernel(mut self, entry_point: &str) -> Self {
        self.missing_kernels.push(entry_point.to_string());
        self
    }

    pub fn with_max_workgroups(mut self, limit: u32) -> Self {
        self.max_workgroups = limit;
        self
    }

    /// Lets the next `count` allocations succeed and fails every one after that
    pub fn fail_after(&self, count: usize) {
        self.recording.borrow_mut().allocations_left = Some(count);
    }

    pub fn stop_failing(&self) {
        self.recording.borrow_mut().allocations_left = None;
    }

    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.recording.borrow().dispatches.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.recording.borrow().live_buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.recording.borrow().live_images.len()
    }

    pub fn buffer_len(&self, id: u64) -> Option<usize> {
        self.recording.borrow().live_buffers.get(&id).copied()
    }

    pub fn uploaded(&self, id: u64) -> Option<Vec<f32>> {
        self.recording.borrow().uploads.get(&id).cloned()
    }

    pub fn double_releases(&self) -> usize {
        self.recording.borrow().double_releases
    }

    /// Bind groups created over the device's lifetime
    pub fn bind_groups_created(&self) -> u64 {
        self.recording.borrow().next_bind_group
    }

    pub fn live_bind_groups(&self) -> usize {
        self.recording.borrow().live_bind_groups.len()
    }
}

impl ComputeDevice for RecordingDevice {
    type Program = ();
    type Kernel = String;
    type Buffer = BufferId;
    type Image = ImageId;
    type BindGroup = RecordedBindGroup;
    type Encoder = ();

    fn load_program(&self, _label: &str, _source: &str) -> Result<Self::Program, DeviceError> {
        Ok(())
    }

    fn find_kernel(&self, _program: &Self::Program, entry_point: &str) -> Option<Self::Kernel> {
        (!self.missing_kernels.iter().any(|missing| missing == entry_point)).then(|| entry_point.to_string())
    }

    fn create_buffer(&self, label: &str, elements: usize) -> Result<Self::Buffer, DeviceError> {
        let mut recording = self.recording.borrow_mut();
        let id = recording.allocate(label)?;
        recording.live_buffers.insert(id, elements);
        Ok(BufferId(id))
    }

    fn create_buffer_init(&self, label: &str, contents: &[f32]) -> Result<Self::Buffer, DeviceError> {
        let mut recording = self.recording.borrow_mut();
        let id = recording.allocate(label)?;
        recording.live_buffers.insert(id, contents.len());
        recording.uploads.insert(id, contents.to_vec());
        Ok(BufferId(id))
    }

    fn release_buffer(&self, buffer: Self::Buffer) {
        let mut recording = self.recording.borrow_mut();
        if recording.live_buffers.remove(&buffer.0).is_none() || !recording.released.insert(buffer.0) {
            recording.double_releases += 1;
        }
    }

    fn create_image(&self, label: &str, width: u32, height: u32) -> Result<Self::Image, DeviceError> {
        let mut recording = self.recording.borrow_mut();
        let id = recording.allocate(label)?;
        recording.live_images.insert(id, (width, height));
        Ok(ImageId(id))
    }

    fn release_image(&self, image: Self::Image) {
        let mut recording = self.recording.borrow_mut();
        if recording.live_images.remove(&image.0).is_none() || !recording.released.insert(image.0) {
            recording.double_releases += 1;
        }
    }

    fn image_extent(&self, image: &Self::Image) -> (u32, u32) {
        self.recording.borrow().live_images.get(&image.0).copied().unwrap_or((0, 0))
    }

    fn create_bind_group(&self, kernel: &Self::Kernel, bindings: &Bindings<'_, Self>) -> Result<Self::BindGroup, DeviceError> {
        let mut recording = self.recording.borrow_mut();
        recording.next_bind_group += 1;
        let id = recording.next_bind_group;
        recording.live_bind_groups.insert(id);
        Ok(RecordedBindGroup {
            id,
            kernel: kernel.clone(),
            params: bindings.params,
            input: bindings.input.map(|buffer| buffer.0),
            output: bindings.output.map(|buffer| buffer.0),
            weights: bindings.weights.map(|buffer| buffer.0),
            source_image: bindings.source_image.map(|image| image.0),
            output_image: bindings.output_image.map(|image| image.0),
        })
    }

    fn release_bind_group(&self, bind_group: Self::BindGroup) {
        let mut recording = self.recording.borrow_mut();
        if !recording.live_bind_groups.remove(&bind_group.id) {
            recording.double_releases += 1;
        }
    }

    fn dispatch(&self, _encoder: &mut Self::Encoder, kernel: &Self::Kernel, bind_group: &Self::BindGroup, label: &str, workgroups: WorkgroupCount) -> Result<(), DeviceError> {
        if !workgroups.fits(self.max_workgroups) {
            return Err(DeviceError::GridTooLarge {
                label: label.to_string(),
                workgroups: workgroups.as_array(),
                limit: self.max_workgroups,
            });
        }
        let mut recording = self.recording.borrow_mut();
        if !recording.live_bind_groups.contains(&bind_group.id) || bind_group.kernel != *kernel {
            return Err(DeviceError::InvalidBindings {
                label: label.to_string(),
                message: format!("bind group {} is not live for kernel {kernel}", bind_group.id),
            });
        }
        recording.dispatches.push(RecordedDispatch {
            kernel: kernel.clone(),
            label: label.to_string(),
            workgroups,
            params: bind_group.params,
            input: bind_group.input,
            output: bind_group.output,
            weights: bind_group.weights,
            source_image: bind_group.source_image,
            output_image: bind_group.output_image,
        });
        Ok(())
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.max_workgroups
    }
}
