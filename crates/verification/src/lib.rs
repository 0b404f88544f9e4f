//! Verification tooling for the nnpp-wgpu inference engine
//!
//! Runs models both on the GPU engine and on a CPU reference that mirrors the kernels' numerics,
//! then compares the resulting images.

pub mod compare;
pub mod reference;
pub mod wgpu_helpers;

use nnpp_wgpu::{DeviceError, EngineError};
use nnpp_wgpu_model::ModelError;

/// Errors raised while verifying a model
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to wait for the device: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("failed to map readback buffer: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),
    #[error("readback channel closed before the buffer was mapped")]
    ReadbackCanceled,
    #[error("cannot run a {height}x{width} frame through layer {layer}: it produces an empty activation")]
    EmptyActivation { layer: String, height: u32, width: u32 },
}

pub type VerificationResult<T> = Result<T, VerificationError>;
