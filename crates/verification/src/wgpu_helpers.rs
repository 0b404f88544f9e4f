//! wgpu helper functions for verification
//!
//! Moves frames between `image` buffers and engine images, and runs a model on a single frame.

use crate::{VerificationError, VerificationResult};
use image::{Rgba, RgbaImage};
use nnpp_wgpu::{ComputeDevice, InferenceModel, KernelRegistry, ModelOptions, WgpuDevice};
use nnpp_wgpu_model::Architecture;
use std::sync::Arc;
use tracing::info;

const BYTES_PER_PIXEL: u32 = 4;

/// Uploads an RGBA8 image into a freshly allocated engine image
///
/// # Returns
/// An `Rgba8Unorm` texture usable as the source frame of a model
pub fn upload_frame(device: &WgpuDevice, image: &RgbaImage) -> VerificationResult<wgpu::Texture> {
    let (width, height) = image.dimensions();
    let texture = device.create_image("Source Frame", width, height)?;

    device.queue().write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.as_raw(),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * BYTES_PER_PIXEL),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );

    Ok(texture)
}

/// Reads an `Rgba8Unorm` texture back into an RGBA8 image
///
/// Blocks until every previously submitted command has finished.
pub fn read_image(device: &WgpuDevice, texture: &wgpu::Texture) -> VerificationResult<RgbaImage> {
    let wgpu::Extent3d { width, height, .. } = texture.size();

    // Buffer copies need rows aligned to COPY_BYTES_PER_ROW_ALIGNMENT
    let unpadded_bytes_per_row = width * BYTES_PER_PIXEL;
    let alignment = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(alignment) * alignment;

    let buffer = device.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Readback Buffer"),
        size: padded_bytes_per_row as u64 * height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_encoder("Readback");
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    device.submit(encoder);

    let buffer_slice = buffer.slice(..);
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver only disappears if the caller already gave up
        let _ = sender.send(result);
    });

    device.device().poll(wgpu::PollType::Wait)?;
    pollster::block_on(receiver.receive()).ok_or(VerificationError::ReadbackCanceled)??;

    let image = {
        let data = buffer_slice.get_mapped_range();
        RgbaImage::from_fn(width, height, |column, row| {
            let offset = (row * padded_bytes_per_row + column * BYTES_PER_PIXEL) as usize;
            Rgba([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        })
    };
    buffer.unmap();

    Ok(image)
}

/// Runs `architecture` on one frame and reads the output back
///
/// Goes through the full model lifecycle (load, setup, predict, release) the way a host
/// application would for a single frame.
pub fn run_model(
    device: &Arc<WgpuDevice>,
    registry: &Arc<KernelRegistry<WgpuDevice>>,
    architecture: &Architecture,
    options: ModelOptions,
    image: &RgbaImage,
) -> VerificationResult<RgbaImage> {
    let (width, height) = image.dimensions();
    let mut model = InferenceModel::new(device.clone(), registry.clone(), options);
    model.load_architecture(architecture)?;

    let frame = upload_frame(device, image)?;
    model.setup(frame, height, width)?;

    let mut encoder = device.create_encoder("Predict");
    let output = model.predict(&mut encoder)?.clone();
    device.submit(encoder);

    let result = read_image(device, &output)?;
    info!(model = %architecture.name, width, height, "Model evaluated on GPU");
    model.release();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{CompareResult, compare_images};
    use crate::reference::ReferenceEngine;
    use nnpp_wgpu::DeviceOptions;
    use nnpp_wgpu_model::{BatchNormConfig, Conv2dConfig, LayerDef, Operator, WeightData, WeightEntry};

    fn try_device() -> Option<Arc<WgpuDevice>> {
        match WgpuDevice::request(&DeviceOptions::default()) {
            Ok(device) => Some(Arc::new(device)),
            Err(error) => {
                eprintln!("Skipping GPU test: {error}");
                None
            }
        }
    }

    /// Deterministic pseudo-random values in [-0.5, 0.5)
    fn values(count: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
        (0..count)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state % 1000) as f32 / 1000.0 - 0.5
            })
            .collect()
    }

    fn test_architecture() -> Architecture {
        let conv = |filters, kernel, strides| {
            Operator::Conv2D(Conv2dConfig {
                filters,
                kernel_size: (kernel, kernel),
                strides: (strides, strides),
                use_bias: true,
            })
        };
        let layers = vec![
            ("conv_1", conv(8, 3, 2)),
            ("bn_1", Operator::BatchNorm(BatchNormConfig::default())),
            ("leaky_1", Operator::LeakyReLU { alpha: 0.3 }),
            ("up_1", Operator::UpSampling2D { size: (2, 2) }),
            ("conv_2", conv(3, 3, 1)),
            ("conv_2_tanh", Operator::Tanh),
        ];
        let kernel = |shape: [usize; 4], seed| WeightEntry::new(shape.to_vec(), WeightData::Flat(values(shape.iter().product(), seed))).unwrap();
        let weights = vec![
            kernel([3, 3, 3, 8], 1),
            WeightEntry::flat(values(8, 2)),
            WeightEntry::flat(vec![1.2; 8]),
            WeightEntry::flat(values(8, 3)),
            WeightEntry::flat(values(8, 4)),
            WeightEntry::flat(vec![0.8; 8]),
            kernel([3, 3, 8, 3], 5),
            WeightEntry::flat(values(3, 6)),
        ];
        Architecture {
            name: "parity".to_string(),
            input_name: "input_1".to_string(),
            layers: layers
                .into_iter()
                .map(|(name, operator)| LayerDef {
                    name: name.to_string(),
                    operator,
                })
                .collect(),
            weights,
        }
    }

    #[test]
    fn test_upload_and_read_back() {
        let Some(device) = try_device() else { return };
        // 70 pixels per row forces padded readback rows
        let image = RgbaImage::from_fn(70, 5, |x, y| Rgba([x as u8, y as u8, (x + y) as u8, 255]));
        let texture = upload_frame(&device, &image).unwrap();
        assert_eq!(read_image(&device, &texture).unwrap(), image);
    }

    #[test]
    fn test_engine_matches_reference() {
        let Some(device) = try_device() else { return };
        let registry = Arc::new(KernelRegistry::new(device.as_ref()).unwrap());
        let architecture = test_architecture();
        let image = RgbaImage::from_fn(48, 32, |x, y| Rgba([(x * 5) as u8, (y * 7) as u8, ((x * y) % 256) as u8, 255]));

        let reference = ReferenceEngine::new(&architecture, ModelOptions::default()).unwrap().run(&image).unwrap();
        let actual = run_model(&device, &registry, &architecture, ModelOptions::default(), &image).unwrap();

        assert_eq!(compare_images(&reference, &actual, 2), CompareResult::Match);
    }
}
