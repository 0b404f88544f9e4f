//! Model verification binary
//!
//! Runs every given model on the GPU engine and on the CPU reference and compares the outputs.

use clap::Parser;
use nnpp_wgpu::{DeviceOptions, KernelRegistry, ModelOptions, WgpuDevice};
use nnpp_wgpu_verification::{
    VerificationError,
    compare::{CompareResult, compare_images},
    reference::ReferenceEngine,
    wgpu_helpers::run_model,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(version, about = "Compare GPU inference against the CPU reference")]
struct Args {
    /// Input image file path
    input: PathBuf,

    /// Model descriptions to verify
    #[arg(required = true)]
    models: Vec<PathBuf>,

    /// Largest accepted per-channel difference in 8-bit steps
    #[arg(long, short, default_value = "2")]
    tolerance: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let image = image::open(&args.input).map_err(|e| format!("Failed to open input image: {e}"))?.to_rgba8();

    let device = Arc::new(WgpuDevice::request(&DeviceOptions::default())?);
    let registry = Arc::new(KernelRegistry::new(device.as_ref())?);
    let options = ModelOptions::default();

    let mut failures = 0;
    for path in &args.models {
        let name = path.display();
        let architecture = match nnpp_wgpu_model::load_architecture(path) {
            Ok(architecture) => architecture,
            Err(e) => {
                eprintln!("✗ Error loading model {name}: {e}");
                failures += 1;
                continue;
            }
        };

        let start = Instant::now();
        let reference = match ReferenceEngine::new(&architecture, options).map_err(VerificationError::from).and_then(|engine| engine.run(&image)) {
            Ok(output) => output,
            Err(e) => {
                eprintln!("✗ Error running CPU reference for {name}: {e}");
                failures += 1;
                continue;
            }
        };
        let reference_duration = start.elapsed();

        let start = Instant::now();
        let actual = match run_model(&device, &registry, &architecture, options, &image) {
            Ok(output) => output,
            Err(e) => {
                eprintln!("✗ Error running GPU engine for {name}: {e}");
                failures += 1;
                continue;
            }
        };
        let gpu_duration = start.elapsed();

        match compare_images(&reference, &actual, args.tolerance) {
            CompareResult::Match => {
                println!("✓ Outputs match for model {name} (CPU: {reference_duration:.2?}, GPU: {gpu_duration:.2?})");
            }
            CompareResult::DimensionMismatch {
                reference_dimensions,
                actual_dimensions,
            } => {
                eprintln!("✗ Dimension mismatch for model {name}: CPU {reference_dimensions:?}, GPU {actual_dimensions:?}");
                failures += 1;
            }
            CompareResult::PixelMismatch {
                max_difference,
                mismatched_pixels,
            } => {
                eprintln!("✗ Pixel mismatch for model {name}: {mismatched_pixels} pixels, max difference {max_difference}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} of {} models failed verification", args.models.len()).into());
    }
    Ok(())
}
