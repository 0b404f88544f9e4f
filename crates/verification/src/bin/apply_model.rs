//! Applies a model to a single image on the GPU
//!
//! ```bash
//! apply_model model.json input.png output.png --input-range signed --output-range signed
//! ```

use clap::Parser;
use nnpp_wgpu::{DeviceOptions, KernelRegistry, ModelOptions, ValueRange, WgpuDevice};
use nnpp_wgpu_verification::wgpu_helpers::run_model;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(version, about = "Apply an image-to-image CNN to a single image on the GPU")]
struct Args {
    /// Model description (JSON export with architecture and weights)
    model: PathBuf,

    /// Input image file path
    input: PathBuf,

    /// Output image file path
    output: PathBuf,

    /// Value range the model expects its input in (unit, signed)
    #[arg(long, default_value = "signed")]
    input_range: String,

    /// Value range the model produces (unit, signed)
    #[arg(long, default_value = "signed")]
    output_range: String,
}

fn parse_range(name: &str, value: &str) -> ValueRange {
    match value.to_lowercase().as_str() {
        "unit" => ValueRange::Unit,
        "signed" => ValueRange::Signed,
        _ => {
            eprintln!("Invalid {name} '{value}'. Valid ranges: unit, signed");
            std::process::exit(1);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let options = ModelOptions {
        input_range: parse_range("input range", &args.input_range),
        output_range: parse_range("output range", &args.output_range),
    };

    tracing::info!(model = %args.model.display(), "Loading model");
    let architecture = nnpp_wgpu_model::load_architecture(&args.model)?;

    let image = image::open(&args.input)?.to_rgba8();
    let (width, height) = image.dimensions();
    tracing::info!(input = %args.input.display(), width, height, "Loaded input image");

    let shapes = architecture.propagate(height, width);
    for (layer, shape) in architecture.layers.iter().zip(&shapes[1..]) {
        tracing::info!(layer = %layer.name, %shape, "Layer output");
    }

    let device = Arc::new(WgpuDevice::request(&DeviceOptions::default())?);
    let registry = Arc::new(KernelRegistry::new(device.as_ref())?);

    let start = Instant::now();
    let output = run_model(&device, &registry, &architecture, options, &image)?;
    tracing::info!(elapsed = ?start.elapsed(), "Inference finished");

    output.save(&args.output)?;
    println!("Saved {}x{} output to {}", output.width(), output.height(), args.output.display());

    Ok(())
}
