//! Build script for the nnpp-wgpu crate
//!
//! Validates the layer kernel program with naga and embeds a minified copy of it, so that a
//! malformed kernel fails the build instead of the first model load.

const SHADER_PATH: &str = "src/shaders/nn_layers.wgsl";

/// Minifies WGSL shader source code
///
/// Parses and validates the module with naga, then regenerates it in compact form. Entry point
/// names are preserved by the minifier.
fn minify_wgsl(shader: &str) -> String {
    let mut module = match naga::front::wgsl::parse_str(shader) {
        Ok(module) => module,
        Err(error) => panic!("Failed to parse {SHADER_PATH}:\n{}", error.emit_to_string(shader)),
    };

    wgsl_minifier::minify_module(&mut module);

    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    let info = validator.validate(&module).expect("Layer kernel program failed validation");
    let output = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty()).expect("Failed to write minified WGSL");

    wgsl_minifier::minify_wgsl_source(&output)
}

fn main() {
    println!("cargo:rerun-if-changed={SHADER_PATH}");

    let source = std::fs::read_to_string(SHADER_PATH).expect("Failed to read layer kernel program");
    let minified = minify_wgsl(&source);

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let output_path = std::path::PathBuf::from(out_dir).join("nn_layers.wgsl");
    std::fs::write(output_path, minified).expect("Failed to write nn_layers.wgsl");
}
