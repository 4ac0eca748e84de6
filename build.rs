use std::env;
use std::path::PathBuf;

#[allow(unsafe_code)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use protoc-bin-vendored to avoid needing protoc installed
    let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
    // SAFETY: build scripts are single-threaded at this point
    unsafe { env::set_var("PROTOC", protoc) };

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let proto_dir = PathBuf::from("proto");
    let proto_file = proto_dir.join("core/plugins/v1alpha1/plugins.proto");

    if !proto_file.exists() {
        return Err(format!("Proto file not found: {}", proto_file.display()).into());
    }

    println!("cargo:rerun-if-changed={}", proto_file.display());
    println!("cargo:rerun-if-changed=build.rs");

    // Messages derive serde so the REST gateway can render them as JSON
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(rename_all = \"snake_case\")]")
        .file_descriptor_set_path(out_dir.join("portico_descriptor.bin"))
        .compile_protos(&[proto_file], &[proto_dir])?;

    Ok(())
}
