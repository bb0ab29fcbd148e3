fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::env::var("OUT_DIR")?;
    let descriptor_path = std::path::Path::new(&out_dir).join("gpupgrade_descriptor.bin");

    // Both services (CliToHub, Agent) live in the same package.
    tonic_prost_build::configure()
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&["proto/gpupgrade.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/gpupgrade.proto");

    Ok(())
}
