use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/mla_runtime.proto"], &["proto"])?;
    Ok(())
}
