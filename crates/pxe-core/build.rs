//! Build script for pxe-core.
//!
//! Compiles the publication protobuf definitions when the `grpc` feature is
//! enabled. Without it nothing is generated, so protoc is not required.
#![allow(clippy::disallowed_methods)]
#![allow(clippy::disallowed_macros)]

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/");

    if std::env::var_os("CARGO_FEATURE_GRPC").is_none() {
        return Ok(());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/publication.proto"], &["proto/"])?;

    Ok(())
}
