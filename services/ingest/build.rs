//! Build script for the inference client.
//!
//! The generated client lives in `src/nier.inference.v1.rs` and is checked in,
//! so protoc is only needed when the "regenerate-proto" feature is enabled.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/inference.proto");

    #[cfg(feature = "regenerate-proto")]
    {
        tonic_build::configure()
            .build_server(false)
            .build_client(true)
            .bytes(["."])
            .out_dir("src/")
            .compile(&["proto/inference.proto"], &["proto/"])?;
    }

    Ok(())
}
