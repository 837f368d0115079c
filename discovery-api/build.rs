use glob::glob;
use std::io;
use std::path::PathBuf;

fn main() -> io::Result<()> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
    );
    let protos: Vec<PathBuf> = glob("proto/**/*.proto")
        .expect("Failed to read proto glob pattern")
        .filter_map(Result::ok)
        .collect();
    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }
    let mut config = prost_build::Config::new();
    config.disable_comments(["."]);
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_well_known_types(true)
        .include_file("mod.rs")
        .compile_protos_with_config(config, &protos, &["proto"])?;
    Ok(())
}
