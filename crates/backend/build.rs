//! Кладет `config.toml` из корня workspace рядом с собранным бинарником,
//! откуда его читает `shared::config::load_config`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn profile_dir() -> Option<PathBuf> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").ok()?);
    let profile = env::var("PROFILE").ok()?;
    // OUT_DIR: target/<profile>/build/backend-xxx/out
    out_dir
        .ancestors()
        .find(|p| p.ends_with(&profile))
        .map(Path::to_path_buf)
}

fn main() {
    println!("cargo:rerun-if-changed=../../config.toml");

    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config.toml");
    if !source.exists() {
        println!("cargo:warning=config.toml not found, the embedded default will be used");
        return;
    }

    let Some(target_dir) = profile_dir() else {
        println!("cargo:warning=Cannot locate target profile directory, config.toml not copied");
        return;
    };

    if let Err(e) = fs::copy(&source, target_dir.join("config.toml")) {
        println!("cargo:warning=Failed to copy config.toml: {}", e);
    }
}
