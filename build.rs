//! Build script for testgen

use std::env;
use std::path::Path;

fn main() {
    if env::var("DOCS_RS").is_ok() {
        return;
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LIBTORCH");

    // With LIBTORCH_USE_PYTORCH or no LIBTORCH set, tch-rs handles libtorch setup
    if env::var("LIBTORCH_USE_PYTORCH").is_ok() {
        return;
    }
    let Ok(libtorch_path) = env::var("LIBTORCH") else {
        return;
    };

    let lib_dir = Path::new(&libtorch_path).join("lib");
    if !lib_dir.exists() {
        println!(
            "cargo:warning=LIBTORCH is set but {} does not exist",
            lib_dir.display()
        );
        return;
    }

    // Configure linking
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-env=LIBTORCH_STATIC=0");
    println!("cargo:rustc-env=LIBTORCH_BYPASS_VERSION_CHECK=1");
}
