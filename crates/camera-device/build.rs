//! Build script for the camera device crate
//!
//! Links the Vimba C API when the `vimba` feature is enabled.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=VIMBA_HOME");

    if env::var_os("CARGO_FEATURE_VIMBA").is_none() {
        return;
    }

    // Vimba installs one dynamic library directory per platform
    if let Some(home) = env::var_os("VIMBA_HOME") {
        let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
        let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

        let lib_dir = match (target_os.as_str(), target_arch.as_str()) {
            ("windows", "x86_64") => PathBuf::from(&home).join("VimbaC").join("Lib").join("Win64"),
            ("windows", _) => PathBuf::from(&home).join("VimbaC").join("Lib").join("Win32"),
            (_, "aarch64") => PathBuf::from(&home).join("VimbaC").join("DynamicLib").join("arm_64bit"),
            (_, "arm") => PathBuf::from(&home).join("VimbaC").join("DynamicLib").join("arm_32bit"),
            _ => PathBuf::from(&home).join("VimbaC").join("DynamicLib").join("x86_64bit"),
        };

        println!("cargo:rustc-link-search=native={}", lib_dir.display());
    }

    println!("cargo:rustc-link-lib=dylib=VmbC");
}
