use std::env;
use std::path::{Path, PathBuf};

/// Default header locations for one target architecture.
fn default_include_dirs(triple: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/cuda/include"),
        PathBuf::from(format!("/usr/include/{}-linux-gnu", triple)),
        PathBuf::from("/opt/frameworks/tensorrt/include"),
        PathBuf::from("/usr/include"),
    ]
}

/// Default library locations for one target architecture.
fn default_library_dirs(triple: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/cuda/lib64"),
        PathBuf::from("/opt/frameworks/tensorrt/lib"),
        PathBuf::from(format!("/usr/lib/{}-linux-gnu", triple)),
    ]
}

fn main() {
    println!("cargo:rerun-if-env-changed=TENSORRT_DIR");
    println!("cargo:rerun-if-env-changed=CUDA_ROOT");
    println!("cargo:rerun-if-env-changed=TRTBIND_INCLUDE_PATH");
    println!("cargo:rerun-if-env-changed=TRTBIND_LIBRARY_PATH");
    println!("cargo:rustc-check-cfg=cfg(trtb_onnx_parser)");

    // Check if we're in mock mode
    if env::var("CARGO_FEATURE_MOCK").is_ok() {
        println!("cargo:warning=Building in MOCK mode - no TensorRT required");
        return;
    }

    println!("cargo:rerun-if-changed=wrapper.hpp");
    println!("cargo:rerun-if-changed=wrapper.cpp");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    if target_os != "linux" {
        panic!("trtbind-sys supports Linux targets only (target os: {})", target_os);
    }
    let triple = match target_arch.as_str() {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => panic!(
            "trtbind-sys supports x86_64 and aarch64 only (target arch: {})",
            other
        ),
    };

    let (include_dirs, library_dirs) = search_dirs(triple);

    let mut missing = Vec::new();
    for header in ["NvInfer.h", "cuda_runtime_api.h"] {
        if find_file(&include_dirs, |name| name == header).is_none() {
            missing.push(header.to_string());
        }
    }
    for lib in ["nvinfer", "cudart"] {
        if find_library(&library_dirs, lib).is_none() {
            missing.push(format!("lib{}", lib));
        }
    }
    if !missing.is_empty() {
        panic!(
            "TensorRT/CUDA components not found: {}\n  searched includes: {:?}\n  searched libraries: {:?}\n  \
             set TENSORRT_DIR / CUDA_ROOT or enable the `mock` feature",
            missing.join(", "),
            include_dirs,
            library_dirs
        );
    }

    for dir in &library_dirs {
        if dir.is_dir() {
            println!("cargo:rustc-link-search=native={}", dir.display());
        }
    }
    println!("cargo:rustc-link-lib=dylib=nvinfer");
    println!("cargo:rustc-link-lib=dylib=cudart");

    // Engines can still be loaded from artifacts without the parser
    let onnx_parser = find_file(&include_dirs, |name| name == "NvOnnxParser.h").is_some()
        && find_library(&library_dirs, "nvonnxparser").is_some();
    if onnx_parser {
        println!("cargo:rustc-link-lib=dylib=nvonnxparser");
        println!("cargo:rustc-cfg=trtb_onnx_parser");
    } else {
        println!("cargo:warning=NvOnnxParser not found - building from ONNX is disabled");
    }
    println!("cargo:rustc-link-lib=dylib=stdc++");

    let existing_includes: Vec<&PathBuf> = include_dirs.iter().filter(|d| d.is_dir()).collect();

    // Build C++ wrapper
    let mut build = cc::Build::new();
    build
        .cpp(true)
        .file("wrapper.cpp")
        .flag("-std=c++17")
        .flag_if_supported("-Wno-sign-compare")
        .flag_if_supported("-Wno-unused-function")
        .opt_level(3);
    if onnx_parser {
        build.define("TRTB_HAVE_ONNX_PARSER", None);
    }
    for dir in &existing_includes {
        build.include(dir);
    }
    build.compile("trtbind_wrapper");

    // Generate bindings
    let mut builder = bindgen::Builder::default()
        .header("wrapper.hpp")
        .allowlist_function("trtb_.*")
        .allowlist_type("Trtb.*")
        .allowlist_var("TRTB_.*")
        .default_macro_constant_type(bindgen::MacroTypeVariation::Signed)
        .derive_debug(true)
        .derive_default(true)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));
    for dir in &existing_includes {
        builder = builder.clang_arg(format!("-I{}", dir.display()));
    }
    let bindings = builder.generate().expect("Unable to generate bindings");

    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}

/// Explicit overrides first, then the fixed per-architecture defaults.
fn search_dirs(triple: &str) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut include_dirs = Vec::new();
    let mut library_dirs = Vec::new();

    if let Ok(dir) = env::var("TENSORRT_DIR") {
        include_dirs.push(Path::new(&dir).join("include"));
        library_dirs.push(Path::new(&dir).join("lib"));
    }
    if let Ok(dir) = env::var("CUDA_ROOT") {
        include_dirs.push(Path::new(&dir).join("include"));
        library_dirs.push(Path::new(&dir).join("lib64"));
    }
    if let Some(paths) = env::var_os("TRTBIND_INCLUDE_PATH") {
        include_dirs.extend(env::split_paths(&paths));
    }
    if let Some(paths) = env::var_os("TRTBIND_LIBRARY_PATH") {
        library_dirs.extend(env::split_paths(&paths));
    }

    include_dirs.extend(default_include_dirs(triple));
    library_dirs.extend(default_library_dirs(triple));
    (include_dirs, library_dirs)
}

fn find_library(dirs: &[PathBuf], lib: &str) -> Option<PathBuf> {
    let prefix = format!("lib{}.so", lib);
    find_file(dirs, |name| name.starts_with(&prefix))
}

fn find_file(dirs: &[PathBuf], matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
            let name = entry.file_name();
            matches(name.to_str()?).then(|| entry.path())
        })
    })
}
