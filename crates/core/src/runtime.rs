//! ONNX Runtime and CUDA library discovery.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` is located at run
//! time. CUDA and cuDNN are preloaded so the CUDA execution provider resolves
//! them from the process instead of the loader's cached search path.

use std::collections::HashSet;
use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    /// `ORT_DYLIB_PATH` after setup, whether we set it or it was already there.
    pub ort_dylib: Option<PathBuf>,
    /// `true` if the path was discovered here rather than inherited.
    pub ort_discovered: bool,
    /// GPU runtime libraries loaded into the process, in load order.
    pub preloaded: Vec<PathBuf>,
}

/// Directories searched for runtime libraries, in priority order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn normalize_windows_path_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .to_ascii_lowercase()
}

#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs.iter().filter(|dir| dir.is_dir()) {
        if seen.insert(normalize_windows_path_key(dir)) {
            merged.push(dir.clone());
        }
    }

    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            if seen.insert(normalize_windows_path_key(&dir)) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

/// Load tier for GPU runtime libraries, `None` for anything not preloaded.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
///
/// ORT's own provider libraries are excluded; they need symbols from
/// `libonnxruntime`, which `ort` loads later.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublaslt", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_", "cufft64_", "curand64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found in `dirs`, sorted into load order.
///
/// The first directory holding a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen_names.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Keep the library mapped for the life of the process.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Locate ONNX Runtime and preload CUDA/cuDNN before any session is built.
///
/// Call once at host start-up, before `ort` is first used.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();
    let mut status = RuntimeLibStatus::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            status.ort_discovered = true;
        }

        #[cfg(windows)]
        env::set_var(
            "PATH",
            build_path_with_prepended_dirs(env::var_os("PATH"), &dirs),
        );
    }
    status.ort_dylib = env::var_os(ORT_DYLIB_ENV).map(PathBuf::from);

    for lib in collect_preload_libs(&dirs) {
        if unsafe { load_library(&lib) } {
            status.preloaded.push(lib);
        }
    }

    status
}

/// Log the outcome of [`setup_runtime_libs`]. Call after logging is initialized.
pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            discovered = status.ort_discovered,
            "ORT library"
        ),
        Some(path) => warn!(
            "{ORT_DYLIB_ENV} set to {} but file not found",
            path.display()
        ),
        None => warn!("{ORT_DYLIB_ENV} not set, ORT will try default search paths"),
    }

    if status.preloaded.is_empty() {
        debug!("No CUDA runtime libraries preloaded");
    }
    for lib in &status.preloaded {
        debug!(path = %lib.display(), "Preloaded GPU runtime library");
    }
}
