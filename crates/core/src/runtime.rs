use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// Directories probed for `libonnxruntime` and the CUDA/TensorRT libraries, in order:
/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then `/usr/local/lib` and `/usr/lib` on unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

/// Directories probed for ffmpeg/ffprobe before falling back to `PATH`.
fn candidate_bin_dirs(preferred: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = preferred {
        push_unique(&mut dirs, dir.to_path_buf());
    }
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn candidate_binary_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Build a `Command` for `binary`, preferring `preferred_dir` (the configured ffmpeg
/// directory), then the executable's own directory and `./bin`, then `PATH`.
pub fn command_for(binary: &str, preferred_dir: Option<&Path>) -> Command {
    match find_binary_in_dirs(binary, &candidate_bin_dirs(preferred_dir)) {
        Some(path) => {
            debug!(binary, path = %path.display(), "resolved bundled binary");
            Command::new(path)
        }
        None => Command::new(binary),
    }
}

/// Load-priority tier for GPU runtime libraries, `None` for anything not preloaded.
///
/// ORT provider libraries are excluded: they need symbols from `libonnxruntime`,
/// which the `ort` crate loads itself.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
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

#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Preload CUDA, then cuDNN, then TensorRT libraries with their absolute paths.
///
/// glibc reads `LD_LIBRARY_PATH` once at startup, so setting it later has no effect on
/// the `dlopen` calls ORT makes. The first directory holding a given file name wins.
fn preload_libs_from_dirs(dirs: &[PathBuf]) {
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            if !is_candidate_lib(&name, &path) || libs.iter().any(|(_, seen, _)| *seen == name) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for (_, _, path) in &libs {
        unsafe { load_library(path) };
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled onnxruntime and preload GPU libraries.
///
/// Call at the very start of `main()`, before any ORT or tracing initialization.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|candidate| candidate.is_file())
        {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }
    preload_libs_from_dirs(&dirs);
}

/// Log which onnxruntime library will be used. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }
}
