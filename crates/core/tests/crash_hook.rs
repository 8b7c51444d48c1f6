use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use slomo_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "SLOMO_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "SLOMO_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("data dir must be set"));

    let first = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(first, PanicHookInstallPlan::Installed { .. }));
    let second = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(second, PanicHookInstallPlan::AlreadyInstalled { .. }));

    match mode.as_str() {
        "write_success" => panic!("intentional panic during interpolation"),
        "write_failure" => {
            let crash_dir = crash_dir(&data_dir);
            fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic with unwritable crash dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_report() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let mut reports: Vec<PathBuf> = fs::read_dir(crash_dir(data_dir.path()))
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect();
    reports.sort();
    let newest = reports.last().expect("expected a crash report");
    let contents = fs::read_to_string(newest).expect("read crash report");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=intentional panic during interpolation"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_unwritable_crash_dir_warns_without_repanicking() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic with unwritable crash dir"));
    assert!(stderr.contains("Warning: failed to write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
