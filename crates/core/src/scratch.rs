use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

pub const SCRATCH_PREFIX: &str = ".tmpSlomo";

/// Per-run scratch directory holding `input/` (decoded originals) and `output/`
/// (sequenced frames). Removed with its contents when dropped, on success or failure.
#[derive(Debug)]
pub struct ScratchWorkspace {
    root: TempDir,
    input: PathBuf,
    output: PathBuf,
}

impl ScratchWorkspace {
    pub fn create_in(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create scratch parent {}", parent.display()))?;
        let root = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(parent)
            .with_context(|| format!("failed to create scratch directory in {}", parent.display()))?;
        let input = root.path().join("input");
        let output = root.path().join("output");
        for dir in [&input, &output] {
            fs::create_dir(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        debug!(root = %root.path().display(), "created scratch workspace");
        Ok(Self {
            root,
            input,
            output,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn input_dir(&self) -> &Path {
        &self.input
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    /// Remove the workspace now and report a failure instead of swallowing it.
    pub fn cleanup(self) -> Result<()> {
        let path = self.root.path().to_path_buf();
        self.root
            .close()
            .with_context(|| format!("failed to remove scratch directory {}", path.display()))
    }
}

/// Remove the workspace, logging rather than failing the run when that does not work.
pub fn cleanup_quietly(workspace: ScratchWorkspace) {
    if let Err(e) = workspace.cleanup() {
        warn!("{e:#}");
    }
}

/// Run `stage` inside a fresh workspace under `parent`. The workspace is removed
/// whatever `stage` returns.
pub fn with_scratch<T>(
    parent: &Path,
    stage: impl FnOnce(&ScratchWorkspace) -> Result<T>,
) -> Result<T> {
    let workspace = ScratchWorkspace::create_in(parent)?;
    let result = stage(&workspace);
    cleanup_quietly(workspace);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_removal() {
        let parent = tempfile::tempdir().expect("parent");
        let workspace = ScratchWorkspace::create_in(parent.path()).expect("workspace");
        let root = workspace.path().to_path_buf();

        assert!(root
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SCRATCH_PREFIX)));
        assert!(workspace.input_dir().is_dir());
        assert!(workspace.output_dir().is_dir());
        fs::write(workspace.output_dir().join("1.jpg"), b"x").expect("write frame");

        workspace.cleanup().expect("cleanup");
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let parent = tempfile::tempdir().expect("parent");
        let root = {
            let workspace = ScratchWorkspace::create_in(parent.path()).expect("workspace");
            fs::write(workspace.input_dir().join("000001.jpg"), b"x").expect("write frame");
            workspace.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn test_with_scratch_removes_workspace_when_stage_fails() {
        let parent = tempfile::tempdir().expect("parent");
        let mut seen = None;
        let result: Result<()> = with_scratch(parent.path(), |workspace| {
            fs::write(workspace.output_dir().join("1.jpg"), b"x")?;
            seen = Some(workspace.path().to_path_buf());
            anyhow::bail!("stage failed")
        });

        assert!(result.unwrap_err().to_string().contains("stage failed"));
        assert!(!seen.expect("stage ran").exists());
        assert_eq!(fs::read_dir(parent.path()).expect("list parent").count(), 0);
    }

    #[test]
    fn test_with_scratch_returns_stage_value() {
        let parent = tempfile::tempdir().expect("parent");
        let frames = with_scratch(parent.path(), |workspace| {
            fs::write(workspace.input_dir().join("000001.jpg"), b"x")?;
            Ok(fs::read_dir(workspace.input_dir())?.count())
        })
        .expect("stage succeeds");
        assert_eq!(frames, 1);
        assert_eq!(fs::read_dir(parent.path()).expect("list parent").count(), 0);
    }

    #[test]
    fn test_runs_get_distinct_directories() {
        let parent = tempfile::tempdir().expect("parent");
        let a = ScratchWorkspace::create_in(parent.path()).expect("first");
        let b = ScratchWorkspace::create_in(parent.path()).expect("second");
        assert_ne!(a.path(), b.path());
    }
}
