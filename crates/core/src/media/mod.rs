//! ffmpeg/ffprobe subprocesses and the on-disk numbered frame store.

pub mod decode;
pub mod encode;
pub mod frames;
pub mod probe;

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::logging::{FFMPEG_DECODE_TARGET, FFMPEG_ENCODE_TARGET};

pub use decode::extract_frames;
pub use encode::encode_video;
pub use frames::{NumberedFrames, NumberedImageSink};
pub use probe::{probe_video, VideoProbe};

/// Lines of ffmpeg stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Where the ffmpeg binaries are looked up first.
#[derive(Debug, Clone, Default)]
pub struct MediaTools {
    pub ffmpeg_dir: Option<PathBuf>,
}

impl MediaTools {
    pub fn new(ffmpeg_dir: Option<PathBuf>) -> Self {
        Self { ffmpeg_dir }
    }

    pub fn command(&self, binary: &str) -> Command {
        crate::runtime::command_for(binary, self.ffmpeg_dir.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StderrTarget {
    Decode,
    Encode,
}

/// Outcome of a finished ffmpeg run.
struct FfmpegRun {
    status: ExitStatus,
    stderr_tail: Vec<String>,
}

impl FfmpegRun {
    fn failure_reason(&self) -> String {
        if self.stderr_tail.is_empty() {
            format!("ffmpeg exited with {}", self.status)
        } else {
            format!(
                "ffmpeg exited with {}: {}",
                self.status,
                self.stderr_tail.join(" | ")
            )
        }
    }
}

/// Run ffmpeg to completion, streaming stderr to the decode or encode log target
/// and keeping its last few lines.
fn run_ffmpeg(tools: &MediaTools, args: &[String], target: StderrTarget) -> Result<FfmpegRun> {
    debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching ffmpeg");

    let mut child = tools
        .command("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg, is it installed?")?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stderr"))?;
    let drain = thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    match target {
                        StderrTarget::Decode => debug!(target: FFMPEG_DECODE_TARGET, "{}", line),
                        StderrTarget::Encode => debug!(target: FFMPEG_ENCODE_TARGET, "{}", line),
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(target: FFMPEG_DECODE_TARGET, "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        tail.into_iter().collect::<Vec<String>>()
    });

    let status = child.wait().context("failed to wait for ffmpeg")?;
    let stderr_tail = drain.join().unwrap_or_default();
    Ok(FfmpegRun {
        status,
        stderr_tail,
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
