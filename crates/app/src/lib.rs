use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use slomo_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use slomo_core::inference::InferenceBackend;
use slomo_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use slomo_core::{run_job, JobConfig, JobReport, SlomoError};

#[derive(Parser, Debug)]
#[command(
    name = "slomo",
    about = "Convert a video to slow motion with flow-based frame interpolation"
)]
struct Cli {
    #[arg(long, help = "Source video")]
    video: PathBuf,

    #[arg(long, help = "Checkpoint directory, or the flow model with the refinement model beside it")]
    checkpoint: PathBuf,

    #[arg(long, default_value_t = 30.0, help = "Frame rate of the output video")]
    fps: f64,

    #[arg(long = "sf", help = "Slomo factor: output frames per original frame interval")]
    slomo_factor: u32,

    #[arg(long, default_value_t = 1, help = "Frame pairs per network batch")]
    batch_size: usize,

    #[arg(long, default_value = "output.mp4")]
    output: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory holding ffmpeg and ffprobe")]
    ffmpeg_dir: Option<PathBuf>,

    #[arg(long, value_name = "BACKEND", help = "Inference backend: cpu, cuda or tensorrt")]
    backend: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

impl Cli {
    fn job_config(&self) -> JobConfig {
        JobConfig {
            video: self.video.clone(),
            checkpoint: self.checkpoint.clone(),
            output: self.output.clone(),
            fps: self.fps,
            slomo_factor: self.slomo_factor,
            batch_size: self.batch_size,
        }
    }

    fn backend_override(&self) -> Result<Option<InferenceBackend>, SlomoError> {
        self.backend
            .as_deref()
            .map(|raw| {
                raw.parse::<InferenceBackend>()
                    .map_err(|e| SlomoError::InvalidConfiguration(format!("--backend: {e:#}")))
            })
            .transpose()
    }

    /// Command-line values win over `config.toml`.
    fn apply_overrides(&self, config: &mut AppConfig, backend: Option<InferenceBackend>) {
        if let Some(dir) = &self.ffmpeg_dir {
            config.paths.ffmpeg_dir = Some(dir.clone());
        }
        if let Some(backend) = backend {
            config.inference.backend = backend;
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();

    // Reject bad arguments before the data directory or any log file is created.
    let job = cli.job_config();
    job.validate()?;
    let backend = cli.backend_override()?;

    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    slomo_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    slomo_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    initialize_data_dir(&resolved_data_dir)?;
    let mut config = AppConfig::load_from_path(&config_path(&resolved_data_dir))?;
    config.resolve_paths(&resolved_data_dir);
    cli.apply_overrides(&mut config, backend);

    let cancel_token = CancellationToken::new();
    let interrupt_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current batch");
            interrupt_token.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || run_job(&job, &config, Some(cancel_token)))
        .await
        .context("conversion task panicked")??;
    log_report(&report);
    Ok(())
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash report hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be written to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable; continuing without crash reports"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn log_report(report: &JobReport) {
    let summary = &report.summary;
    let secs = summary.elapsed.as_secs_f64();
    info!(
        output = %report.output.display(),
        input_frames = summary.input_frames,
        output_frames = summary.output_frames,
        source = %report.probe.dims,
        elapsed = %format_duration(secs),
        fps = format!("{:.2}", compute_output_fps(summary.output_frames, secs)),
        "Done"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn compute_output_fps(frames: u64, elapsed: f64) -> f64 {
    if elapsed > 0.0 {
        frames as f64 / elapsed
    } else {
        0.0
    }
}


#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(61.4), "00:01:01");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn output_fps_is_zero_without_elapsed_time() {
        assert_eq!(compute_output_fps(100, 0.0), 0.0);
        assert_eq!(compute_output_fps(100, 4.0), 25.0);
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("slomo_core=trace"));
        assert_eq!(selected, "slomo_core=trace");
    }
}
