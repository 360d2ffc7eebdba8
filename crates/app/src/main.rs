// Logging behavior:
// - Writes logs to both stderr and a daily-rotated file at logs/streamboard.log.
// - Default log level is INFO. Control via RUST_LOG:
//   * RUST_LOG=info                          # standard logging (default)
//   * RUST_LOG=debug                          # verbose, includes per-chunk detail
//   * RUST_LOG=streamboard_runtime=trace       # fine-grained per-crate control
// - The logs/ directory is created on startup if missing; file output uses a
//   non-blocking writer so a slow disk can't stall the board.
mod config;
mod processors;

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{InputSource, Settings};
use processors::{BandpassFilterProcessor, PersistProcessor, FILTERED_KEY, SIGNAL_KEY};
use streamboard_foundation::shutdown::ShutdownHandler;
use streamboard_io::generators::{NoiseGenerator, SineGenerator};
use streamboard_io::hdf::RotatingFileSink;
use streamboard_io::microphone::MicrophoneSource;
use streamboard_io::network::NetworkServer;
use streamboard_io::wav::WavSource;
use streamboard_runtime::{Board, SubscriptionOrder};

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "streamboard.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    let file_layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Prune rotated log files in `logs/` older than `retention_days` days. A
/// retention of `Some(0)` disables pruning; `None` defaults to 7 days.
fn prune_old_logs(retention_days: Option<u64>) {
    let retention = retention_days.unwrap_or(7);
    if retention == 0 {
        tracing::debug!("log retention disabled (retention_days=0)");
        return;
    }

    let cutoff = match SystemTime::now().checked_sub(Duration::from_secs(retention * 24 * 60 * 60)) {
        Some(t) => t,
        None => return,
    };

    let logs_dir = Path::new("logs");
    if !logs_dir.exists() {
        return;
    }

    match fs::read_dir(logs_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                    if name.starts_with("streamboard.log.") {
                        if let Ok(meta) = entry.metadata() {
                            if let Ok(modified) = meta.modified() {
                                if modified < cutoff {
                                    if let Err(e) = fs::remove_file(&path) {
                                        tracing::warn!(error = %e, path = %path.display(), "failed to remove old log");
                                    } else {
                                        tracing::info!(path = %path.display(), "removed old log file");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to read logs directory for pruning"),
    }
}

#[derive(Parser, Debug)]
#[command(name = "streamboard", author, version, about = "Real-time chunk-streaming sound analysis board")]
struct Cli {
    /// Override input.source from streamboard.toml/env ("sine", "noise", "wav", "microphone")
    #[arg(long)]
    source: Option<String>,

    /// Override input.wav_path
    #[arg(long)]
    wav_path: Option<String>,

    /// Override output.network_listen_addr, e.g. "0.0.0.0:7878"
    #[arg(long)]
    network_listen_addr: Option<String>,
}

const GENERATOR_NAME: &str = "input";
const FILTER_NAME: &str = "bandpass";
const SINK_NAME: &str = "persist";

async fn start_input(board: &mut Board, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    match settings.input.source {
        InputSource::Sine => {
            let gen = SineGenerator::new(
                GENERATOR_NAME,
                settings.input.sample_rate,
                settings.input.tone_frequency,
                settings.input.amplitude,
                settings.input.chunk_size,
                None,
            );
            board.start_input_processor(GENERATOR_NAME, Box::new(gen))?;
        }
        InputSource::Noise => {
            let gen = NoiseGenerator::new(
                GENERATOR_NAME,
                settings.input.sample_rate,
                settings.input.amplitude,
                settings.input.chunk_size,
                None,
            );
            board.start_input_processor(GENERATOR_NAME, Box::new(gen))?;
        }
        InputSource::Wav => {
            let path = settings
                .input
                .wav_path
                .clone()
                .ok_or("input.source = \"wav\" requires input.wav_path")?;
            let source = WavSource::open(GENERATOR_NAME, &path, settings.input.chunk_size)?;
            board.start_input_processor(GENERATOR_NAME, Box::new(source))?;
        }
        InputSource::Microphone => {
            let source = MicrophoneSource::spawn(GENERATOR_NAME)?;
            board.start_input_processor(GENERATOR_NAME, Box::new(source))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_os = "linux")]
    std::env::set_var("PIPEWIRE_PROPS", "{ application.name=streamboard media.role=capture }");

    let _log_guard = init_logging()?;
    let retention_days = std::env::var("STREAMBOARD_LOG_RETENTION_DAYS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok());
    prune_old_logs(retention_days);
    tracing::info!("starting streamboard");

    let cli = Cli::parse();
    let mut settings = Settings::new().unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });

    if let Some(source) = &cli.source {
        settings.input.source = match source.to_lowercase().as_str() {
            "sine" => InputSource::Sine,
            "noise" => InputSource::Noise,
            "wav" => InputSource::Wav,
            "microphone" | "mic" => InputSource::Microphone,
            other => return Err(format!("unknown --source '{other}'").into()),
        };
    }
    if cli.wav_path.is_some() {
        settings.input.wav_path = cli.wav_path;
    }
    if cli.network_listen_addr.is_some() {
        settings.output.network_listen_addr = cli.network_listen_addr;
    }

    settings
        .validate()
        .map_err(|e| format!("invalid configuration: {e}"))?;

    let shutdown = ShutdownHandler::new().install().await;

    let mut board = Board::new();
    let metrics = board.metrics();

    start_input(&mut board, &settings).await?;

    let filter = BandpassFilterProcessor::new(
        FILTER_NAME,
        settings.filter.filter_len,
        settings.filter.target_latency_seconds,
        settings.input.sample_rate,
    );
    board.start_processor(FILTER_NAME, Box::new(filter))?;
    board
        .subscribe_to_processor(SubscriptionOrder::new(GENERATOR_NAME, FILTER_NAME, SIGNAL_KEY, SIGNAL_KEY))
        .await?;

    let sink = RotatingFileSink::open(
        &settings.output.directory,
        &settings.output.file_stem,
        settings.output.max_file_bytes,
    )?;
    let persist = PersistProcessor::new(SINK_NAME, FILTERED_KEY, Box::new(sink));
    board.start_processor(SINK_NAME, Box::new(persist))?;
    board
        .subscribe_to_processor(SubscriptionOrder::new(FILTER_NAME, SINK_NAME, FILTERED_KEY, FILTERED_KEY))
        .await?;

    if let Some(addr) = settings.output.network_listen_addr.clone() {
        let net_rx = board.get_connection_to_processor(FILTER_NAME, FILTERED_KEY).await?;
        let net_metrics = metrics.clone();
        tokio::spawn(async move {
            match NetworkServer::bind(&addr).await {
                Ok(server) => {
                    if let Err(e) = server.with_metrics(net_metrics).run(net_rx).await {
                        tracing::error!(error = %e, "network server exited");
                    }
                }
                Err(e) => tracing::error!(error = %e, addr, "failed to bind network listener"),
            }
        });
    }

    board.start()?;
    tracing::info!(state = ?board.state(), "board running");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(30));
    tokio::select! {
        _ = shutdown.wait() => {
            tracing::debug!("shutdown signal received");
        }
        _ = async {
            loop {
                tokio::select! {
                    _ = stats_interval.tick() => {
                        let report = board.health_report();
                        tracing::info!(
                            state = ?report.state,
                            processors_alive = report.processors_alive,
                            composites_completed = report.composites_completed,
                            composites_dropped_late = report.composites_dropped_late,
                            composites_demoted_discontinuous = report.composites_demoted_discontinuous,
                            last_error = ?report.last_error,
                            "board status"
                        );
                    }
                    msg = board.supervise_once() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                }
            }
        } => {}
    }

    board.stop_all().await?;
    tracing::info!("streamboard stopped");
    Ok(())
}
