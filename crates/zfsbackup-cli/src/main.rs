//! zfsbackup CLI - ZFS snapshot stream backup to multiple destinations.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use zfsbackup::{backup, list_snapshots, process_smart_options, BackupError, Config, JobInfo};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "zfsbackup")]
#[command(about = "ZFS snapshot stream backup to multiple destinations")]
#[command(version)]
struct Cli {
    /// Path to YAML or JSON configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the most recent snapshot of a dataset
    Backup {
        /// Dataset to back up (e.g. tank/data)
        volume: String,

        /// Force a full backup
        #[arg(long)]
        full: bool,

        /// Incremental from the most recent backed-up snapshot
        #[arg(long)]
        incremental: bool,

        /// Incremental unless the last full backup is older than this many hours
        #[arg(long, value_name = "HOURS")]
        full_if_older_than: Option<u64>,

        /// Continue the prior partial attempt
        #[arg(long)]
        resume: bool,

        /// Override the target volume size in MiB
        #[arg(long)]
        volume_size: Option<u64>,

        /// Override the staged volume file bound (0 selects pipe mode)
        #[arg(long)]
        max_file_buffer: Option<usize>,

        /// Override the global upload concurrency bound
        #[arg(long)]
        max_parallel_uploads: Option<usize>,
    },

    /// List snapshots of a dataset, newest first
    Snapshots {
        /// Dataset to inspect
        volume: String,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BackupError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| BackupError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Cancel on SIGINT/SIGTERM so in-flight uploads unwind cleanly.
    let cancel = setup_signal_handler()?;

    match cli.command {
        Commands::Backup {
            volume,
            full,
            incremental,
            full_if_older_than,
            resume,
            volume_size,
            max_file_buffer,
            max_parallel_uploads,
        } => {
            let modes = [full, incremental, full_if_older_than.is_some()];
            if modes.iter().filter(|m| **m).count() != 1 {
                return Err(BackupError::Config(
                    "exactly one of --full, --incremental, or --full-if-older-than is required"
                        .into(),
                ));
            }

            // Apply overrides, then re-validate (pipe mode restricts the
            // destination count) and fill remaining knobs.
            if let Some(size) = volume_size {
                config.pipeline.volume_size_mib = Some(size);
            }
            if let Some(buffers) = max_file_buffer {
                config.pipeline.max_file_buffer = Some(buffers);
            }
            if let Some(uploads) = max_parallel_uploads {
                config.pipeline.max_parallel_uploads = Some(uploads);
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let mut job = JobInfo::new(volume, &config);
            job.full = full;
            job.incremental = incremental;
            job.full_if_older_than =
                full_if_older_than.map(|hours| Duration::from_secs(hours * 3600));
            job.resume = resume;

            process_smart_options(&mut job, &config).await?;

            let summary = backup(&config, job, cancel).await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                println!("\nBackup completed!");
                println!("  Dataset: {}", summary.volume_name);
                println!("  Stream bytes: {}", summary.stream_bytes);
                println!("  Bytes written: {}", summary.bytes_written);
                println!(
                    "  Files uploaded: {} ({} volumes + manifest)",
                    summary.volumes_uploaded + 1,
                    summary.volumes_uploaded
                );
                println!("  Destinations: {}", summary.destinations.join(", "));
                println!("  Duration: {:.2}s", summary.elapsed_seconds);
            }
        }

        Commands::Snapshots { volume } => {
            let snapshots = list_snapshots(&config.zfs.path, &volume).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                for snapshot in snapshots {
                    println!("{}@{}\t{}", volume, snapshot.name, snapshot.creation_time);
                }
            }
        }

        Commands::Validate => {
            // Config::load already validated; report success.
            println!("Configuration is valid ({} destinations)", config.destinations.len());
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (service managers).
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel = CancellationToken::new();

    let token_int = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                eprintln!("Failed to setup SIGINT handler: {}", e);
                return;
            }
        };
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Shutting down gracefully...");
        token_int.cancel();
    });

    let token_term = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                eprintln!("Failed to setup SIGTERM handler: {}", e);
                return;
            }
        };
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Shutting down gracefully...");
        token_term.cancel();
    });

    Ok(cancel)
}

#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });
    Ok(cancel)
}
