//! chunkup command-line entry point.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunkup_engine::{UploadManager, UploadStatus};
use chunkup_protocol::{PersistedState, UploadDescriptor};

#[derive(Parser)]
#[command(name = "chunkup", version)]
#[command(about = "Resumable chunked uploads to pre-signed URLs", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, resuming from the last acknowledged chunk
    Upload {
        file: PathBuf,
        url: String,

        /// Ignore any saved offset and start from byte 0
        #[arg(long)]
        force_restart: bool,

        /// Override the configured chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Content-Type sent with every chunk
        #[arg(long)]
        content_type: Option<String>,

        /// Do not send the client origin header
        #[arg(long)]
        no_origin: bool,
    },

    /// List uploads that can be resumed
    Pending,

    /// Forget the saved offset of a file
    Forget { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let engine_config = config::load(&config_path)?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let manager = UploadManager::from_config(&engine_config)?;

    let result = match cli.command {
        Commands::Upload {
            file,
            url,
            force_restart,
            chunk_size,
            content_type,
            no_origin,
        } => {
            let mut descriptor = engine_config
                .descriptor(std::path::absolute(&file)?, url)
                .with_telemetry_opt_out(no_origin);
            if let Some(size) = chunk_size {
                descriptor = descriptor.with_chunk_size(size);
            }
            if let Some(content_type) = content_type {
                descriptor = descriptor.with_content_type(content_type);
            }
            upload_command(&manager, descriptor, force_restart).await
        }
        Commands::Pending => pending_command(&manager).await,
        Commands::Forget { file } => forget_command(&manager, file).await,
    };

    manager.shutdown().await?;
    result
}

async fn upload_command(
    manager: &UploadManager,
    descriptor: UploadDescriptor,
    force_restart: bool,
) -> Result<()> {
    let file = descriptor.key();
    let handle = manager.handle(descriptor);
    handle.add_progress_listener(|p| {
        info!(
            uploaded = p.bytes_uploaded,
            in_flight = p.bytes_in_flight,
            total = p.total_bytes,
            "{:.1}%",
            p.fraction() * 100.0
        );
    });

    handle.start(force_restart).await?;
    let mut status_rx = handle
        .subscribe_status()
        .context("upload was not registered")?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, pausing upload");
            handle.pause().await?;
            handle.status()
        }
        status = settled(&mut status_rx) => status,
    };

    match outcome {
        UploadStatus::Succeeded(progress) => {
            println!("uploaded {file} ({} bytes)", progress.total_bytes);
            Ok(())
        }
        UploadStatus::Failed { error, progress } => {
            anyhow::bail!(
                "upload of {file} failed at byte {} ({:?}): {error}",
                progress.bytes_uploaded,
                error.kind()
            )
        }
        UploadStatus::Paused(progress) => {
            println!(
                "paused {file} at {} of {} bytes; run the same command to resume",
                progress.bytes_uploaded, progress.total_bytes
            );
            Ok(())
        }
        other => anyhow::bail!("upload of {file} stopped in state {other:?}"),
    }
}

/// Waits until the job finishes or is paused.
async fn settled(rx: &mut watch::Receiver<UploadStatus>) -> UploadStatus {
    loop {
        let status = rx.borrow_and_update().clone();
        if status.is_terminal() || matches!(status, UploadStatus::Paused(_)) {
            return status;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

async fn pending_command(manager: &UploadManager) -> Result<()> {
    let entries = manager.recoverable().await?;
    if entries.is_empty() {
        println!("no resumable uploads");
        return Ok(());
    }

    for entry in entries {
        let saved = DateTime::from_timestamp_millis(entry.saved_at_epoch_ms)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".into());
        let state = match entry.state {
            PersistedState::WasRunning => "interrupted",
            PersistedState::WasPaused => "paused",
        };
        println!(
            "{}  {state}  resume at byte {}  saved {saved}",
            entry.key,
            entry.resume_offset()
        );
    }
    Ok(())
}

async fn forget_command(manager: &UploadManager, file: PathBuf) -> Result<()> {
    let key = std::path::absolute(&file)?.to_string_lossy().into_owned();
    let known = manager.store().get(&key).is_some();
    let was_running = manager.cancel(&key).await?;

    if known || was_running {
        println!("forgot {key}");
    } else {
        println!("nothing saved for {key}");
    }
    Ok(())
}
