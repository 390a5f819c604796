//! Pipeline coordinator.
//!
//! Wires the volume source, the destination backend chain, the completion
//! sink, and manifest finalization into one cancellable task group. The
//! first failing task cancels the shared token; every other task observes
//! cancellation at its next suspension point and unwinds.
//!
//! The chain input (`step` channel) must outlive the snapshot stream so the
//! final manifest can traverse every destination: the bridge forwards
//! volumes without ever closing it, and the finalizer closes it only after
//! the stream has finished *and* every forwarded volume has drained from
//! the tail of the chain.

pub mod manifest;
pub mod planner;
pub mod resume;
mod stream;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{
    self, keep_first_error, recv_or_cancel, send_or_cancel, Backend, BackendContext,
    DELETE_BACKEND_PREFIX,
};
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::job::JobInfo;
use crate::volume::Volume;
use crate::zfs;

/// Result of a completed backup run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub volume_name: String,
    pub stream_bytes: u64,
    pub bytes_written: u64,
    pub volumes_uploaded: usize,
    pub destinations: Vec<String>,
    pub manifest_object: String,
    pub elapsed_seconds: f64,
}

impl BackupSummary {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Run a backup: validate resume state, start the zfs send subprocess, and
/// drive the upload pipeline until the final manifest has reached every
/// destination.
pub async fn backup(
    config: &Config,
    mut job: JobInfo,
    cancel: CancellationToken,
) -> Result<BackupSummary> {
    job.send_command_line = zfs::send_command_line(&config.zfs.path, &job);

    // Resume validation happens before the stream subprocess exists; an
    // option mismatch must not start a send.
    if job.resume {
        resume::try_resume(&mut job, config).await?;
    }

    info!("Starting zfs send command: {}", job.send_command_line);
    let mut child = zfs::send_command(&config.zfs.path, &job)
        .spawn()
        .map_err(|e| BackupError::Zfs(format!("error starting zfs command: {}", e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Zfs("zfs send produced no stdout pipe".into()))?;

    run_pipeline(config, job, Box::new(stdout), Some(child), cancel).await
}

/// Drive the pipeline over an already-opened snapshot stream.
///
/// When `child` is set, the subprocess is reaped after the stream ends and
/// a non-zero exit aborts the run before the final manifest is written; on
/// any stream failure the subprocess is killed.
pub(crate) async fn run_pipeline(
    config: &Config,
    mut job: JobInfo,
    stream: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<tokio::process::Child>,
    cancel: CancellationToken,
) -> Result<BackupSummary> {
    let run_start = Instant::now();
    job.sort_volumes();
    if job.send_command_line.is_empty() {
        job.send_command_line = zfs::send_command_line(&config.zfs.path, &job);
    }

    // Staging directory for volume and manifest files; removed on return.
    let staging = tempfile::Builder::new().prefix("zfsbackup-").tempdir()?;
    let staging_path = staging.path().to_path_buf();
    let cache_root = config.cache_root();

    let pipe_mode = job.max_file_buffer == 0;
    let buffer_slots = job.max_file_buffer.max(1);

    let (start_tx, start_rx) = mpsc::channel::<Volume>(buffer_slots);
    let (step_tx, step_rx) = mpsc::channel::<Volume>(buffer_slots);
    let file_credits = Arc::new(Semaphore::new(buffer_slots));
    let upload_permits = Arc::new(Semaphore::new(job.max_parallel_uploads.max(1)));
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<()>();

    // The delete stage reclaims staging files in buffered mode; it is part
    // of the chain only, never of the job's destination list.
    let mut chain = job.destinations.clone();
    if !pipe_mode {
        chain.push(DELETE_BACKEND_PREFIX.to_string());
    }

    let context = BackendContext {
        cancel: cancel.clone(),
        upload_permits: Arc::clone(&upload_permits),
        workers: job.max_parallel_uploads.max(1),
    };

    let mut tail_rx = step_rx;
    let mut used_backends: Vec<Box<dyn Backend>> = Vec::new();
    for destination in &chain {
        let mut backend = backends::backend_for(destination, context.clone())?;
        tail_rx = backend.start_upload(tail_rx);
        used_backends.push(backend);
    }

    let shared = Arc::new(Mutex::new(job));

    // Bridge: forwards stream volumes into the chain, counting them. Never
    // closes the step channel; its sender clone drops when the stream ends.
    let bridge: JoinHandle<Result<u64>> = {
        let step_tx = step_tx.clone();
        let cancel = cancel.clone();
        let mut start_rx = start_rx;
        tokio::spawn(async move {
            let mut forwarded: u64 = 0;
            while let Some(volume) = recv_or_cancel(&mut start_rx, &cancel).await? {
                forwarded += 1;
                send_or_cancel(&step_tx, volume, &cancel).await?;
            }
            Ok(forwarded)
        })
    };

    // Stream: slices the snapshot stream into volumes, then records the
    // stream byte total and reaps the subprocess. The start channel closes
    // only after that bookkeeping, so the finalizer cannot observe a
    // finished stream with stale counters.
    let stream_task = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        let credits = Arc::clone(&file_credits);
        let staging_path = staging_path.clone();
        let mut child = child;
        spawn_guarded(cancel.clone(), async move {
            let job_snapshot = shared.lock().expect("job lock poisoned").clone();
            let result = stream::send_stream(
                &job_snapshot,
                stream,
                start_tx.clone(),
                credits,
                &staging_path,
                &cancel,
            )
            .await;

            match result {
                Ok(total) => {
                    if let Some(mut child) = child.take() {
                        let status = tokio::select! {
                            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                            status = child.wait() => status?,
                        };
                        if !status.success() {
                            return Err(BackupError::Zfs(format!(
                                "zfs send exited with {}",
                                status
                            )));
                        }
                        info!("zfs send completed without error");
                    }
                    shared.lock().expect("job lock poisoned").stream_bytes = total;
                    drop(start_tx);
                    Ok(())
                }
                Err(e) => {
                    if let Some(mut child) = child.take() {
                        if let Err(kill_err) = child.kill().await {
                            warn!("Could not kill zfs send command: {}", kill_err);
                        }
                    }
                    Err(e)
                }
            }
        })
    };

    // Completion sink: volumes leaving the tail of the chain have reached
    // every destination. Each one is recorded in the manifest and its
    // file-buffer credit returned; the manifest volume is the terminal
    // signal.
    let sink = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        let credits = Arc::clone(&file_credits);
        let staging_path = staging_path.clone();
        let cache_root = cache_root.clone();
        spawn_guarded(cancel.clone(), async move {
            let mut tail_rx = tail_rx;
            while let Some(volume) = recv_or_cancel(&mut tail_rx, &cancel).await? {
                if volume.is_manifest {
                    debug!("Manifest volume {} cleared the pipeline", volume.object_name);
                    break;
                }
                debug!(
                    "Volume {} has finished the entire pipeline",
                    volume.object_name
                );
                let snapshot = {
                    let mut guard = shared.lock().expect("job lock poisoned");
                    guard.volumes.push(volume.descriptor());
                    guard.sort_volumes();
                    guard.clone()
                };
                // Save locally so an interrupted run can resume from here.
                let manifest_volume =
                    manifest::save_manifest(&snapshot, &staging_path, &cache_root, false)
                        .await?;
                if let Err(e) = manifest_volume.delete().await {
                    warn!("Error deleting temporary manifest file: {}", e);
                }
                credits.add_permits(1);
                let _ = ack_tx.send(());
            }
            Ok(())
        })
    };

    // Finalizer: once the stream has finished and every forwarded volume
    // has been acknowledged by the sink, stamp the end time, push the final
    // manifest through the chain, and close it.
    let finalizer = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        let staging_path = staging_path.clone();
        let cache_root = cache_root.clone();
        spawn_guarded(cancel.clone(), async move {
            let forwarded = match bridge.await {
                Ok(result) => result?,
                Err(e) => {
                    return Err(BackupError::Pipeline(format!("bridge task panicked: {}", e)))
                }
            };
            for _ in 0..forwarded {
                let ack = tokio::select! {
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                    ack = ack_rx.recv() => ack,
                };
                if ack.is_none() {
                    return Err(BackupError::Cancelled);
                }
            }

            info!("All volumes dispatched in pipeline, finalizing manifest file");
            let snapshot = {
                let mut guard = shared.lock().expect("job lock poisoned");
                guard.end_time = Some(Utc::now());
                guard.sort_volumes();
                guard.clone()
            };
            let manifest_volume =
                manifest::save_manifest(&snapshot, &staging_path, &cache_root, true).await?;
            send_or_cancel(&step_tx, manifest_volume, &cancel).await?;
            drop(step_tx);
            Ok(())
        })
    };

    let mut first_error: Option<BackupError> = None;
    for result in join_all([stream_task, sink, finalizer]).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => keep_first_error(&mut first_error, e),
            Err(e) => keep_first_error(
                &mut first_error,
                BackupError::Pipeline(format!("pipeline task panicked: {}", e)),
            ),
        }
    }

    for backend in &mut used_backends {
        if let Err(e) = backend.wait().await {
            keep_first_error(&mut first_error, e);
        }
    }
    for backend in &mut used_backends {
        if let Err(e) = backend.close().await {
            warn!("Could not properly close backend: {}", e);
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let final_job = shared.lock().expect("job lock poisoned").clone();
    let summary = BackupSummary {
        volume_name: final_job.volume_name.clone(),
        stream_bytes: final_job.stream_bytes,
        bytes_written: final_job.total_bytes_written(),
        volumes_uploaded: final_job.volumes.len(),
        destinations: final_job.destinations.clone(),
        manifest_object: final_job.manifest_object_name(),
        elapsed_seconds: run_start.elapsed().as_secs_f64(),
    };
    info!(
        "Done. Stream bytes: {}, bytes written: {}, files uploaded: {}, elapsed: {:.2}s",
        summary.stream_bytes,
        summary.bytes_written,
        summary.volumes_uploaded + 1,
        summary.elapsed_seconds
    );
    Ok(summary)
}

/// Spawn a pipeline task that cancels the shared token when it fails, so
/// peers blocked on channels or credits unwind promptly.
fn spawn_guarded<F>(token: CancellationToken, task: F) -> JoinHandle<Result<()>>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = task.await;
        if let Err(e) = &result {
            if !matches!(e, BackupError::Cancelled) {
                token.cancel();
            }
        }
        result
    })
}
