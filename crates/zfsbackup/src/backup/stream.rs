//! Volume source: slices the snapshot stream into sealed, numbered volumes.
//!
//! On resume the already-streamed prefix is discarded before the first new
//! volume is cut. A volume seals when its write counter first reaches
//! `volume_size * MiB - 50 KiB` (headroom for trailing framing written by
//! upstream encoders) or when the stream ends.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backends::send_or_cancel;
use crate::error::{BackupError, Result};
use crate::job::JobInfo;
use crate::volume::{Volume, VolumeWriter, KIB, MIB};

/// Read granularity against the snapshot stream.
pub(crate) const BUFFER_SIZE: u64 = 256 * KIB;

/// Headroom reserved below the volume size target.
const SEAL_HEADROOM: u64 = 50 * KIB;

/// Consume the snapshot stream, emitting sealed volumes on `out` until EOF,
/// then close `out`. Returns the total stream bytes read, including any
/// skipped resume prefix.
///
/// One credit is taken from `credits` per materialized volume; the
/// completion sink returns credits as volumes leave the pipeline.
pub(crate) async fn send_stream<R>(
    job: &JobInfo,
    mut stream: R,
    out: mpsc::Sender<Volume>,
    credits: Arc<Semaphore>,
    staging_dir: &Path,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let pipe_mode = job.max_file_buffer == 0;
    let threshold = job.volume_size_mib * MIB - SEAL_HEADROOM;
    let (skip_bytes, mut volume_number) = job.total_streamed_and_vols();

    let mut total = skip_bytes;
    let mut last_total = skip_bytes;
    let mut buf = vec![0u8; BUFFER_SIZE as usize];

    // Discard the already-streamed prefix on resume.
    if skip_bytes > 0 {
        info!("Skipping {} already-streamed bytes", skip_bytes);
        let mut remaining = skip_bytes;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE) as usize;
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                read = stream.read(&mut buf[..want]) => read?,
            };
            if n == 0 {
                return Err(BackupError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended with {} bytes of the resume prefix unread",
                        remaining
                    ),
                )));
            }
            remaining -= n as u64;
        }
        debug!("Skipped {} bytes of the snapshot stream", skip_bytes);
    }

    'volumes: loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            acquired = credits.acquire() => {
                acquired.map_err(|_| BackupError::Cancelled)?
            }
        };
        permit.forget();

        let object_name = job.volume_object_name(volume_number);
        let (volume, mut writer) = if pipe_mode {
            Volume::create_piped(object_name, volume_number)
        } else {
            Volume::create(staging_dir, object_name, volume_number).await?
        };
        debug!("Starting volume {}", volume.object_name);
        volume_number += 1;

        let mut volume = Some(volume);
        if pipe_mode {
            // Downstream reads the pipe concurrently with the copy below.
            let v = volume.take().expect("pipe volume taken twice");
            send_or_cancel(&out, v, cancel).await?;
        }

        loop {
            let (copied, eof) =
                copy_step(&mut stream, &mut writer, 2 * BUFFER_SIZE, &mut buf, cancel).await?;
            total += copied;

            if eof {
                seal(writer, total - last_total).await?;
                last_total = total;
                if let Some(v) = volume.take() {
                    debug!("Finished volume {}", v.object_name);
                    send_or_cancel(&out, v, cancel).await?;
                }
                break 'volumes;
            }

            if writer.counter() >= threshold {
                seal(writer, total - last_total).await?;
                last_total = total;
                if let Some(v) = volume.take() {
                    debug!("Finished volume {}", v.object_name);
                    send_or_cancel(&out, v, cancel).await?;
                }
                continue 'volumes;
            }
        }
    }

    // `out` closes when the sender drops here.
    Ok(total)
}

/// Record the stream byte delta on the open volume and seal it.
async fn seal(writer: VolumeWriter, stream_bytes: u64) -> Result<()> {
    writer.set_stream_bytes(stream_bytes);
    writer.close().await
}

/// Copy up to `max` bytes from the stream into the volume. Returns the
/// bytes copied and whether the stream reported EOF.
async fn copy_step<R>(
    stream: &mut R,
    writer: &mut VolumeWriter,
    max: u64,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<(u64, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut copied = 0u64;
    while copied < max {
        let want = (max - copied).min(buf.len() as u64) as usize;
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            read = stream.read(&mut buf[..want]) => read?,
        };
        if n == 0 {
            return Ok((copied, true));
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    Ok((copied, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::job::SnapshotInfo;
    use crate::volume::VolumeInfo;
    use chrono::{TimeZone, Utc};
    use tokio::io::AsyncReadExt;

    fn test_job(volume_size_mib: u64, max_file_buffer: usize) -> JobInfo {
        let config = Config::from_yaml("destinations: [\"file:///tmp/b\"]").unwrap();
        let mut job = JobInfo::new("tank/data", &config);
        job.base_snapshot =
            SnapshotInfo::new("daily-1", Utc.timestamp_opt(1_754_000_000, 0).unwrap());
        job.volume_size_mib = volume_size_mib;
        job.max_file_buffer = max_file_buffer;
        job
    }

    async fn run_source(
        job: &JobInfo,
        data: Vec<u8>,
        capacity: usize,
    ) -> (Result<u64>, Vec<Volume>, tempfile::TempDir) {
        let staging = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(capacity);
        let credits = Arc::new(Semaphore::new(capacity));
        let cancel = CancellationToken::new();

        let total = send_stream(
            job,
            std::io::Cursor::new(data),
            tx,
            credits,
            staging.path(),
            &cancel,
        )
        .await;

        let mut volumes = Vec::new();
        while let Some(v) = rx.recv().await {
            volumes.push(v);
        }
        // The staging dir is returned so file-backed volumes stay readable.
        (total, volumes, staging)
    }

    #[test]
    fn test_seal_threshold_leaves_headroom() {
        let job = test_job(64, 1);
        let threshold = job.volume_size_mib * MIB - SEAL_HEADROOM;
        assert_eq!(threshold, 64 * 1024 * 1024 - 50 * 1024);
    }

    #[tokio::test]
    async fn test_single_volume_on_small_stream() {
        let job = test_job(64, 1);
        let data = vec![0xabu8; 1_048_576];
        let (total, volumes, _staging) = run_source(&job, data, 4).await;

        assert_eq!(total.unwrap(), 1_048_576);
        assert_eq!(volumes.len(), 1);
        let desc = volumes[0].descriptor();
        assert_eq!(desc.volume_number, 0);
        assert_eq!(desc.stream_bytes, 1_048_576);
        assert_eq!(desc.size, 1_048_576);
    }

    #[tokio::test]
    async fn test_stream_sliced_into_dense_volumes() {
        let job = test_job(1, 4);
        let data = vec![0x5au8; 2_200_000];
        let (total, volumes, _staging) = run_source(&job, data, 8).await;

        assert_eq!(total.unwrap(), 2_200_000);
        let descs: Vec<VolumeInfo> = volumes.iter().map(|v| v.descriptor()).collect();
        let numbers: Vec<u64> = descs.iter().map(|d| d.volume_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        let stream_sum: u64 = descs.iter().map(|d| d.stream_bytes).sum();
        assert_eq!(stream_sum, 2_200_000);
        // Every volume but the last sealed at or past the threshold.
        let threshold = MIB - SEAL_HEADROOM;
        for desc in &descs[..descs.len() - 1] {
            assert!(desc.size >= threshold);
        }
    }

    #[tokio::test]
    async fn test_resume_skips_completed_prefix() {
        let mut job = test_job(64, 1);
        job.volumes.push(VolumeInfo::record(
            job.volume_object_name(0),
            0,
            300_000,
            300_000,
        ));

        let mut data = vec![0u8; 300_000];
        data.extend(vec![1u8; 200_000]);
        let (total, volumes, _staging) = run_source(&job, data, 4).await;

        assert_eq!(total.unwrap(), 500_000);
        assert_eq!(volumes.len(), 1);
        let desc = volumes[0].descriptor();
        assert_eq!(desc.volume_number, 1);
        assert_eq!(desc.stream_bytes, 200_000);

        // The emitted volume holds only the unskipped suffix.
        let mut content = Vec::new();
        volumes[0]
            .reader()
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert!(content.iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn test_stream_shorter_than_resume_prefix_fails() {
        let mut job = test_job(64, 1);
        job.volumes.push(VolumeInfo::record(
            job.volume_object_name(0),
            0,
            1_000_000,
            1_000_000,
        ));

        let (total, volumes, _staging) = run_source(&job, vec![0u8; 100], 4).await;
        assert!(matches!(total, Err(BackupError::Io(_))));
        assert!(volumes.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_mode_publishes_before_seal() {
        let job = test_job(64, 0);
        let staging = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let credits = Arc::new(Semaphore::new(1));
        let cancel = CancellationToken::new();

        let data = vec![0x42u8; 400_000];
        let producer = tokio::spawn({
            let staging = staging.path().to_path_buf();
            let cancel = cancel.clone();
            async move {
                send_stream(
                    &job,
                    std::io::Cursor::new(data),
                    tx,
                    credits,
                    &staging,
                    &cancel,
                )
                .await
            }
        });

        // The volume arrives while the producer is still writing into it.
        let volume = rx.recv().await.unwrap();
        let mut content = Vec::new();
        volume
            .reader()
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content.len(), 400_000);

        assert_eq!(producer.await.unwrap().unwrap(), 400_000);
        assert!(rx.recv().await.is_none());
        assert_eq!(volume.descriptor().stream_bytes, 400_000);
    }
}
