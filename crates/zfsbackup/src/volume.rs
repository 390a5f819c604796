//! Volume objects.
//!
//! A volume is one bounded chunk of the snapshot stream packaged as a single
//! uploadable object. The open write half lives in a [`VolumeWriter`] owned
//! by the producer; the [`Volume`] itself travels down the upload pipeline
//! and is read by each destination backend.
//!
//! Backing is either a staging file (buffered mode) or an in-memory pipe
//! (pipe mode, where the downstream backend reads concurrently with the
//! producer and the stream can be consumed exactly once).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};

use crate::error::{BackupError, Result};

pub(crate) const KIB: u64 = 1024;
pub(crate) const MIB: u64 = 1024 * 1024;

/// In-memory pipe capacity for pipe-mode volumes.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Serializable descriptor of one produced volume; what the manifest stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Deterministic object name at every destination.
    pub object_name: String,

    /// Position of this volume in the stream, dense from 0.
    pub volume_number: u64,

    /// Uncompressed snapshot stream bytes contained in this volume.
    pub stream_bytes: u64,

    /// Bytes written into the volume object.
    pub size: u64,

    /// True only for manifest volumes.
    #[serde(default)]
    pub is_manifest: bool,

    /// True only for the terminal manifest of a completed run.
    #[serde(default)]
    pub is_final_manifest: bool,
}

impl VolumeInfo {
    /// Build a descriptor for an already-completed data volume.
    pub fn record(
        object_name: impl Into<String>,
        volume_number: u64,
        stream_bytes: u64,
        size: u64,
    ) -> Self {
        Self {
            object_name: object_name.into(),
            volume_number,
            stream_bytes,
            size,
            is_manifest: false,
            is_final_manifest: false,
        }
    }
}

#[derive(Debug, Default)]
struct VolumeStats {
    size: AtomicU64,
    stream_bytes: AtomicU64,
}

#[derive(Debug)]
enum Backing {
    File(PathBuf),
    Pipe(Mutex<Option<DuplexStream>>),
}

/// A volume traveling through the upload pipeline.
#[derive(Debug)]
pub struct Volume {
    pub object_name: String,
    pub volume_number: u64,
    pub is_manifest: bool,
    pub is_final_manifest: bool,
    stats: Arc<VolumeStats>,
    backing: Backing,
}

#[derive(Debug)]
enum WriterSink {
    File(File),
    Pipe(DuplexStream),
}

/// The open write half of a volume.
///
/// Append-only while open; [`VolumeWriter::close`] seals the volume. For a
/// pipe-backed volume, closing shuts the pipe down so the reader sees EOF.
#[derive(Debug)]
pub struct VolumeWriter {
    sink: WriterSink,
    counter: u64,
    stats: Arc<VolumeStats>,
}

impl Volume {
    /// Create a file-backed data volume in `staging_dir`.
    pub async fn create(
        staging_dir: &Path,
        object_name: String,
        volume_number: u64,
    ) -> Result<(Volume, VolumeWriter)> {
        let path = staging_dir.join(format!("vol{:08}", volume_number));
        Self::create_file_backed(path, object_name, volume_number, false, false).await
    }

    /// Create a pipe-backed data volume; the returned volume carries the
    /// read half and must be handed to the consumer before writing starts.
    pub fn create_piped(object_name: String, volume_number: u64) -> (Volume, VolumeWriter) {
        let (write_half, read_half) = tokio::io::duplex(PIPE_CAPACITY);
        let stats = Arc::new(VolumeStats::default());
        let volume = Volume {
            object_name,
            volume_number,
            is_manifest: false,
            is_final_manifest: false,
            stats: Arc::clone(&stats),
            backing: Backing::Pipe(Mutex::new(Some(read_half))),
        };
        let writer = VolumeWriter {
            sink: WriterSink::Pipe(write_half),
            counter: 0,
            stats,
        };
        (volume, writer)
    }

    /// Create the file-backed manifest volume for a run. Always staged on
    /// disk so it can be copied into the per-destination caches.
    pub async fn create_manifest(
        staging_dir: &Path,
        object_name: String,
        final_manifest: bool,
    ) -> Result<(Volume, VolumeWriter)> {
        let path = staging_dir.join("manifest");
        Self::create_file_backed(path, object_name, 0, true, final_manifest).await
    }

    async fn create_file_backed(
        path: PathBuf,
        object_name: String,
        volume_number: u64,
        is_manifest: bool,
        is_final_manifest: bool,
    ) -> Result<(Volume, VolumeWriter)> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        let stats = Arc::new(VolumeStats::default());
        let volume = Volume {
            object_name,
            volume_number,
            is_manifest,
            is_final_manifest,
            stats: Arc::clone(&stats),
            backing: Backing::File(path),
        };
        let writer = VolumeWriter {
            sink: WriterSink::File(file),
            counter: 0,
            stats,
        };
        Ok((volume, writer))
    }

    /// Snapshot of this volume as a manifest record.
    pub fn descriptor(&self) -> VolumeInfo {
        VolumeInfo {
            object_name: self.object_name.clone(),
            volume_number: self.volume_number,
            stream_bytes: self.stats.stream_bytes.load(Ordering::Acquire),
            size: self.stats.size.load(Ordering::Acquire),
            is_manifest: self.is_manifest,
            is_final_manifest: self.is_final_manifest,
        }
    }

    /// Open the volume content for reading.
    ///
    /// A file-backed volume can be read any number of times; a pipe-backed
    /// volume carries a single consumable stream.
    pub async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.backing {
            Backing::File(path) => Ok(Box::new(File::open(path).await?)),
            Backing::Pipe(slot) => {
                let taken = slot
                    .lock()
                    .expect("volume pipe lock poisoned")
                    .take();
                match taken {
                    Some(stream) => Ok(Box::new(stream)),
                    None => Err(BackupError::Pipeline(format!(
                        "volume {} stream already consumed",
                        self.object_name
                    ))),
                }
            }
        }
    }

    /// Copy a sealed file-backed volume to `dest`, creating parent
    /// directories as needed.
    pub async fn copy_to(&self, dest: &Path) -> Result<()> {
        let Backing::File(path) = &self.backing else {
            return Err(BackupError::Pipeline(format!(
                "volume {} has no file backing to copy",
                self.object_name
            )));
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(path, dest).await?;
        Ok(())
    }

    /// Remove the staging file of a file-backed volume. A no-op for
    /// pipe-backed volumes and for files already gone.
    pub async fn delete(&self) -> Result<()> {
        if let Backing::File(path) = &self.backing {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Staging file path, if this volume is file-backed.
    pub fn staging_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path.as_path()),
            Backing::Pipe(_) => None,
        }
    }
}

impl VolumeWriter {
    /// Append `buf` to the volume.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.sink {
            WriterSink::File(file) => file.write_all(buf).await?,
            WriterSink::Pipe(pipe) => pipe.write_all(buf).await?,
        }
        self.counter += buf.len() as u64;
        Ok(())
    }

    /// Bytes written since the volume was opened.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Record the snapshot stream bytes this volume covers.
    pub fn set_stream_bytes(&self, n: u64) {
        self.stats.stream_bytes.store(n, Ordering::Release);
    }

    /// Seal the volume. Flushes file backing to disk; shuts a pipe down so
    /// the reader observes EOF.
    pub async fn close(mut self) -> Result<()> {
        match &mut self.sink {
            WriterSink::File(file) => {
                file.flush().await?;
                file.sync_all().await?;
            }
            WriterSink::Pipe(pipe) => {
                pipe.shutdown().await?;
            }
        }
        self.stats.size.store(self.counter, Ordering::Release);
        Ok(())
    }
}
