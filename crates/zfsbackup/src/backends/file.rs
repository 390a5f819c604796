//! File destination backend (`file://` URIs).
//!
//! Uploads copy volume content into a destination directory; object names
//! may contain `/` (dataset paths), which maps onto subdirectories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    join_workers, recv_or_cancel, send_or_cancel, Backend, BackendContext,
};
use crate::error::{BackupError, Result};
use crate::volume::Volume;

/// Backend writing objects into a local directory.
pub struct FileBackend {
    destination: String,
    root: PathBuf,
    ctx: BackendContext,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl FileBackend {
    /// Create a backend for `destination`, rooted at `root`.
    pub fn new(destination: &str, root: &str, ctx: BackendContext) -> Result<Self> {
        if root.is_empty() {
            return Err(BackupError::Config(format!(
                "destination '{}' has an empty path",
                destination
            )));
        }
        Ok(Self {
            destination: destination.to_string(),
            root: PathBuf::from(root),
            ctx,
            handles: Vec::new(),
        })
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn start_upload(&mut self, input: mpsc::Receiver<Volume>) -> mpsc::Receiver<Volume> {
        let workers = self.ctx.workers.max(1);
        let (out_tx, out_rx) = mpsc::channel(workers * 2);
        let (queue_tx, queue_rx) = async_channel::bounded::<Volume>(workers * 2);

        // Dispatcher: forwards the chain input into the worker queue and
        // closes it when the input closes.
        let cancel = self.ctx.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            let mut input = input;
            while let Some(volume) = recv_or_cancel(&mut input, &cancel).await? {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                    sent = queue_tx.send(volume) => {
                        sent.map_err(|_| BackupError::Cancelled)?;
                    }
                }
            }
            Ok(())
        }));

        for _ in 0..workers {
            let queue_rx = queue_rx.clone();
            let out_tx = out_tx.clone();
            let cancel = self.ctx.cancel.clone();
            let permits = self.ctx.upload_permits.clone();
            let root = self.root.clone();
            let destination = self.destination.clone();

            self.handles.push(tokio::spawn(async move {
                loop {
                    let volume = tokio::select! {
                        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                        received = queue_rx.recv() => match received {
                            Ok(volume) => volume,
                            Err(_) => return Ok(()),
                        },
                    };

                    let permit = tokio::select! {
                        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                        acquired = permits.acquire() => {
                            acquired.map_err(|_| BackupError::Cancelled)?
                        }
                    };
                    let uploaded = upload_volume(&root, &volume, &cancel).await;
                    drop(permit);

                    match uploaded {
                        Ok(bytes) => {
                            debug!(
                                "Uploaded {} ({} bytes) to {}",
                                volume.object_name, bytes, destination
                            );
                            send_or_cancel(&out_tx, volume, &cancel).await?;
                        }
                        Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                        Err(e) => {
                            // Unblock peers stuck on channel operations.
                            cancel.cancel();
                            return Err(BackupError::upload(destination.clone(), e.to_string()));
                        }
                    }
                }
            }));
        }

        out_rx
    }

    async fn wait(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.handles);
        join_workers(handles, &self.destination).await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    names.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(names)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(name)).await?)
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy a volume's content to its destination path, returning bytes written.
async fn upload_volume(root: &Path, volume: &Volume, cancel: &CancellationToken) -> Result<u64> {
    let dest = root.join(&volume.object_name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut reader = volume.reader().await?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&dest)
        .await?;

    tokio::select! {
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        copied = tokio::io::copy(&mut reader, &mut file) => Ok(copied?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn context() -> BackendContext {
        BackendContext {
            cancel: CancellationToken::new(),
            upload_permits: Arc::new(Semaphore::new(2)),
            workers: 2,
        }
    }

    async fn sealed_volume(dir: &Path, name: &str, number: u64, payload: &[u8]) -> Volume {
        let (volume, mut writer) = Volume::create(dir, name.to_string(), number)
            .await
            .unwrap();
        writer.write_all(payload).await.unwrap();
        writer.set_stream_bytes(payload.len() as u64);
        writer.close().await.unwrap();
        volume
    }

    #[tokio::test]
    async fn test_upload_flow_reemits_volumes() {
        let staging = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let destination = format!("file://{}", dest.path().display());

        let mut backend =
            FileBackend::new(&destination, &dest.path().to_string_lossy(), context()).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let mut out = backend.start_upload(rx);

        let v0 = sealed_volume(staging.path(), "tank/data|s1.vol0", 0, b"alpha").await;
        let v1 = sealed_volume(staging.path(), "tank/data|s1.vol1", 1, b"beta").await;
        tx.send(v0).await.unwrap();
        tx.send(v1).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(volume) = out.recv().await {
            seen.push(volume.object_name.clone());
        }
        backend.wait().await.unwrap();

        seen.sort();
        assert_eq!(seen, vec!["tank/data|s1.vol0", "tank/data|s1.vol1"]);
        assert_eq!(
            std::fs::read(dest.path().join("tank/data|s1.vol0")).unwrap(),
            b"alpha"
        );
        assert_eq!(
            std::fs::read(dest.path().join("tank/data|s1.vol1")).unwrap(),
            b"beta"
        );
    }

    #[tokio::test]
    async fn test_list_get_delete() {
        let dest = tempfile::tempdir().unwrap();
        let destination = format!("file://{}", dest.path().display());
        let backend =
            FileBackend::new(&destination, &dest.path().to_string_lossy(), context()).unwrap();

        std::fs::create_dir_all(dest.path().join("tank/data")).unwrap();
        std::fs::write(dest.path().join("tank/data").join("obj1"), b"one").unwrap();
        std::fs::write(dest.path().join("top"), b"two").unwrap();

        let mut names = backend.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["tank/data/obj1", "top"]);

        assert_eq!(backend.get("top").await.unwrap(), b"two");

        backend.delete_object("top").await.unwrap();
        assert!(!dest.path().join("top").exists());
        // Deleting a missing object is not an error.
        backend.delete_object("top").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dest = tempfile::tempdir().unwrap();
        let missing = dest.path().join("nope");
        let destination = format!("file://{}", missing.display());
        let backend =
            FileBackend::new(&destination, &missing.to_string_lossy(), context()).unwrap();
        assert!(backend.list().await.unwrap().is_empty());
    }
}
