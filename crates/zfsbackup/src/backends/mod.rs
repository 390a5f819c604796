//! Destination backends.
//!
//! Each backend consumes a channel of volumes, uploads every volume it
//! receives, and re-emits it downstream once the upload completes. Backends
//! are chained in destination order, so a volume traverses every
//! destination sequentially while distinct volumes upload concurrently.
//!
//! All backends share one upload semaphore; a backend must hold a permit
//! for the duration of any upload.

pub mod delete;
pub mod file;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BackupError, Result};
use crate::volume::Volume;

pub use delete::DeleteBackend;
pub use file::FileBackend;

/// Sentinel destination kind for the terminal delete stage appended in
/// buffered mode.
pub const DELETE_BACKEND_PREFIX: &str = "delete";

/// URI scheme of the file backend.
const FILE_SCHEME: &str = "file://";

/// Shared plumbing handed to every backend in a run.
#[derive(Clone)]
pub struct BackendContext {
    /// Cancelled when any pipeline task fails.
    pub cancel: CancellationToken,
    /// Global bound on concurrent uploads across all backends.
    pub upload_permits: Arc<Semaphore>,
    /// Upload workers per backend.
    pub workers: usize,
}

/// A destination upload backend.
#[async_trait]
pub trait Backend: Send {
    /// URI scheme or sentinel kind of this backend.
    fn kind(&self) -> &'static str;

    /// The destination URI this backend serves.
    fn destination(&self) -> &str;

    /// Spawn the upload workers. Every volume received on `input` is
    /// re-emitted on the returned channel after its upload completes; the
    /// returned channel closes once `input` closes and the workers drain.
    fn start_upload(&mut self, input: mpsc::Receiver<Volume>) -> mpsc::Receiver<Volume>;

    /// Block until the upload workers drain, returning the first error.
    async fn wait(&mut self) -> Result<()>;

    /// Release backend resources.
    async fn close(&mut self) -> Result<()>;

    /// List object names present at the destination.
    async fn list(&self) -> Result<Vec<String>>;

    /// Fetch an object's content.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Delete an object at the destination.
    async fn delete_object(&self, name: &str) -> Result<()>;
}

/// Whether `destination` names a scheme this build can upload to.
pub fn is_supported(destination: &str) -> bool {
    destination.starts_with(FILE_SCHEME)
}

/// Construct the backend for a destination URI (or the delete sentinel).
pub fn backend_for(destination: &str, ctx: BackendContext) -> Result<Box<dyn Backend>> {
    if destination == DELETE_BACKEND_PREFIX {
        return Ok(Box::new(DeleteBackend::new(ctx)));
    }
    if let Some(root) = destination.strip_prefix(FILE_SCHEME) {
        return Ok(Box::new(FileBackend::new(destination, root, ctx)?));
    }
    Err(BackupError::Config(format!(
        "no backend available for destination '{}'",
        destination
    )))
}

/// Receive raced against cancellation; `Ok(None)` means the channel closed.
pub(crate) async fn recv_or_cancel<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancellationToken,
) -> Result<Option<T>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        value = rx.recv() => Ok(value),
    }
}

/// Send raced against cancellation. A closed channel means the pipeline is
/// tearing down, which surfaces as cancellation.
pub(crate) async fn send_or_cancel<T: Send>(
    tx: &mpsc::Sender<T>,
    value: T,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        sent = tx.send(value) => sent.map_err(|_| BackupError::Cancelled),
    }
}

/// Keep the first error, preferring a real failure over cancellation noise.
pub(crate) fn keep_first_error(slot: &mut Option<BackupError>, err: BackupError) {
    match slot {
        None => *slot = Some(err),
        Some(BackupError::Cancelled) if !matches!(err, BackupError::Cancelled) => {
            *slot = Some(err)
        }
        Some(_) => {}
    }
}

/// Join a backend's worker handles, returning the first error.
pub(crate) async fn join_workers(
    handles: Vec<JoinHandle<Result<()>>>,
    destination: &str,
) -> Result<()> {
    let mut first: Option<BackupError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => keep_first_error(&mut first, e),
            Err(e) => keep_first_error(
                &mut first,
                BackupError::Pipeline(format!(
                    "upload worker for {} panicked: {}",
                    destination, e
                )),
            ),
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> BackendContext {
        BackendContext {
            cancel: CancellationToken::new(),
            upload_permits: Arc::new(Semaphore::new(2)),
            workers: 2,
        }
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported("file:///mnt/backups"));
        assert!(!is_supported("s3://bucket/prefix"));
        assert!(!is_supported("delete"));
    }

    #[test]
    fn test_backend_for_file_and_delete() {
        let file = backend_for("file:///mnt/backups", context()).unwrap();
        assert_eq!(file.kind(), "file");

        let delete = backend_for(DELETE_BACKEND_PREFIX, context()).unwrap();
        assert_eq!(delete.kind(), DELETE_BACKEND_PREFIX);

        assert!(backend_for("s3://bucket", context()).is_err());
    }

    #[test]
    fn test_keep_first_error_prefers_real_failures() {
        let mut slot = None;
        keep_first_error(&mut slot, BackupError::Cancelled);
        keep_first_error(&mut slot, BackupError::upload("d", "boom"));
        keep_first_error(&mut slot, BackupError::upload("d", "later"));
        match slot {
            Some(BackupError::Upload { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
