//! Terminal delete stage.
//!
//! Appended to the backend chain in buffered mode. By the time a volume
//! arrives here every real destination has uploaded it, so the local
//! staging file can be removed and its file-buffer slot reclaimed by the
//! completion sink downstream.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    join_workers, recv_or_cancel, send_or_cancel, Backend, BackendContext,
    DELETE_BACKEND_PREFIX,
};
use crate::error::{BackupError, Result};
use crate::volume::Volume;

/// Backend that deletes local staging files instead of uploading.
pub struct DeleteBackend {
    ctx: BackendContext,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl DeleteBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self {
            ctx,
            handles: Vec::new(),
        }
    }
}

#[async_trait]
impl Backend for DeleteBackend {
    fn kind(&self) -> &'static str {
        DELETE_BACKEND_PREFIX
    }

    fn destination(&self) -> &str {
        DELETE_BACKEND_PREFIX
    }

    fn start_upload(&mut self, input: mpsc::Receiver<Volume>) -> mpsc::Receiver<Volume> {
        let (out_tx, out_rx) = mpsc::channel(1);
        let cancel = self.ctx.cancel.clone();

        self.handles.push(tokio::spawn(async move {
            let mut input = input;
            while let Some(volume) = recv_or_cancel(&mut input, &cancel).await? {
                if let Err(e) = volume.delete().await {
                    cancel.cancel();
                    return Err(BackupError::upload(
                        DELETE_BACKEND_PREFIX,
                        format!("could not delete {}: {}", volume.object_name, e),
                    ));
                }
                debug!("Deleted local file for volume {}", volume.object_name);
                send_or_cancel(&out_tx, volume, &cancel).await?;
            }
            Ok(())
        }));

        out_rx
    }

    async fn wait(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.handles);
        join_workers(handles, DELETE_BACKEND_PREFIX).await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        Err(BackupError::Config(format!(
            "delete backend holds no objects (requested {})",
            name
        )))
    }

    async fn delete_object(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
