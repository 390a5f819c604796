//! Manifest persistence and the per-destination local cache.
//!
//! The manifest is the JSON serialization of the full [`JobInfo`], written
//! into a file-backed volume so it can traverse the upload chain like any
//! other volume. A copy lands in `working_dir/cache/<hash(destination)>/`
//! for every destination so an interrupted run can be resumed without
//! touching remote storage.
//!
//! Hashes here are filename-safe identifiers, not security primitives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backends::{self, Backend, BackendContext};
use crate::config::Config;
use crate::error::Result;
use crate::job::{JobInfo, MANIFEST_PREFIX};
use crate::volume::Volume;

/// Filename-safe identifier for an object name or destination URI.
pub fn safe_name(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Local cache directory for a destination.
pub fn cache_dir(cache_root: &Path, destination: &str) -> PathBuf {
    cache_root.join(safe_name(destination))
}

/// Serialize the job into a manifest volume and copy it into the local
/// cache of every destination. The returned volume is sealed and ready to
/// upload (final manifest) or to delete (intermediate save).
pub async fn save_manifest(
    job: &JobInfo,
    staging_dir: &Path,
    cache_root: &Path,
    final_manifest: bool,
) -> Result<Volume> {
    let mut snapshot = job.clone();
    snapshot.sort_volumes();
    snapshot.final_manifest = final_manifest;

    let object_name = snapshot.manifest_object_name();
    let (volume, mut writer) =
        Volume::create_manifest(staging_dir, object_name.clone(), final_manifest).await?;
    let payload = serde_json::to_vec(&snapshot)?;
    writer.write_all(&payload).await?;
    writer.close().await?;

    let cache_file = safe_name(&object_name);
    for destination in &snapshot.destinations {
        let dest = cache_dir(cache_root, destination).join(&cache_file);
        volume.copy_to(&dest).await?;
        debug!(
            "Copied manifest to local cache for destination {}",
            destination
        );
    }

    Ok(volume)
}

/// Decode a manifest file.
pub async fn read_manifest(path: &Path) -> Result<JobInfo> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Bring the local cache for a destination in line with remote state.
///
/// Remote manifests missing locally are fetched; the returned list names
/// the cache files of currently valid manifests.
pub async fn sync_cache(backend: &dyn Backend, cache: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(cache).await?;

    let mut safe_manifests = Vec::new();
    for object_name in backend.list().await? {
        if !object_name.starts_with(MANIFEST_PREFIX) {
            continue;
        }
        let cache_file = safe_name(&object_name);
        let path = cache.join(&cache_file);
        if !path.exists() {
            let content = backend.get(&object_name).await?;
            fs::write(&path, content).await?;
            debug!("Fetched manifest {} into local cache", object_name);
        }
        safe_manifests.push(cache_file);
    }
    Ok(safe_manifests)
}

/// Decode every manifest a destination holds for `volume_name`, sorted by
/// base-snapshot creation time, newest first.
pub async fn backups_for_destination(
    config: &Config,
    destination: &str,
    volume_name: &str,
) -> Result<Vec<JobInfo>> {
    let ctx = BackendContext {
        cancel: CancellationToken::new(),
        upload_permits: Arc::new(Semaphore::new(1)),
        workers: 1,
    };
    let backend = backends::backend_for(destination, ctx)?;
    let cache = cache_dir(&config.cache_root(), destination);
    let safe_manifests = sync_cache(backend.as_ref(), &cache).await?;

    let mut decoded = Vec::with_capacity(safe_manifests.len());
    for cache_file in safe_manifests {
        let manifest = read_manifest(&cache.join(cache_file)).await?;
        if manifest.volume_name == volume_name {
            decoded.push(manifest);
        }
    }

    decoded.sort_by(|a, b| {
        b.base_snapshot
            .creation_time
            .cmp(&a.base_snapshot.creation_time)
    });
    Ok(decoded)
}
