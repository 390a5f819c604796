//! Resume validation and counter restoration.
//!
//! Runs before the pipeline starts. A cached manifest for the first
//! destination is the authority on what the prior attempt looked like; the
//! current job must match it exactly (options and send command) before its
//! completed volumes are adopted.

use tracing::{error, info};

use super::manifest::{cache_dir, read_manifest, safe_name};
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::job::JobInfo;
use crate::zfs;

/// Validate the job against the cached manifest of the prior attempt and
/// adopt its completed volumes and start time. A missing cache entry means
/// there is nothing to resume and the run continues fresh.
pub async fn try_resume(job: &mut JobInfo, config: &Config) -> Result<()> {
    let Some(destination) = job.destinations.first() else {
        return Err(BackupError::Config("job has no destinations".into()));
    };
    let manifest_path = cache_dir(&config.cache_root(), destination)
        .join(safe_name(&job.manifest_object_name()));

    let previous = match read_manifest(&manifest_path).await {
        Ok(manifest) => manifest,
        Err(BackupError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No previous manifest file exists, nothing to resume");
            return Ok(());
        }
        Err(e) => {
            error!(
                "Could not open previous manifest file {}: {}",
                manifest_path.display(),
                e
            );
            return Err(e);
        }
    };

    if previous.compressor != job.compressor {
        return Err(BackupError::OptionMismatch(format!(
            "original compressor {:?} != compressor specified {:?}",
            previous.compressor, job.compressor
        )));
    }
    if previous.encrypt_to != job.encrypt_to {
        return Err(BackupError::OptionMismatch(format!(
            "different encrypt_to flags specified (original {:?} != current {:?})",
            previous.encrypt_to, job.encrypt_to
        )));
    }
    if previous.sign_from != job.sign_from {
        return Err(BackupError::OptionMismatch(format!(
            "different sign_from flags specified (original {:?} != current {:?})",
            previous.sign_from, job.sign_from
        )));
    }

    let previous_command_line = zfs::send_command_line(&config.zfs.path, &previous);
    let current_command_line = zfs::send_command_line(&config.zfs.path, job);
    if previous_command_line != current_command_line {
        error!(
            "Different options given for the zfs send command: previous `{}` != current `{}`",
            previous_command_line, current_command_line
        );
        return Err(BackupError::OptionMismatch(
            "different options given for the zfs send command".into(),
        ));
    }

    job.volumes = previous.volumes;
    job.start_time = previous.start_time;
    info!(
        "Will be resuming previous backup attempt with {} completed volumes",
        job.volumes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SnapshotInfo;
    use crate::volume::VolumeInfo;
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    fn test_config(working_dir: &Path) -> Config {
        Config::from_yaml(&format!(
            "destinations: [\"file:///mnt/backups/a\"]\nworking_dir: {}\n",
            working_dir.display()
        ))
        .unwrap()
    }

    fn test_job(config: &Config) -> JobInfo {
        let mut job = JobInfo::new("tank/data", config);
        job.base_snapshot =
            SnapshotInfo::new("daily-1", Utc.timestamp_opt(1_754_000_000, 0).unwrap());
        job.resume = true;
        job
    }

    fn write_cached_manifest(config: &Config, manifest: &JobInfo) {
        let path = cache_dir(&config.cache_root(), &manifest.destinations[0])
            .join(safe_name(&manifest.manifest_object_name()));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(manifest).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_no_cached_manifest_continues_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut job = test_job(&config);

        try_resume(&mut job, &config).await.unwrap();
        assert!(job.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_changed_compressor_is_option_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut previous = test_job(&config);
        previous.compressor = "gzip".to_string();
        write_cached_manifest(&config, &previous);

        let mut job = test_job(&config);
        job.compressor = "zstd".to_string();
        let err = try_resume(&mut job, &config).await.unwrap_err();
        assert!(matches!(err, BackupError::OptionMismatch(_)));
    }

    #[tokio::test]
    async fn test_changed_encrypt_to_is_option_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut previous = test_job(&config);
        previous.encrypt_to = "ops@example.com".to_string();
        write_cached_manifest(&config, &previous);

        let mut job = test_job(&config);
        let err = try_resume(&mut job, &config).await.unwrap_err();
        assert!(matches!(err, BackupError::OptionMismatch(_)));
    }

    #[tokio::test]
    async fn test_changed_send_command_is_option_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // The prior attempt was incremental; the current job is full, so the
        // reconstructed send command differs. Both share the manifest object
        // name only if spans match, so give the previous run the same span.
        let mut previous = test_job(&config);
        previous.send_command_line = "zfs send tank/data@daily-1".to_string();
        write_cached_manifest(&config, &previous);

        // Tamper with the cached copy: same file, different base snapshot.
        let mut tampered = previous.clone();
        tampered.base_snapshot.name = "daily-0".to_string();
        let path = cache_dir(&config.cache_root(), &previous.destinations[0])
            .join(safe_name(&previous.manifest_object_name()));
        std::fs::write(&path, serde_json::to_vec(&tampered).unwrap()).unwrap();

        let mut job = test_job(&config);
        let err = try_resume(&mut job, &config).await.unwrap_err();
        assert!(matches!(err, BackupError::OptionMismatch(_)));
    }

    #[tokio::test]
    async fn test_matching_manifest_adopts_volumes_and_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut previous = test_job(&config);
        previous.start_time = Utc.timestamp_opt(1_753_900_000, 0).unwrap();
        previous.volumes.push(VolumeInfo::record(
            previous.volume_object_name(0),
            0,
            1_048_576,
            1_048_576,
        ));
        write_cached_manifest(&config, &previous);

        let mut job = test_job(&config);
        try_resume(&mut job, &config).await.unwrap();

        assert_eq!(job.volumes.len(), 1);
        assert_eq!(job.start_time, previous.start_time);
        let (skip, next) = job.total_streamed_and_vols();
        assert_eq!(skip, 1_048_576);
        assert_eq!(next, 1);
    }
}
