//! Smart selection: full vs incremental and the parent snapshot.
//!
//! The planner inspects the manifests each destination holds and refuses to
//! proceed when destinations disagree about the last comparable backup.

use tracing::info;

use super::manifest::backups_for_destination;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::job::{JobInfo, SnapshotInfo};
use crate::zfs;

/// Compute the snapshots this run will use, reading per-destination
/// manifests. Leaves `incremental_snapshot` unset when the run should be a
/// full backup.
pub async fn process_smart_options(job: &mut JobInfo, config: &Config) -> Result<()> {
    let snapshots = zfs::list_snapshots(&config.zfs.path, &job.volume_name).await?;

    // A full backup does not depend on destination state; select the base
    // snapshot without reading any destination's manifests.
    if job.full {
        return select_snapshots(job, &snapshots, &[]);
    }

    let mut per_destination = Vec::with_capacity(job.destinations.len());
    for destination in &job.destinations {
        per_destination
            .push(backups_for_destination(config, destination, &job.volume_name).await?);
    }

    select_snapshots(job, &snapshots, &per_destination)
}

/// Pure selection over already-gathered inputs.
///
/// `snapshots` is the dataset's snapshot list, newest first;
/// `per_destination` holds each destination's decoded manifests sorted by
/// base-snapshot creation time, newest first.
pub fn select_snapshots(
    job: &mut JobInfo,
    snapshots: &[SnapshotInfo],
    per_destination: &[Vec<JobInfo>],
) -> Result<()> {
    let Some(latest) = snapshots.first() else {
        return Err(BackupError::Zfs(format!(
            "no snapshots exist for {}",
            job.volume_name
        )));
    };
    job.base_snapshot = latest.clone();

    if job.full {
        return Ok(());
    }

    let count = job.destinations.len();
    let mut last_comparable: Vec<Option<SnapshotInfo>> = vec![None; count];
    let mut last_backup: Vec<Option<SnapshotInfo>> = vec![None; count];

    for (idx, manifests) in per_destination.iter().enumerate() {
        let Some(most_recent) = manifests.first() else {
            continue;
        };
        last_backup[idx] = Some(most_recent.base_snapshot.clone());
        if job.incremental {
            last_comparable[idx] = Some(most_recent.base_snapshot.clone());
        }
        if job.full_if_older_than.is_some() {
            last_comparable[idx] = manifests
                .iter()
                .find(|m| m.incremental_snapshot.is_none())
                .map(|m| m.base_snapshot.clone());
        }
    }

    // Every destination must agree on the last comparable snapshot.
    let mut last_not_equal = false;
    for idx in 1..count {
        if last_comparable[idx - 1] != last_comparable[idx] {
            return Err(BackupError::DestinationsOutOfSync);
        }
        if !last_not_equal && last_backup[idx - 1] != last_backup[idx] {
            last_not_equal = true;
        }
    }

    if job.incremental {
        match last_comparable[0].as_ref() {
            None => return Err(BackupError::NoParent),
            Some(parent) if parent == latest => return Err(BackupError::NoNewSnapshot),
            Some(parent) => job.incremental_snapshot = Some(parent.clone()),
        }
    }

    if let Some(window) = job.full_if_older_than {
        let Some(last_full) = last_comparable[0].as_ref() else {
            info!("No previous full backup found, performing full backup");
            return Ok(());
        };
        let age = latest.creation_time - last_full.creation_time;
        if age.to_std().unwrap_or_default() > window {
            info!(
                "Last full backup at {} is older than the {}s window, performing full backup",
                last_full.creation_time,
                window.as_secs()
            );
            return Ok(());
        }
        if last_not_equal {
            return Err(BackupError::DestinationsOutOfSync);
        }
        if last_backup[0].as_ref() == Some(latest) {
            return Err(BackupError::NoNewSnapshot);
        }
        job.incremental_snapshot = last_backup[0].clone();
    }

    Ok(())
}
