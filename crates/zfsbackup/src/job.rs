//! Run descriptor types.
//!
//! [`JobInfo`] describes a single backup run and doubles as the manifest
//! payload: the JSON written to each destination is a direct serialization
//! of this struct, volumes included.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::volume::VolumeInfo;

/// Prefix shared by every manifest object name.
pub const MANIFEST_PREFIX: &str = "manifests|";

/// A ZFS snapshot identifier with its creation time.
///
/// Equality is structural; two snapshots are the same backup parent only if
/// both name and creation time match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Short snapshot name (the part after `@`).
    pub name: String,

    /// Snapshot creation time.
    pub creation_time: DateTime<Utc>,
}

impl Default for SnapshotInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            creation_time: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }
}

impl SnapshotInfo {
    /// Create a snapshot identifier.
    pub fn new(name: impl Into<String>, creation_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            creation_time,
        }
    }
}

/// The run descriptor, also the manifest payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Source dataset name (e.g. `tank/data`).
    pub volume_name: String,

    /// Snapshot this run sends.
    #[serde(default)]
    pub base_snapshot: SnapshotInfo,

    /// Parent snapshot for incremental sends; `None` for a full backup.
    #[serde(default)]
    pub incremental_snapshot: Option<SnapshotInfo>,

    /// Ordered destination URIs; order defines the backend chain order.
    pub destinations: Vec<String>,

    /// Target volume payload size in MiB.
    pub volume_size_mib: u64,

    /// Bound on simultaneously materialized volume files; 0 selects pipe mode.
    pub max_file_buffer: usize,

    /// Global bound on concurrent uploads across all destinations.
    pub max_parallel_uploads: usize,

    /// Opaque compressor option key; must match byte-for-byte to resume.
    #[serde(default)]
    pub compressor: String,

    /// Opaque encryption recipient option key; must match to resume.
    #[serde(default)]
    pub encrypt_to: String,

    /// Opaque signing identity option key; must match to resume.
    #[serde(default)]
    pub sign_from: String,

    /// Force a full backup.
    #[serde(default)]
    pub full: bool,

    /// Request an incremental backup from the most recent backed-up snapshot.
    #[serde(default)]
    pub incremental: bool,

    /// Do an incremental backup unless the last full backup is older than
    /// this window; `None` disables the age check.
    #[serde(default)]
    pub full_if_older_than: Option<Duration>,

    /// Continue the prior partial attempt for the same snapshot span.
    #[serde(default)]
    pub resume: bool,

    /// Completed volume descriptors, sorted by number, dense from 0.
    #[serde(default)]
    pub volumes: Vec<VolumeInfo>,

    /// When the run started.
    pub start_time: DateTime<Utc>,

    /// When the run finished; set just before the final manifest is built.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Total bytes read from the snapshot stream.
    #[serde(default)]
    pub stream_bytes: u64,

    /// The exact zfs send command line for this run.
    #[serde(default)]
    pub send_command_line: String,

    /// True only on the manifest written after every volume reached every
    /// destination; marks the terminal record of a completed run.
    #[serde(default)]
    pub final_manifest: bool,
}

impl JobInfo {
    /// Create a run descriptor for a dataset from the loaded configuration.
    ///
    /// Planner inputs (`full`, `incremental`, `full_if_older_than`, `resume`)
    /// and the snapshot selection are filled in by the caller.
    pub fn new(volume_name: impl Into<String>, config: &Config) -> Self {
        Self {
            volume_name: volume_name.into(),
            base_snapshot: SnapshotInfo::default(),
            incremental_snapshot: None,
            destinations: config.destinations.clone(),
            volume_size_mib: config.pipeline.volume_size_mib.unwrap_or(200),
            max_file_buffer: config.pipeline.max_file_buffer.unwrap_or(5),
            max_parallel_uploads: config.pipeline.max_parallel_uploads.unwrap_or(4),
            compressor: config.pipeline.compressor.clone(),
            encrypt_to: config.pipeline.encrypt_to.clone(),
            sign_from: config.pipeline.sign_from.clone(),
            full: false,
            incremental: false,
            full_if_older_than: None,
            resume: false,
            volumes: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            stream_bytes: 0,
            send_command_line: String::new(),
            final_manifest: false,
        }
    }

    /// The snapshot span this run covers, used in object names.
    fn snapshot_span(&self) -> String {
        match &self.incremental_snapshot {
            Some(inc) => format!("{}..{}", inc.name, self.base_snapshot.name),
            None => self.base_snapshot.name.clone(),
        }
    }

    /// Deterministic object name for volume `number`.
    ///
    /// Stable across runs for the same job descriptor; resume depends on it.
    pub fn volume_object_name(&self, number: u64) -> String {
        format!("{}|{}.vol{}", self.volume_name, self.snapshot_span(), number)
    }

    /// Deterministic object name for this run's manifest.
    pub fn manifest_object_name(&self) -> String {
        format!(
            "{}{}|{}",
            MANIFEST_PREFIX,
            self.volume_name,
            self.snapshot_span()
        )
    }

    /// Bytes already streamed into completed volumes, and the next volume
    /// number. Drives the stream skip on resume.
    pub fn total_streamed_and_vols(&self) -> (u64, u64) {
        let bytes = self.volumes.iter().map(|v| v.stream_bytes).sum();
        (bytes, self.volumes.len() as u64)
    }

    /// Total bytes written into volume objects so far.
    pub fn total_bytes_written(&self) -> u64 {
        self.volumes.iter().map(|v| v.size).sum()
    }

    /// Keep `volumes` ordered by volume number.
    pub fn sort_volumes(&mut self) {
        self.volumes.sort_by_key(|v| v.volume_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::from_yaml(
            r#"
destinations:
  - file:///tmp/backups
pipeline:
  volume_size_mib: 64
  max_file_buffer: 2
  max_parallel_uploads: 3
"#,
        )
        .unwrap()
    }

    fn snap(name: &str, secs: i64) -> SnapshotInfo {
        SnapshotInfo::new(name, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_object_names_are_stable() {
        let mut job = JobInfo::new("tank/data", &test_config());
        job.base_snapshot = snap("daily-2026-08-01", 1_000);

        assert_eq!(
            job.volume_object_name(0),
            "tank/data|daily-2026-08-01.vol0"
        );
        assert_eq!(
            job.manifest_object_name(),
            "manifests|tank/data|daily-2026-08-01"
        );
        // Same descriptor, same names.
        assert_eq!(job.volume_object_name(7), job.volume_object_name(7));
    }

    #[test]
    fn test_object_names_include_incremental_span() {
        let mut job = JobInfo::new("tank/data", &test_config());
        job.base_snapshot = snap("daily-2026-08-01", 2_000);
        job.incremental_snapshot = Some(snap("daily-2026-07-31", 1_000));

        assert_eq!(
            job.volume_object_name(3),
            "tank/data|daily-2026-07-31..daily-2026-08-01.vol3"
        );
        assert!(job
            .manifest_object_name()
            .starts_with("manifests|tank/data|daily-2026-07-31..daily-2026-08-01"));
    }

    #[test]
    fn test_total_streamed_and_vols() {
        let mut job = JobInfo::new("tank/data", &test_config());
        job.base_snapshot = snap("s1", 10);
        job.volumes.push(VolumeInfo::record(
            job.volume_object_name(0),
            0,
            1_048_576,
            1_050_000,
        ));
        job.volumes.push(VolumeInfo::record(
            job.volume_object_name(1),
            1,
            524_288,
            530_000,
        ));

        let (bytes, next) = job.total_streamed_and_vols();
        assert_eq!(bytes, 1_572_864);
        assert_eq!(next, 2);
        assert_eq!(job.total_bytes_written(), 1_580_000);
    }

    #[test]
    fn test_sort_volumes_orders_by_number() {
        let mut job = JobInfo::new("tank/data", &test_config());
        job.base_snapshot = snap("s1", 10);
        job.volumes
            .push(VolumeInfo::record(job.volume_object_name(2), 2, 10, 10));
        job.volumes
            .push(VolumeInfo::record(job.volume_object_name(0), 0, 10, 10));
        job.volumes
            .push(VolumeInfo::record(job.volume_object_name(1), 1, 10, 10));

        job.sort_volumes();
        let numbers: Vec<u64> = job.volumes.iter().map(|v| v.volume_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let mut job = JobInfo::new("tank/data", &test_config());
        job.base_snapshot = snap("s1", 42);
        job.incremental_snapshot = Some(snap("s0", 21));
        job.stream_bytes = 123;
        job.final_manifest = true;

        let json = serde_json::to_string(&job).unwrap();
        let decoded: JobInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.volume_name, "tank/data");
        assert_eq!(decoded.base_snapshot, job.base_snapshot);
        assert_eq!(decoded.incremental_snapshot, job.incremental_snapshot);
        assert_eq!(decoded.stream_bytes, 123);
        assert!(decoded.final_manifest);
    }

    #[test]
    fn test_snapshot_equality_is_structural() {
        assert_eq!(snap("a", 1), snap("a", 1));
        assert_ne!(snap("a", 1), snap("a", 2));
        assert_ne!(snap("a", 1), snap("b", 1));
    }
}
