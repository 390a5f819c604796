//! # zfsbackup
//!
//! Backup pipeline for ZFS snapshot streams.
//!
//! A `zfs send` stream is sliced into fixed-size volumes, each volume is
//! uploaded to every configured destination under bounded concurrency, and
//! a JSON manifest describing the run is persisted locally and at each
//! destination so an interrupted run can be resumed. Supports:
//!
//! - **Full and incremental backups** with smart parent selection from
//!   per-destination manifests
//! - **Multiple destinations** with a shared upload concurrency bound
//! - **Pipe mode** (no local staging, one volume in flight) or buffered
//!   mode (bounded staging files)
//! - **Resume capability** via per-destination manifest caches
//!
//! ## Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use zfsbackup::{backup, process_smart_options, Config, JobInfo};
//!
//! #[tokio::main]
//! async fn main() -> zfsbackup::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let mut job = JobInfo::new("tank/data", &config);
//!     job.incremental = true;
//!     process_smart_options(&mut job, &config).await?;
//!     let summary = backup(&config, job, CancellationToken::new()).await?;
//!     println!("Uploaded {} volumes", summary.volumes_uploaded);
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod backup;
pub mod config;
pub mod error;
pub mod job;
pub mod volume;
pub mod zfs;

// Re-exports for convenient access
pub use backup::planner::{process_smart_options, select_snapshots};
pub use backup::resume::try_resume;
pub use backup::{backup, BackupSummary};
pub use config::{Config, PipelineConfig, SystemResources, ZfsConfig};
pub use error::{BackupError, Result};
pub use job::{JobInfo, SnapshotInfo};
pub use volume::{Volume, VolumeInfo};
pub use zfs::list_snapshots;
