//! Configuration type definitions with auto-tuning based on system resources.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    /// Uses targeted refresh to avoid expensive parsing of all processes, disks, and networks.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ordered destination URIs; order defines the backend chain order.
    pub destinations: Vec<String>,

    /// Directory holding the per-destination manifest caches.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Pipeline behavior configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// zfs command configuration.
    #[serde(default)]
    pub zfs: ZfsConfig,
}

impl Config {
    /// Root of the per-destination manifest caches.
    pub fn cache_root(&self) -> PathBuf {
        self.working_dir.join("cache")
    }
}

/// Pipeline behavior configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target volume payload size in MiB. Defaults to 200 if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size_mib: Option<u64>,

    /// Bound on simultaneously materialized volume files; 0 selects pipe
    /// mode. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_buffer: Option<usize>,

    /// Global bound on concurrent uploads. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_uploads: Option<usize>,

    /// Opaque compressor option key, recorded in the manifest.
    #[serde(default)]
    pub compressor: String,

    /// Opaque encryption recipient option key, recorded in the manifest.
    #[serde(default)]
    pub encrypt_to: String,

    /// Opaque signing identity option key, recorded in the manifest.
    #[serde(default)]
    pub sign_from: String,
}

impl PipelineConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set); an explicit
    /// `max_file_buffer: 0` (pipe mode) is preserved.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.volume_size_mib.is_none() {
            self.volume_size_mib = Some(200);
        }

        if self.max_file_buffer.is_none() {
            // One staged volume per 2 GB of RAM, capped at 5.
            let buffers = ((resources.total_memory_gb / 2.0) as usize).clamp(1, 5);
            self.max_file_buffer = Some(buffers);
        }

        if self.max_parallel_uploads.is_none() {
            let uploads = resources.cpu_cores.clamp(2, 8);
            self.max_parallel_uploads = Some(uploads);
        }

        info!(
            "Pipeline tuning: volume_size_mib={}, max_file_buffer={}, max_parallel_uploads={}",
            self.volume_size_mib.unwrap_or_default(),
            self.max_file_buffer.unwrap_or_default(),
            self.max_parallel_uploads.unwrap_or_default()
        );

        self
    }
}

/// zfs command configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsConfig {
    /// Path to the zfs binary.
    #[serde(default = "default_zfs_path")]
    pub path: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            path: default_zfs_path(),
        }
    }
}

fn default_zfs_path() -> String {
    "zfs".to_string()
}

fn default_working_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".zfsbackup"),
        None => PathBuf::from(".zfsbackup"),
    }
}
