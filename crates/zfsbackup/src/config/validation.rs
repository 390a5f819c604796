//! Configuration validation.

use super::Config;
use crate::backends;
use crate::error::{BackupError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.destinations.is_empty() {
        return Err(BackupError::Config(
            "destinations must name at least one destination".into(),
        ));
    }

    for destination in &config.destinations {
        if destination == backends::DELETE_BACKEND_PREFIX {
            return Err(BackupError::Config(format!(
                "'{}' is reserved and cannot be used as a destination",
                backends::DELETE_BACKEND_PREFIX
            )));
        }
        if !backends::is_supported(destination) {
            return Err(BackupError::Config(format!(
                "unsupported destination '{}': expected a file:// URI",
                destination
            )));
        }
    }

    let mut seen = config.destinations.clone();
    seen.sort();
    seen.dedup();
    if seen.len() != config.destinations.len() {
        return Err(BackupError::Config(
            "destinations must not repeat".into(),
        ));
    }

    if let Some(0) = config.pipeline.volume_size_mib {
        return Err(BackupError::Config(
            "pipeline.volume_size_mib must be at least 1".into(),
        ));
    }
    if let Some(0) = config.pipeline.max_parallel_uploads {
        return Err(BackupError::Config(
            "pipeline.max_parallel_uploads must be at least 1".into(),
        ));
    }

    // Pipe mode carries a single consumable stream per volume, so it cannot
    // feed more than one destination.
    if config.pipeline.max_file_buffer == Some(0) && config.destinations.len() > 1 {
        return Err(BackupError::Config(
            "pipeline.max_file_buffer = 0 (pipe mode) supports exactly one destination".into(),
        ));
    }

    Ok(())
}
