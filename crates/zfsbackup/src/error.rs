//! Error types for the backup library.

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration error (invalid YAML/JSON, missing fields, bad destination URI)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Smart selection found destinations whose manifests disagree
    #[error("destinations are out of sync, cannot continue with smart selection")]
    DestinationsOutOfSync,

    /// Incremental backup requested but no prior backup exists at the destinations
    #[error("no snapshot to increment from - try doing a full backup instead")]
    NoParent,

    /// The most recent local snapshot is already backed up
    #[error("no new snapshot to sync")]
    NoNewSnapshot,

    /// Resume attempted with options that differ from the cached manifest
    #[error("cannot resume backup: {0}")]
    OptionMismatch(String),

    /// Upload to a destination failed
    #[error("upload to {destination} failed: {message}")]
    Upload { destination: String, message: String },

    /// The zfs command failed to start, exited non-zero, or produced unparseable output
    #[error("zfs error: {0}")]
    Zfs(String),

    /// Internal pipeline failure (worker panic, channel wiring)
    #[error("pipeline failure: {0}")]
    Pipeline(String),

    /// IO error (stream read, volume write, cache copy)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The run was cancelled (SIGINT/SIGTERM or a peer task failed)
    #[error("backup cancelled")]
    Cancelled,
}

impl BackupError {
    /// Create an Upload error for a destination
    pub fn upload(destination: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Upload {
            destination: destination.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Map the error kind to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::DestinationsOutOfSync => 3,
            BackupError::NoParent => 4,
            BackupError::NoNewSnapshot => 5,
            BackupError::OptionMismatch(_) => 6,
            BackupError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
