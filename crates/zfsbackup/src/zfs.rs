//! zfs command construction and snapshot listing.
//!
//! The send command's argument vector is deterministic for a given job
//! descriptor; resume validation compares reconstructed command lines, so
//! any change here invalidates previously cached manifests.

use std::process::Stdio;

use chrono::{TimeZone, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::error::{BackupError, Result};
use crate::job::{JobInfo, SnapshotInfo};

/// Argument vector for the `zfs send` producing this job's stream.
pub fn send_args(job: &JobInfo) -> Vec<String> {
    let mut args = vec!["send".to_string()];
    if let Some(inc) = &job.incremental_snapshot {
        args.push("-i".to_string());
        args.push(format!("{}@{}", job.volume_name, inc.name));
    }
    args.push(format!("{}@{}", job.volume_name, job.base_snapshot.name));
    args
}

/// Full command line string, as recorded in the manifest.
pub fn send_command_line(zfs_path: &str, job: &JobInfo) -> String {
    let mut parts = vec![zfs_path.to_string()];
    parts.extend(send_args(job));
    parts.join(" ")
}

/// Build the send subprocess with piped stdout. The child is killed on drop
/// so cancellation paths cannot leak a running `zfs send`.
pub fn send_command(zfs_path: &str, job: &JobInfo) -> Command {
    let mut cmd = Command::new(zfs_path);
    cmd.args(send_args(job))
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// List snapshots of `volume_name`, newest first.
pub async fn list_snapshots(zfs_path: &str, volume_name: &str) -> Result<Vec<SnapshotInfo>> {
    let output = Command::new(zfs_path)
        .args([
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation", "-S", "creation",
            "-d", "1", volume_name,
        ])
        .output()
        .await
        .map_err(|e| BackupError::Zfs(format!("could not run {}: {}", zfs_path, e)))?;

    if !output.status.success() {
        return Err(BackupError::Zfs(format!(
            "zfs list for {} exited with {}",
            volume_name, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let snapshots = parse_snapshot_list(&stdout, volume_name)?;
    debug!(
        "Found {} snapshots for {}",
        snapshots.len(),
        volume_name
    );
    Ok(snapshots)
}

/// Parse `zfs list -H -p -o name,creation` output into snapshot records.
///
/// Lines are `dataset@snapshot<TAB>unix-seconds`; the dataset prefix is
/// stripped so snapshot names stay short.
pub(crate) fn parse_snapshot_list(output: &str, volume_name: &str) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (full_name, creation) = line.split_once('\t').ok_or_else(|| {
            BackupError::Zfs(format!("unparseable zfs list line: {:?}", line))
        })?;
        let name = full_name
            .strip_prefix(volume_name)
            .and_then(|rest| rest.strip_prefix('@'))
            .ok_or_else(|| {
                BackupError::Zfs(format!(
                    "snapshot {} does not belong to {}",
                    full_name, volume_name
                ))
            })?;
        let secs: i64 = creation.trim().parse().map_err(|_| {
            BackupError::Zfs(format!("invalid creation time {:?} for {}", creation, full_name))
        })?;
        let creation_time = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| BackupError::Zfs(format!("creation time {} out of range", secs)))?;
        snapshots.push(SnapshotInfo::new(name, creation_time));
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn job_with_snapshots(base: &str, incremental: Option<&str>) -> JobInfo {
        let config = Config::from_yaml("destinations: [\"file:///tmp/b\"]").unwrap();
        let mut job = JobInfo::new("tank/data", &config);
        job.base_snapshot = SnapshotInfo::new(base, Utc::now());
        job.incremental_snapshot =
            incremental.map(|name| SnapshotInfo::new(name, Utc::now()));
        job
    }

    #[test]
    fn test_send_args_full() {
        let job = job_with_snapshots("daily-1", None);
        assert_eq!(send_args(&job), vec!["send", "tank/data@daily-1"]);
    }

    #[test]
    fn test_send_args_incremental() {
        let job = job_with_snapshots("daily-2", Some("daily-1"));
        assert_eq!(
            send_args(&job),
            vec!["send", "-i", "tank/data@daily-1", "tank/data@daily-2"]
        );
    }

    #[test]
    fn test_send_command_line_is_stable() {
        let job = job_with_snapshots("daily-2", Some("daily-1"));
        let line = send_command_line("zfs", &job);
        assert_eq!(line, "zfs send -i tank/data@daily-1 tank/data@daily-2");
        assert_eq!(line, send_command_line("zfs", &job));
    }

    #[test]
    fn test_parse_snapshot_list() {
        let output = "tank/data@daily-2\t1754000000\ntank/data@daily-1\t1753900000\n";
        let snaps = parse_snapshot_list(output, "tank/data").unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "daily-2");
        assert_eq!(snaps[1].name, "daily-1");
        assert!(snaps[0].creation_time > snaps[1].creation_time);
    }

    #[test]
    fn test_parse_snapshot_list_rejects_foreign_dataset() {
        let output = "tank/other@daily-1\t1753900000\n";
        assert!(parse_snapshot_list(output, "tank/data").is_err());
    }

    #[test]
    fn test_parse_snapshot_list_rejects_garbage() {
        assert!(parse_snapshot_list("not a snapshot line", "tank/data").is_err());
        assert!(parse_snapshot_list("tank/data@s\tnot-a-number", "tank/data").is_err());
    }
}
