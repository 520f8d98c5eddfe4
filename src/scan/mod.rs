//! File tree snapshots.
//!
//! A scan produces the root-level entries of a directory as [`SystemFile`]
//! trees: children sorted by name, directory size equal to the sum of the file
//! sizes beneath it, timestamps in seconds since the epoch. The local tree is
//! walked directly ([`local`]); the seedbox is scanned by running
//! `seedsync scan` over ssh ([`remote`]). [`worker::ScannerWorker`] repeats
//! either one on an interval inside a supervised worker process.

pub mod local;
pub mod remote;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::shell::ExecError;
use crate::util::now_millis;

/// One file or directory in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFile {
    pub name: String,
    /// Bytes; for a directory, the total of every file beneath it.
    pub size: u64,
    pub is_dir: bool,
    #[serde(default)]
    pub time_created: Option<u64>,
    #[serde(default)]
    pub time_modified: Option<u64>,
    #[serde(default)]
    pub children: Vec<SystemFile>,
}

impl SystemFile {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            time_created: None,
            time_modified: None,
            children: Vec::new(),
        }
    }

    /// Directory holding `children`, which are sorted and summed.
    pub fn dir(name: impl Into<String>, mut children: Vec<SystemFile>) -> Self {
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            name: name.into(),
            size: children.iter().map(|c| c.size).sum(),
            is_dir: true,
            time_created: None,
            time_modified: None,
            children,
        }
    }
}

/// One snapshot as delivered by a scanner worker.
///
/// A failed scan carries no files and must not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// When the scan started, milliseconds since the epoch. Anything that
    /// finished on disk before this instant is reflected in `files`.
    pub timestamp: u64,
    pub files: Vec<SystemFile>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ScanResult {
    pub fn ok(files: Vec<SystemFile>) -> Self {
        Self {
            timestamp: now_millis(),
            files,
            failed: false,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            timestamp: now_millis(),
            files: Vec::new(),
            failed: true,
            error_message: Some(message.into()),
        }
    }

    /// Stamp the result with the instant its scan began.
    #[must_use]
    pub fn started_at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Errors from a single scan attempt.
#[derive(Debug)]
pub enum ScanError {
    /// Reading the local tree failed.
    Io { path: String, error: String },
    /// The scan root is missing or not a directory.
    NotADirectory(String),
    /// ssh could not be run, or the remote command failed.
    Remote(String),
    /// The remote command printed something that is not a snapshot.
    Parse(String),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Io { path, error } => write!(f, "Failed to scan {path}: {error}"),
            ScanError::NotADirectory(path) => write!(f, "Scan root is not a directory: {path}"),
            ScanError::Remote(e) => write!(f, "Remote scan failed: {e}"),
            ScanError::Parse(e) => write!(f, "Invalid remote scan output: {e}"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<ExecError> for ScanError {
    fn from(e: ExecError) -> Self {
        ScanError::Remote(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_sums_and_sorts_children() {
        let dir = SystemFile::dir(
            "d",
            vec![
                SystemFile::file("b", 2),
                SystemFile::dir("a", vec![SystemFile::file("x", 5)]),
            ],
        );
        assert_eq!(dir.size, 7);
        assert_eq!(dir.children[0].name, "a");
        assert_eq!(dir.children[1].name, "b");
    }

    #[test]
    fn snapshot_json_tolerates_missing_optionals() {
        let files: Vec<SystemFile> =
            serde_json::from_str(r#"[{"name":"a","size":3,"is_dir":false}]"#).unwrap();
        assert_eq!(files, vec![SystemFile::file("a", 3)]);
    }

    #[test]
    fn failure_result_has_no_files() {
        let res = ScanResult::failure("ssh: connection refused");
        assert!(res.failed);
        assert!(res.files.is_empty());
        assert_eq!(res.error_message.as_deref(), Some("ssh: connection refused"));
    }
}
