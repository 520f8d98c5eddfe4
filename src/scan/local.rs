//! Walk a local directory into a snapshot.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use super::{ScanError, SystemFile};
use crate::util::epoch_secs;

/// lftp's in-progress bookkeeping files, never part of a snapshot.
const EXCLUDED_SUFFIXES: &[&str] = &[".lftp-pget-status", ".lftp"];

fn is_excluded(name: &str) -> bool {
    EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Scan the entries directly under `root`, recursively.
///
/// Symlinks are skipped, as are entries that disappear while the scan runs.
pub fn scan_local(root: &Path) -> Result<Vec<SystemFile>, ScanError> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => scan_dir(root),
        Ok(_) => Err(ScanError::NotADirectory(root.display().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ScanError::NotADirectory(root.display().to_string()))
        }
        Err(e) => Err(io_error(root, &e)),
    }
}

fn scan_dir(dir: &Path) -> Result<Vec<SystemFile>, ScanError> {
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, &e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, &e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_excluded(&name) {
            continue;
        }
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error(&path, &e)),
        };
        if meta.file_type().is_symlink() {
            continue;
        }

        let time_created = meta.created().ok().and_then(epoch_secs);
        let time_modified = meta.modified().ok().and_then(epoch_secs);
        let mut file = if meta.is_dir() {
            match scan_dir(&path) {
                Ok(children) => SystemFile::dir(name, children),
                Err(ScanError::Io { .. }) if !path.exists() => continue,
                Err(e) => return Err(e),
            }
        } else {
            SystemFile::file(name, meta.len())
        };
        file.time_created = time_created;
        file.time_modified = time_modified;
        files.push(file);
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn io_error(path: &Path, e: &std::io::Error) -> ScanError {
    ScanError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    }
}
