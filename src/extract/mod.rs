//! Archive detection and extraction.
//!
//! Tar-family archives are unpacked with `tar -xf`, everything else with
//! `7z x`. A downloaded directory is searched recursively and each archive is
//! unpacked into the same relative location under the output directory.

pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::shell::{exec_program, ExecError};

/// Upper bound for unpacking a single archive.
const EXTRACT_TIMEOUT_MS: u64 = 6 * 60 * 60 * 1000;

const TAR_SUFFIXES: &[&str] = &[
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz",
];

const OTHER_SUFFIXES: &[&str] = &[".zip", ".rar", ".7z", ".gz", ".bz2", ".xz"];

/// `name.part3.rar`; only the first volume starts an extraction.
static RAR_VOLUME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.part0*(\d+)\.rar$").expect("valid regex"));

fn is_tar(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TAR_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Whether `name` looks like an archive worth extracting.
pub fn is_archive(name: &str) -> bool {
    if let Some(caps) = RAR_VOLUME.captures(name) {
        return &caps[1] == "1";
    }
    let lower = name.to_ascii_lowercase();
    is_tar(&lower) || OTHER_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Sent to the extract worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
    /// Top-level model name.
    pub name: String,
    pub is_dir: bool,
    /// Where the download lives locally.
    pub local_path: String,
    pub out_dir: String,
}

/// Outcome of one [`ExtractRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExtractEvent {
    Completed { name: String },
    Failed { name: String, message: String },
}

#[derive(Debug)]
pub enum ExtractError {
    /// A single file that is not an archive.
    NotAnArchive(String),
    /// A directory with no archives anywhere inside.
    NoArchives(String),
    /// tar/7z could not be run.
    Exec(String),
    /// tar/7z ran and failed.
    Failed { archive: String, message: String },
    Io(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::NotAnArchive(p) => write!(f, "Not an archive: {p}"),
            ExtractError::NoArchives(p) => write!(f, "No archives found in {p}"),
            ExtractError::Exec(e) => write!(f, "Failed to run extractor: {e}"),
            ExtractError::Failed { archive, message } => {
                write!(f, "Extraction of {archive} failed: {message}")
            }
            ExtractError::Io(e) => write!(f, "Extraction I/O error: {e}"),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<ExecError> for ExtractError {
    fn from(e: ExecError) -> Self {
        ExtractError::Exec(e.to_string())
    }
}

/// Unpack one archive into `out_dir`, creating it if needed.
pub async fn extract_archive(archive: &Path, out_dir: &Path) -> Result<(), ExtractError> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_archive(&name) {
        return Err(ExtractError::NotAnArchive(archive.display().to_string()));
    }
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| ExtractError::Io(format!("{}: {e}", out_dir.display())))?;

    let archive_str = archive.display().to_string();
    let out_str = out_dir.display().to_string();
    let (program, args) = if is_tar(&name) {
        ("tar", vec!["-xf".to_string(), archive_str.clone(), "-C".to_string(), out_str])
    } else {
        (
            "7z",
            vec![
                "x".to_string(),
                "-y".to_string(),
                format!("-o{out_str}"),
                archive_str.clone(),
            ],
        )
    };
    debug!(program, archive = %archive_str, "Extracting");
    let res = exec_program(program, &args, None, EXTRACT_TIMEOUT_MS).await?;
    if !res.success() {
        return Err(ExtractError::Failed {
            archive: archive_str,
            message: format!("exit code {}: {}", res.exit_code, res.stderr_tail()),
        });
    }
    Ok(())
}

/// Archives under `dir`, with their directory relative to `dir`.
fn find_archives(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ExtractError> {
    let mut found = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let abs = dir.join(&rel);
        let entries =
            std::fs::read_dir(&abs).map_err(|e| ExtractError::Io(format!("{}: {e}", abs.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| ExtractError::Io(e.to_string()))?;
            let file_type = entry
                .file_type()
                .map_err(|e| ExtractError::Io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                stack.push(rel.join(&name));
            } else if file_type.is_file() && is_archive(&name) {
                found.push((entry.path(), rel.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Carry out one request.
///
/// A file is unpacked straight into `out_dir`. For a directory, each archive
/// found at `<local_path>/<rel>` is unpacked into `<out_dir>/<name>/<rel>`.
pub async fn extract_request(req: &ExtractRequest) -> Result<(), ExtractError> {
    let local = Path::new(&req.local_path);
    let out_dir = Path::new(&req.out_dir);
    if !req.is_dir {
        extract_archive(local, out_dir).await?;
        info!(name = %req.name, "Extracted");
        return Ok(());
    }

    let root = local.to_path_buf();
    let archives = tokio::task::spawn_blocking(move || find_archives(&root))
        .await
        .map_err(|e| ExtractError::Io(e.to_string()))??;
    if archives.is_empty() {
        return Err(ExtractError::NoArchives(req.local_path.clone()));
    }
    for (archive, rel) in &archives {
        extract_archive(archive, &out_dir.join(&req.name).join(rel)).await?;
    }
    info!(name = %req.name, archives = archives.len(), "Extracted");
    Ok(())
}
