//! Controller state that survives a restart.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum PersistError {
    Io { path: String, error: String },
    Format { path: String, error: String },
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io { path, error } => write!(f, "Failed to access {path}: {error}"),
            PersistError::Format { path, error } => write!(f, "Malformed {path}: {error}"),
        }
    }
}

impl std::error::Error for PersistError {}

/// Names the controller has already handled.
///
/// A name in `downloaded` is never auto-queued again. Neither set shrinks on
/// STOP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerPersist {
    #[serde(default)]
    pub downloaded: BTreeSet<String>,
    #[serde(default)]
    pub extracted: BTreeSet<String>,
}

impl ControllerPersist {
    pub fn from_json(content: &str) -> Result<Self, PersistError> {
        serde_json::from_str(content).map_err(|e| PersistError::Format {
            path: "controller state".to_string(),
            error: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistError::Format {
            path: "controller state".to_string(),
            error: e.to_string(),
        })
    }

    /// Load from `path`; a missing file is an empty record.
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        match read_optional(path)? {
            Some(content) => serde_json::from_str(&content).map_err(|e| PersistError::Format {
                path: path.display().to_string(),
                error: e.to_string(),
            }),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), PersistError> {
        write_atomic(path, &self.to_json()?).await
    }
}

/// Read `path`, `None` if it does not exist. Used at startup only.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, PersistError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        }),
    }
}

/// Write through a temp file and rename, so readers never see a partial file.
pub(crate) async fn write_atomic(path: &Path, content: &str) -> Result<(), PersistError> {
    let io_err = |e: std::io::Error| PersistError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let mut persist = ControllerPersist::default();
        persist.downloaded.insert("b".into());
        persist.downloaded.insert("a \"quoted\" name".into());
        persist.extracted.insert("b".into());
        let back = ControllerPersist::from_json(&persist.to_json().unwrap()).unwrap();
        assert_eq!(back, persist);
    }

    #[test]
    fn record_without_extracted_loads() {
        let persist = ControllerPersist::from_json(r#"{"downloaded":["x","y"]}"#).unwrap();
        assert_eq!(persist.downloaded.len(), 2);
        assert!(persist.extracted.is_empty());
    }

    #[test]
    fn malformed_record_is_an_error() {
        assert!(matches!(
            ControllerPersist::from_json("{\"downloaded\": 3}"),
            Err(PersistError::Format { .. })
        ));
    }

    #[tokio::test]
    async fn save_and_load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/controller.json");
        assert_eq!(
            ControllerPersist::load(&path).unwrap(),
            ControllerPersist::default()
        );

        let mut persist = ControllerPersist::default();
        persist.downloaded.insert("show".into());
        persist.save(&path).await.unwrap();
        assert_eq!(ControllerPersist::load(&path).unwrap(), persist);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn save_runs_alongside_other_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("controller.json");
        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        });

        let mut persist = ControllerPersist::default();
        for i in 0..20 {
            persist.extracted.insert(format!("pack{i}.rar"));
            persist.save(&path).await.unwrap();
        }
        ticker.await.unwrap();
        assert_eq!(ControllerPersist::load(&path).unwrap(), persist);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn save_into_unwritable_location_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = ControllerPersist::default()
            .save(&blocker.join("controller.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }));
    }
}
