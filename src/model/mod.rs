//! The merged view of remote and local files.
//!
//! [`Model`] maps top-level names to [`ModelFile`] trees. Every mutation is
//! broadcast to registered [`ModelListener`]s, which always receive owned
//! copies: nothing a listener does to them can leak back into the model.
//! [`diff`] compares two models and is how the controller turns a freshly built
//! model into a sequence of `add`/`remove`/`update` calls.

pub mod diff;
pub mod file;

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;

pub use diff::{diff, ChangeKind, ModelDiff};
pub use file::{FileState, ModelFile};

/// Errors raised by [`Model`] and [`ModelFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// `add` with a name already present.
    AlreadyExists(String),
    /// `remove`/`update`/`get` with an unknown name.
    NotFound(String),
    /// `add_child` on a file.
    NotADirectory(String),
    /// `add_child` with a name the parent already holds.
    DuplicateChild { parent: String, child: String },
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::AlreadyExists(name) => write!(f, "File already exists: {name}"),
            ModelError::NotFound(name) => write!(f, "File not found: {name}"),
            ModelError::NotADirectory(name) => {
                write!(f, "Cannot add child to non-directory: {name}")
            }
            ModelError::DuplicateChild { parent, child } => {
                write!(f, "Directory {parent} already has a child named {child}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Receives a copy of every model mutation, after it has been committed.
pub trait ModelListener: Send + Sync {
    fn file_added(&self, file: ModelFile);
    fn file_removed(&self, file: ModelFile);
    fn file_updated(&self, old_file: ModelFile, new_file: ModelFile);
}

/// Handle returned by [`Model::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Authoritative map of top-level name → file tree.
#[derive(Default)]
pub struct Model {
    files: BTreeMap<String, ModelFile>,
    listeners: Vec<(ListenerId, Box<dyn ModelListener>)>,
    next_listener_id: u64,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Box<dyn ModelListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn add(&mut self, file: ModelFile) -> Result<(), ModelError> {
        if self.files.contains_key(file.name()) {
            return Err(ModelError::AlreadyExists(file.name().to_string()));
        }
        let name = file.name().to_string();
        self.files.insert(name, file.clone());
        for (_, listener) in &self.listeners {
            listener.file_added(file.clone());
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), ModelError> {
        let removed = self
            .files
            .remove(name)
            .ok_or_else(|| ModelError::NotFound(name.to_string()))?;
        for (_, listener) in &self.listeners {
            listener.file_removed(removed.clone());
        }
        Ok(())
    }

    /// Replace the stored tree for `file.name()` wholesale.
    pub fn update(&mut self, mut file: ModelFile) -> Result<(), ModelError> {
        let slot = self
            .files
            .get_mut(file.name())
            .ok_or_else(|| ModelError::NotFound(file.name().to_string()))?;
        file.touch();
        let old = std::mem::replace(slot, file.clone());
        for (_, listener) in &self.listeners {
            listener.file_updated(old.clone(), file.clone());
        }
        Ok(())
    }

    /// Copy of the stored file.
    pub fn get(&self, name: &str) -> Result<ModelFile, ModelError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Names in sorted order.
    pub fn get_all_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Copies of every file, sorted by name.
    pub fn get_all_files(&self) -> Vec<ModelFile> {
        self.files.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub(crate) fn files(&self) -> &BTreeMap<String, ModelFile> {
        &self.files
    }
}

/// Model change as published to external observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    FileAdded { file: ModelFile },
    FileRemoved { file: ModelFile },
    FileUpdated { old_file: ModelFile, new_file: ModelFile },
}

/// Forwards model changes onto a broadcast channel.
///
/// Send errors (no subscribers) are ignored.
pub struct BroadcastListener {
    tx: broadcast::Sender<ModelEvent>,
}

impl BroadcastListener {
    pub fn new(tx: broadcast::Sender<ModelEvent>) -> Self {
        Self { tx }
    }
}

impl ModelListener for BroadcastListener {
    fn file_added(&self, file: ModelFile) {
        let _ = self.tx.send(ModelEvent::FileAdded { file });
    }

    fn file_removed(&self, file: ModelFile) {
        let _ = self.tx.send(ModelEvent::FileRemoved { file });
    }

    fn file_updated(&self, old_file: ModelFile, new_file: ModelFile) {
        let _ = self.tx.send(ModelEvent::FileUpdated { old_file, new_file });
    }
}
