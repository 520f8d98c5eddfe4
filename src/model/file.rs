//! A single node of the merged remote/local file tree.
//!
//! [`ModelFile`] owns its children outright. The link back to the parent is
//! kept as the parent's full path (set by [`ModelFile::add_child`]), so clones
//! stay self-contained and never alias another tree.

use std::time::SystemTime;

use serde::Serialize;

use super::ModelError;

/// Lifecycle state of a file as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Seen remotely, nothing requested yet.
    Default,
    /// Transfer requested but not started.
    Queued,
    Downloading,
    /// Local copy is complete.
    Downloaded,
    Extracting,
    Extracted,
    /// Stopped by the user, or downloaded earlier and since removed locally.
    Deleted,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Deleted => "deleted",
        }
    }
}

/// One file or directory in the model tree.
///
/// All mutation goes through setters, each of which refreshes
/// `update_timestamp`. Equality ignores the timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct ModelFile {
    name: String,
    is_dir: bool,
    state: FileState,
    remote_size: Option<u64>,
    local_size: Option<u64>,
    /// Bytes per second.
    downloading_speed: Option<u64>,
    /// Seconds.
    eta: Option<u64>,
    is_extractable: bool,
    local_created: Option<u64>,
    local_modified: Option<u64>,
    remote_created: Option<u64>,
    remote_modified: Option<u64>,
    #[serde(skip)]
    update_timestamp: SystemTime,
    #[serde(skip)]
    parent_path: Option<String>,
    children: Vec<ModelFile>,
}

impl ModelFile {
    pub fn new(name: impl Into<String>, is_dir: bool) -> Self {
        Self {
            name: name.into(),
            is_dir,
            state: FileState::Default,
            remote_size: None,
            local_size: None,
            downloading_speed: None,
            eta: None,
            is_extractable: false,
            local_created: None,
            local_modified: None,
            remote_created: None,
            remote_modified: None,
            update_timestamp: SystemTime::now(),
            parent_path: None,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn remote_size(&self) -> Option<u64> {
        self.remote_size
    }

    pub fn local_size(&self) -> Option<u64> {
        self.local_size
    }

    pub fn downloading_speed(&self) -> Option<u64> {
        self.downloading_speed
    }

    pub fn eta(&self) -> Option<u64> {
        self.eta
    }

    pub fn is_extractable(&self) -> bool {
        self.is_extractable
    }

    pub fn local_created(&self) -> Option<u64> {
        self.local_created
    }

    pub fn local_modified(&self) -> Option<u64> {
        self.local_modified
    }

    pub fn remote_created(&self) -> Option<u64> {
        self.remote_created
    }

    pub fn remote_modified(&self) -> Option<u64> {
        self.remote_modified
    }

    pub fn update_timestamp(&self) -> SystemTime {
        self.update_timestamp
    }

    pub fn children(&self) -> &[ModelFile] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&ModelFile> {
        self.children.iter().find(|c| c.name == name)
    }

    /// `/`-joined names from the tree root down to this node.
    pub fn full_path(&self) -> String {
        match &self.parent_path {
            Some(parent) => format!("{parent}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Full path of the parent node, `None` at the top level.
    pub fn parent_path(&self) -> Option<&str> {
        self.parent_path.as_deref()
    }

    pub fn set_state(&mut self, state: FileState) {
        self.state = state;
        self.touch();
    }

    pub fn set_remote_size(&mut self, size: Option<u64>) {
        self.remote_size = size;
        self.touch();
    }

    pub fn set_local_size(&mut self, size: Option<u64>) {
        self.local_size = size;
        self.touch();
    }

    pub fn set_downloading_speed(&mut self, speed: Option<u64>) {
        self.downloading_speed = speed;
        self.touch();
    }

    pub fn set_eta(&mut self, eta: Option<u64>) {
        self.eta = eta;
        self.touch();
    }

    pub fn set_extractable(&mut self, extractable: bool) {
        self.is_extractable = extractable;
        self.touch();
    }

    pub fn set_local_times(&mut self, created: Option<u64>, modified: Option<u64>) {
        self.local_created = created;
        self.local_modified = modified;
        self.touch();
    }

    pub fn set_remote_times(&mut self, created: Option<u64>, modified: Option<u64>) {
        self.remote_created = created;
        self.remote_modified = modified;
        self.touch();
    }

    /// Attach `child` under this directory.
    ///
    /// Fails on a non-directory and on a name already present.
    pub fn add_child(&mut self, mut child: ModelFile) -> Result<(), ModelError> {
        if !self.is_dir {
            return Err(ModelError::NotADirectory(self.full_path()));
        }
        if self.children.iter().any(|c| c.name == child.name) {
            return Err(ModelError::DuplicateChild {
                parent: self.full_path(),
                child: child.name,
            });
        }
        child.reparent(self.full_path());
        self.children.push(child);
        self.touch();
        Ok(())
    }

    /// Find a descendant by its path relative to this node (`"sub/file"`).
    pub fn descendant_mut(&mut self, relative: &str) -> Option<&mut ModelFile> {
        let mut node = self;
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            node = node.children.iter_mut().find(|c| c.name == part)?;
        }
        Some(node)
    }

    /// Bump `update_timestamp`, never moving it backwards.
    pub(crate) fn touch(&mut self) {
        self.update_timestamp = SystemTime::now().max(self.update_timestamp);
    }

    fn reparent(&mut self, parent: String) {
        self.parent_path = Some(parent);
        let path = self.full_path();
        for child in &mut self.children {
            child.reparent(path.clone());
        }
    }
}

impl PartialEq for ModelFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.is_dir == other.is_dir
            && self.state == other.state
            && self.remote_size == other.remote_size
            && self.local_size == other.local_size
            && self.downloading_speed == other.downloading_speed
            && self.eta == other.eta
            && self.is_extractable == other.is_extractable
            && self.local_created == other.local_created
            && self.local_modified == other.local_modified
            && self.remote_created == other.remote_created
            && self.remote_modified == other.remote_modified
            && self.children == other.children
    }
}

impl Eq for ModelFile {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn equality_ignores_update_timestamp() {
        let mut a = ModelFile::new("a", false);
        a.set_remote_size(Some(100));
        let mut b = a.clone();
        std::thread::sleep(Duration::from_millis(5));
        b.set_remote_size(Some(100));
        assert!(b.update_timestamp() >= a.update_timestamp());
        assert_eq!(a, b);
    }

    #[test]
    fn equality_checks_children_in_order() {
        let mut a = ModelFile::new("dir", true);
        a.add_child(ModelFile::new("x", false)).unwrap();
        a.add_child(ModelFile::new("y", false)).unwrap();
        let mut b = ModelFile::new("dir", true);
        b.add_child(ModelFile::new("y", false)).unwrap();
        b.add_child(ModelFile::new("x", false)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn add_child_to_file_fails() {
        let mut file = ModelFile::new("movie.mkv", false);
        let err = file.add_child(ModelFile::new("x", false)).unwrap_err();
        assert!(matches!(err, ModelError::NotADirectory(ref p) if p == "movie.mkv"));
    }

    #[test]
    fn add_duplicate_child_fails() {
        let mut dir = ModelFile::new("dir", true);
        dir.add_child(ModelFile::new("x", false)).unwrap();
        let err = dir.add_child(ModelFile::new("x", true)).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateChild { .. }));
        assert_eq!(dir.children().len(), 1);
    }

    #[test]
    fn full_path_three_levels() {
        let mut c = ModelFile::new("c", false);
        c.set_remote_size(Some(1));
        let mut b = ModelFile::new("b", true);
        b.add_child(c).unwrap();
        let mut a = ModelFile::new("a", true);
        a.add_child(b).unwrap();

        let b = a.child("b").unwrap();
        let c = b.child("c").unwrap();
        assert_eq!(a.full_path(), "a");
        assert_eq!(b.full_path(), "a/b");
        assert_eq!(c.full_path(), "a/b/c");
        assert_eq!(c.parent_path(), Some("a/b"));
    }

    #[test]
    fn descendant_lookup() {
        let mut sub = ModelFile::new("sub", true);
        sub.add_child(ModelFile::new("file", false)).unwrap();
        let mut root = ModelFile::new("root", true);
        root.add_child(sub).unwrap();

        let node = root.descendant_mut("sub/file").unwrap();
        node.set_state(FileState::Downloading);
        assert_eq!(
            root.child("sub").unwrap().child("file").unwrap().state(),
            FileState::Downloading
        );
        assert!(root.descendant_mut("sub/missing").is_none());
    }
}
