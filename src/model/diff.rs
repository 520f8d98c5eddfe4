//! Snapshot comparison.

use super::{Model, ModelFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Updated,
}

/// One difference between two models.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDiff {
    pub change: ChangeKind,
    /// Absent for [`ChangeKind::Added`].
    pub old_file: Option<ModelFile>,
    /// Absent for [`ChangeKind::Removed`].
    pub new_file: Option<ModelFile>,
}

impl ModelDiff {
    /// Name of the file this diff is about.
    pub fn name(&self) -> &str {
        self.new_file
            .as_ref()
            .or(self.old_file.as_ref())
            .map_or("", ModelFile::name)
    }
}

/// Compare two models. Neither input is modified.
///
/// Output order is all additions, then removals, then updates, each sorted by
/// name. Names whose trees compare equal produce nothing.
pub fn diff(before: &Model, after: &Model) -> Vec<ModelDiff> {
    let before = before.files();
    let after = after.files();

    let added = after
        .iter()
        .filter(|(name, _)| !before.contains_key(*name))
        .map(|(_, file)| ModelDiff {
            change: ChangeKind::Added,
            old_file: None,
            new_file: Some(file.clone()),
        });

    let removed = before
        .iter()
        .filter(|(name, _)| !after.contains_key(*name))
        .map(|(_, file)| ModelDiff {
            change: ChangeKind::Removed,
            old_file: Some(file.clone()),
            new_file: None,
        });

    let updated = before.iter().filter_map(|(name, old)| {
        let new = after.get(name)?;
        (old != new).then(|| ModelDiff {
            change: ChangeKind::Updated,
            old_file: Some(old.clone()),
            new_file: Some(new.clone()),
        })
    });

    added.chain(removed).chain(updated).collect()
}
