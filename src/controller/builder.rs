//! Builds the next model from the controller's inputs.
//!
//! The builder holds the latest remote and local snapshots, the latest lftp
//! job list, and the controller's bookkeeping sets. [`ModelBuilder::build`]
//! turns all of it into a complete [`Model`]; the controller then diffs that
//! against the live model.
//!
//! A top-level state is decided by the first rule that applies:
//!
//! | rule                                          | state         |
//! |-----------------------------------------------|---------------|
//! | lftp job queued / running                     | `QUEUED` / `DOWNLOADING` |
//! | queue command sent, no job seen yet           | `QUEUED`      |
//! | extraction in flight                          | `EXTRACTING`  |
//! | stopped or deleted by command                 | `DELETED`     |
//! | transfer ended, awaiting a newer local scan   | `DOWNLOADING` |
//! | previously extracted, local copy present      | `EXTRACTED`   |
//! | local size ≥ remote size                      | `DOWNLOADED`  |
//! | local only, previously downloaded             | `DOWNLOADED`  |
//! | remote only, previously downloaded            | `DELETED`     |
//! | otherwise                                     | `DEFAULT`     |
//!
//! A job that leaves the lftp list stays `DOWNLOADING` until a local scan that
//! started after it ended has been merged, unless the local copy is already
//! complete.

use std::collections::{BTreeMap, BTreeSet};

use super::persist::ControllerPersist;
use crate::extract::is_archive;
use crate::lftp::{JobState, JobType, LftpJobStatus};
use crate::model::{FileState, Model, ModelError, ModelFile};
use crate::scan::SystemFile;

#[derive(Debug, Default)]
pub struct ModelBuilder {
    remote: BTreeMap<String, SystemFile>,
    local: BTreeMap<String, SystemFile>,
    jobs: BTreeMap<String, LftpJobStatus>,
    /// Queue commands sent to lftp that no status has shown yet.
    pub queued: BTreeSet<String>,
    /// Stopped or locally deleted by command.
    pub stopped: BTreeSet<String>,
    pub extracting: BTreeSet<String>,
    /// Jobs that left the lftp list, keyed to when that was seen (epoch ms).
    finished: BTreeMap<String, u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote_files(&mut self, files: Vec<SystemFile>) {
        self.remote = files.into_iter().map(|f| (f.name.clone(), f)).collect();
    }

    /// Replace the local snapshot taken by a scan that started at
    /// `scanned_at` (epoch ms).
    pub fn set_local_files(&mut self, files: Vec<SystemFile>, scanned_at: u64) {
        self.local = files.into_iter().map(|f| (f.name.clone(), f)).collect();
        self.finished.retain(|_, ended| *ended > scanned_at);
    }

    /// Replace the job list as seen at `now` (epoch ms). Returns the jobs
    /// that ended since the previous list, excluding stopped ones.
    pub fn set_lftp_statuses(&mut self, statuses: Vec<LftpJobStatus>, now: u64) -> Vec<String> {
        let jobs: BTreeMap<String, LftpJobStatus> = statuses
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        let ended: Vec<String> = self
            .jobs
            .keys()
            .filter(|name| !jobs.contains_key(*name) && !self.stopped.contains(*name))
            .cloned()
            .collect();
        for name in &ended {
            self.finished.insert(name.clone(), now);
        }
        for name in jobs.keys() {
            self.finished.remove(name);
        }
        self.jobs = jobs;
        ended
    }

    pub fn remove_local(&mut self, name: &str) {
        self.local.remove(name);
    }

    /// Forget a job lftp was told to drop from its queue.
    pub fn drop_queued_job(&mut self, name: &str) {
        if self
            .jobs
            .get(name)
            .is_some_and(|j| j.state() == JobState::Queued)
        {
            self.jobs.remove(name);
        }
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Whether the local copy is at least as large as the remote one.
    pub fn is_locally_complete(&self, name: &str) -> bool {
        match (self.remote.get(name), self.local.get(name)) {
            (Some(r), Some(l)) => l.is_dir == r.is_dir && l.size >= r.size,
            _ => false,
        }
    }

    /// Whether `name` appears in either snapshot.
    pub fn is_known(&self, name: &str) -> bool {
        self.remote.contains_key(name) || self.local.contains_key(name)
    }

    pub fn build(&self, persist: &ControllerPersist) -> Result<Model, ModelError> {
        let names: BTreeSet<&String> = self
            .remote
            .keys()
            .chain(self.local.keys())
            .chain(self.jobs.keys())
            .collect();

        let mut model = Model::new();
        for name in names {
            let remote = self.remote.get(name);
            let local = self.local.get(name);
            let job = self.jobs.get(name);

            let mut file = match (remote, local) {
                (None, None) => match job {
                    Some(job) => ModelFile::new(name.clone(), job.job_type() == JobType::Mirror),
                    None => continue,
                },
                _ => build_file(name, remote, local)?,
            };
            let local = local.filter(|l| remote.map_or(true, |r| r.is_dir == l.is_dir));
            file.set_state(self.top_level_state(name, remote, local, job, persist));
            if let Some(job) = job {
                apply_job_progress(&mut file, job);
            }
            model.add(file)?;
        }
        Ok(model)
    }

    fn top_level_state(
        &self,
        name: &str,
        remote: Option<&SystemFile>,
        local: Option<&SystemFile>,
        job: Option<&LftpJobStatus>,
        persist: &ControllerPersist,
    ) -> FileState {
        if let Some(job) = job {
            return match job.state() {
                JobState::Queued => FileState::Queued,
                JobState::Running => FileState::Downloading,
            };
        }
        if self.queued.contains(name) {
            return FileState::Queued;
        }
        if self.extracting.contains(name) {
            return FileState::Extracting;
        }
        if self.stopped.contains(name) {
            return FileState::Deleted;
        }
        if self.finished.contains_key(name) && !self.is_locally_complete(name) {
            return FileState::Downloading;
        }
        let downloaded = persist.downloaded.contains(name);
        match (remote, local) {
            (_, Some(_)) if persist.extracted.contains(name) => FileState::Extracted,
            (Some(r), Some(l)) if l.size >= r.size => FileState::Downloaded,
            (None, Some(_)) if downloaded => FileState::Downloaded,
            (Some(_), None) if downloaded => FileState::Deleted,
            _ => FileState::Default,
        }
    }
}

/// Merge one remote/local pair into a tree. On a file/directory mismatch the
/// remote side wins and the local side is ignored.
fn build_file(
    name: &str,
    remote: Option<&SystemFile>,
    local: Option<&SystemFile>,
) -> Result<ModelFile, ModelError> {
    let is_dir = match (remote, local) {
        (Some(r), _) => r.is_dir,
        (None, Some(l)) => l.is_dir,
        (None, None) => false,
    };
    let local = local.filter(|l| l.is_dir == is_dir);

    let mut file = ModelFile::new(name, is_dir);
    file.set_remote_size(remote.map(|r| r.size));
    file.set_local_size(local.map(|l| l.size));
    if let Some(r) = remote {
        file.set_remote_times(r.time_created, r.time_modified);
    }
    if let Some(l) = local {
        file.set_local_times(l.time_created, l.time_modified);
    }

    if is_dir {
        let remote_children: BTreeMap<&str, &SystemFile> = remote
            .map(|r| r.children.iter().map(|c| (c.name.as_str(), c)).collect())
            .unwrap_or_default();
        let local_children: BTreeMap<&str, &SystemFile> = local
            .map(|l| l.children.iter().map(|c| (c.name.as_str(), c)).collect())
            .unwrap_or_default();
        let names: BTreeSet<&str> = remote_children
            .keys()
            .chain(local_children.keys())
            .copied()
            .collect();

        let mut extractable = false;
        for child_name in names {
            let r = remote_children.get(child_name).copied();
            let l = local_children.get(child_name).copied();
            let mut child = build_file(child_name, r, l)?;
            if matches!((child.remote_size(), child.local_size()), (Some(rs), Some(ls)) if ls >= rs)
            {
                child.set_state(FileState::Downloaded);
            }
            extractable |= child.is_extractable();
            file.add_child(child)?;
        }
        file.set_extractable(extractable);
    } else {
        file.set_extractable(is_archive(name));
    }
    Ok(file)
}

fn apply_job_progress(file: &mut ModelFile, job: &LftpJobStatus) {
    if job.state() != JobState::Running {
        return;
    }
    if let Some(total) = job.total_transfer_state() {
        file.set_downloading_speed(total.speed);
        file.set_eta(total.eta);
    }
    if !file.is_dir() {
        return;
    }
    for (path, progress) in job.get_active_file_transfer_states() {
        if let Some(node) = file.descendant_mut(&path) {
            node.set_state(FileState::Downloading);
            node.set_downloading_speed(progress.speed);
            node.set_eta(progress.eta);
        }
    }
}
