//! Status of one lftp job, as reported by `jobs -v`.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    /// Recursive directory transfer.
    Mirror,
    /// Segmented single-file transfer.
    Pget,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::Pget => "pget",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "mirror" => Some(Self::Mirror),
            "pget" => Some(Self::Pget),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
}

/// Progress snapshot of a transfer. Any field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Bytes transferred so far.
    pub position: Option<u64>,
    /// Total bytes.
    pub size: Option<u64>,
    pub percent: Option<u8>,
    /// Bytes per second.
    pub speed: Option<u64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
}

/// Progress may only be reported for a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    NotRunning { job: String },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::NotRunning { job } => {
                write!(f, "Cannot set transfer state on job '{job}': job is not running")
            }
        }
    }
}

impl std::error::Error for StatusError {}

/// One queued or running lftp job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LftpJobStatus {
    /// lftp job id; `-1` while the job only sits in the queue.
    id: i32,
    job_type: JobType,
    state: JobState,
    name: String,
    flags: String,
    total_transfer_state: Option<TransferState>,
    active_files: BTreeMap<String, TransferState>,
}

impl LftpJobStatus {
    pub fn new(
        id: i32,
        job_type: JobType,
        state: JobState,
        name: impl Into<String>,
        flags: impl Into<String>,
    ) -> Self {
        Self {
            id,
            job_type,
            state,
            name: name.into(),
            flags: flags.into(),
            total_transfer_state: None,
            active_files: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    pub fn total_transfer_state(&self) -> Option<TransferState> {
        self.total_transfer_state
    }

    pub fn set_total_transfer_state(&mut self, state: TransferState) -> Result<(), StatusError> {
        self.ensure_running()?;
        self.total_transfer_state = Some(state);
        Ok(())
    }

    pub fn add_active_file_transfer_state(
        &mut self,
        file: impl Into<String>,
        state: TransferState,
    ) -> Result<(), StatusError> {
        self.ensure_running()?;
        self.active_files.insert(file.into(), state);
        Ok(())
    }

    /// Snapshot of per-file progress, keyed by path relative to the job root.
    pub fn get_active_file_transfer_states(&self) -> Vec<(String, TransferState)> {
        self.active_files
            .iter()
            .map(|(name, state)| (name.clone(), *state))
            .collect()
    }

    fn ensure_running(&self) -> Result<(), StatusError> {
        if self.state == JobState::Running {
            Ok(())
        } else {
            Err(StatusError::NotRunning {
                job: self.name.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> TransferState {
        TransferState {
            position: Some(10),
            size: Some(100),
            percent: Some(10),
            speed: Some(5),
            eta: Some(18),
        }
    }

    #[test]
    fn queued_job_rejects_progress() {
        let mut job = LftpJobStatus::new(-1, JobType::Pget, JobState::Queued, "a.mkv", "-c");
        assert!(matches!(
            job.set_total_transfer_state(progress()),
            Err(StatusError::NotRunning { .. })
        ));
        assert!(job
            .add_active_file_transfer_state("a.mkv", progress())
            .is_err());
        assert!(job.total_transfer_state().is_none());
        assert!(job.get_active_file_transfer_states().is_empty());
    }

    #[test]
    fn running_job_accepts_progress() {
        let mut job = LftpJobStatus::new(3, JobType::Mirror, JobState::Running, "show", "-c");
        job.set_total_transfer_state(progress()).unwrap();
        job.add_active_file_transfer_state("s01/e01.mkv", progress())
            .unwrap();
        job.add_active_file_transfer_state("s01/e02.mkv", TransferState::default())
            .unwrap();
        assert_eq!(job.total_transfer_state(), Some(progress()));
        let files = job.get_active_file_transfer_states();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&("s01/e01.mkv".to_string(), progress())));
    }

    #[test]
    fn job_type_labels() {
        assert_eq!(JobType::from_str_opt("pget"), Some(JobType::Pget));
        assert_eq!(JobType::from_str_opt("get"), None);
        assert_eq!(JobType::Mirror.as_str(), "mirror");
    }
}
