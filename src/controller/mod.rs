//! The controller: merges scans, lftp status and commands into the model.
//!
//! One [`Controller`] owns the [`Model`] outright. Each tick it:
//!
//! 1. surfaces any worker failure (fatal to the daemon),
//! 2. takes the newest remote and local snapshots ("latest result wins"),
//! 3. polls lftp job status at its own interval, asking for a local rescan
//!    when a job has left the list,
//! 4. drains extraction events (every one, in order),
//! 5. rebuilds the complete next model with [`ModelBuilder`], diffs it
//!    against the live one and applies the diffs, which notifies listeners,
//! 6. reacts to the diffs: records completed downloads, auto-extracts
//!    transfers that just finished, and auto-queues.
//!
//! Commands arrive on a channel and are handled between ticks. A command's
//! callbacks run after its effect has been applied to the model.

pub mod autoqueue;
pub mod builder;
pub mod persist;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::extract::{ExtractEvent, ExtractRequest};
use crate::lftp::{LftpError, TransferClient};
use crate::model::{diff, BroadcastListener, ChangeKind, FileState, Model, ModelDiff, ModelError, ModelEvent};
use crate::scan::ScanResult;
use crate::supervisor::{WorkerError, WorkerProcess};
use crate::util::now_millis;
pub use autoqueue::{AutoQueuePattern, AutoQueuePatterns, PatternError, PatternStore};
pub use builder::ModelBuilder;
pub use persist::{ControllerPersist, PersistError};

/// Upper bound on rebuild passes per tick when auto-queue or auto-extract
/// keeps changing the inputs.
const MAX_REBUILDS: usize = 4;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ControllerError {
    /// A worker failed; the daemon must stop.
    Worker(WorkerError),
    /// The transfer backend is gone.
    Transfer(LftpError),
    Persist(PersistError),
    /// The model rejected a change the builder produced.
    Model(ModelError),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Worker(e) => write!(f, "{e}"),
            ControllerError::Transfer(e) => write!(f, "{e}"),
            ControllerError::Persist(e) => write!(f, "{e}"),
            ControllerError::Model(e) => write!(f, "Model error: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<WorkerError> for ControllerError {
    fn from(e: WorkerError) -> Self {
        ControllerError::Worker(e)
    }
}

impl From<PersistError> for ControllerError {
    fn from(e: PersistError) -> Self {
        ControllerError::Persist(e)
    }
}

impl From<ModelError> for ControllerError {
    fn from(e: ModelError) -> Self {
        ControllerError::Model(e)
    }
}

/// A periodic snapshot producer.
#[async_trait]
pub trait ScanSource: Send {
    fn pop_latest(&mut self) -> Option<ScanResult>;
    /// Ask for a scan now instead of at the next interval.
    async fn request_scan(&mut self) -> Result<(), WorkerError>;
    fn propagate_exception(&mut self) -> Result<(), WorkerError>;
    async fn terminate(&mut self);
}

/// Where extraction requests go and events come back from.
#[async_trait]
pub trait Extractor: Send {
    async fn dispatch(&mut self, request: ExtractRequest) -> Result<(), WorkerError>;
    fn drain_events(&mut self) -> Vec<ExtractEvent>;
    fn propagate_exception(&mut self) -> Result<(), WorkerError>;
    async fn terminate(&mut self);
}

#[async_trait]
impl ScanSource for WorkerProcess<(), ScanResult> {
    fn pop_latest(&mut self) -> Option<ScanResult> {
        WorkerProcess::pop_latest(self)
    }

    async fn request_scan(&mut self) -> Result<(), WorkerError> {
        self.send(&()).await
    }

    fn propagate_exception(&mut self) -> Result<(), WorkerError> {
        WorkerProcess::propagate_exception(self)
    }

    async fn terminate(&mut self) {
        if let Err(e) = WorkerProcess::terminate(self).await {
            warn!(worker = %self.name(), "Worker shutdown error: {e}");
        }
    }
}

#[async_trait]
impl Extractor for WorkerProcess<ExtractRequest, ExtractEvent> {
    async fn dispatch(&mut self, request: ExtractRequest) -> Result<(), WorkerError> {
        self.send(&request).await
    }

    fn drain_events(&mut self) -> Vec<ExtractEvent> {
        self.drain()
    }

    fn propagate_exception(&mut self) -> Result<(), WorkerError> {
        WorkerProcess::propagate_exception(self)
    }

    async fn terminate(&mut self) {
        if let Err(e) = WorkerProcess::terminate(self).await {
            warn!(worker = %self.name(), "Worker shutdown error: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Queue,
    Stop,
    Extract,
    DeleteLocal,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Stop => "stop",
            Self::Extract => "extract",
            Self::DeleteLocal => "delete_local",
        }
    }
}

/// Told exactly once how a command went.
pub trait CommandCallback: Send {
    fn on_success(self: Box<Self>);
    fn on_failure(self: Box<Self>, reason: &str);
}

impl CommandCallback for oneshot::Sender<Result<(), String>> {
    fn on_success(self: Box<Self>) {
        let _ = self.send(Ok(()));
    }

    fn on_failure(self: Box<Self>, reason: &str) {
        let _ = self.send(Err(reason.to_string()));
    }
}

pub struct Command {
    pub action: Action,
    pub filename: String,
    callbacks: Vec<Box<dyn CommandCallback>>,
}

impl Command {
    pub fn new(action: Action, filename: impl Into<String>) -> Self {
        Self {
            action,
            filename: filename.into(),
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Box<dyn CommandCallback>) {
        self.callbacks.push(callback);
    }

    /// A command whose outcome arrives on the returned receiver.
    pub fn with_reply(
        action: Action,
        filename: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        let mut cmd = Self::new(action, filename);
        cmd.add_callback(Box::new(tx));
        (cmd, rx)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("action", &self.action)
            .field("filename", &self.filename)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Cloneable access to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ModelEvent>,
    patterns: PatternStore,
}

impl ControllerHandle {
    pub async fn submit(&self, command: Command) -> Result<(), String> {
        self.commands
            .send(command)
            .await
            .map_err(|_| "Controller is not running".to_string())
    }

    /// Send a command and wait for its outcome.
    pub async fn execute(&self, action: Action, filename: &str) -> Result<(), String> {
        let (cmd, rx) = Command::with_reply(action, filename);
        self.submit(cmd).await?;
        rx.await
            .map_err(|_| "Controller stopped before answering".to_string())?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }
}

/// Timing and policy knobs.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub local_path: PathBuf,
    pub extract_dir: PathBuf,
    pub tick: Duration,
    pub downloading_scan_interval: Duration,
    pub autoqueue_enabled: bool,
    pub patterns_only: bool,
    pub auto_extract: bool,
    /// Where [`ControllerPersist`] is saved. `None` keeps it in memory.
    pub persist_path: Option<PathBuf>,
}

/// The collaborators a controller drives.
pub struct ControllerParts {
    pub remote_scan: Box<dyn ScanSource>,
    pub local_scan: Box<dyn ScanSource>,
    pub extractor: Box<dyn Extractor>,
    pub transfer: Box<dyn TransferClient>,
}

pub struct Controller {
    settings: ControllerSettings,
    model: Model,
    builder: ModelBuilder,
    persist: ControllerPersist,
    parts: ControllerParts,
    patterns: PatternStore,
    pattern_generation: Option<u64>,
    commands: mpsc::Receiver<Command>,
    last_status_poll: Option<Instant>,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        parts: ControllerParts,
        persist: ControllerPersist,
        patterns: PatternStore,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut model = Model::new();
        model.add_listener(Box::new(BroadcastListener::new(events.clone())));

        let controller = Self {
            settings,
            model,
            builder: ModelBuilder::new(),
            persist,
            parts,
            patterns: patterns.clone(),
            pattern_generation: None,
            commands,
            last_status_poll: None,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            events,
            patterns,
        };
        (controller, handle)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn persist(&self) -> &ControllerPersist {
        &self.persist
    }

    /// Tick until `shutdown` flips (or its sender goes away), then clean up.
    ///
    /// Returns the fatal error that stopped the loop, if any. Cleanup runs
    /// either way.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;
        info!("Controller started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.process().await {
                        break Err(e);
                    }
                }
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            break Err(e);
                        }
                    }
                    None => commands_open = false,
                },
                _ = shutdown.changed() => break Ok(()),
            }
        };

        if let Err(e) = &result {
            error!("Controller stopping on fatal error: {e}");
        }
        self.exit().await;
        result
    }

    /// One tick.
    pub async fn process(&mut self) -> Result<(), ControllerError> {
        self.parts.remote_scan.propagate_exception()?;
        self.parts.local_scan.propagate_exception()?;
        self.parts.extractor.propagate_exception()?;

        if let Some(result) = self.parts.remote_scan.pop_latest() {
            if result.failed {
                warn!(
                    "Remote scan failed, keeping previous snapshot: {}",
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
            } else {
                debug!(count = result.files.len(), "Remote scan received");
                self.builder.set_remote_files(result.files);
            }
        }
        if let Some(result) = self.parts.local_scan.pop_latest() {
            if result.failed {
                warn!(
                    "Local scan failed, keeping previous snapshot: {}",
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
            } else {
                debug!(count = result.files.len(), "Local scan received");
                self.builder.set_local_files(result.files, result.timestamp);
            }
        }

        let poll_due = self
            .last_status_poll
            .map_or(true, |t| t.elapsed() >= self.settings.downloading_scan_interval);
        if poll_due {
            self.last_status_poll = Some(Instant::now());
            match self.parts.transfer.status().await {
                Ok(statuses) => {
                    let ended = self.builder.set_lftp_statuses(statuses, now_millis());
                    if !ended.is_empty() {
                        debug!(names = ?ended, "Transfers ended, requesting local scan");
                        self.parts.local_scan.request_scan().await?;
                    }
                }
                Err(LftpError::Timeout(cmd)) => warn!("lftp status timed out: {cmd}"),
                Err(e) => return Err(ControllerError::Transfer(e)),
            }
        }

        for event in self.parts.extractor.drain_events() {
            self.handle_extract_event(event).await?;
        }

        self.reconcile_pending();
        self.update_model().await
    }

    /// Stop workers and lftp, then save state.
    pub async fn exit(&mut self) {
        info!("Controller shutting down");
        self.parts.remote_scan.terminate().await;
        self.parts.local_scan.terminate().await;
        self.parts.extractor.terminate().await;
        self.parts.transfer.exit().await;
        if let Err(e) = self.save_persist().await {
            error!("Failed to save controller state: {e}");
        }
    }

    async fn save_persist(&mut self) -> Result<(), PersistError> {
        match &self.settings.persist_path {
            Some(path) => self.persist.save(path).await,
            None => Ok(()),
        }
    }

    async fn handle_extract_event(&mut self, event: ExtractEvent) -> Result<(), ControllerError> {
        match event {
            ExtractEvent::Completed { name } => {
                info!(name = %name, "Extraction completed");
                self.builder.extracting.remove(&name);
                if self.persist.extracted.insert(name) {
                    self.save_persist().await?;
                }
            }
            ExtractEvent::Failed { name, message } => {
                warn!(name = %name, "Extraction failed: {message}");
                self.builder.extracting.remove(&name);
            }
        }
        Ok(())
    }

    /// Pending queue entries give way once lftp reports the job or the
    /// download is already complete.
    fn reconcile_pending(&mut self) {
        let builder = &self.builder;
        let settled: Vec<String> = builder
            .queued
            .iter()
            .filter(|name| builder.has_job(name) || builder.is_locally_complete(name))
            .cloned()
            .collect();
        for name in settled {
            self.builder.queued.remove(&name);
        }
        let builder = &self.builder;
        let forgotten: Vec<String> = builder
            .stopped
            .iter()
            .filter(|name| !builder.is_known(name))
            .cloned()
            .collect();
        for name in forgotten {
            self.builder.stopped.remove(&name);
        }
    }

    /// Rebuild, diff, apply, react. Repeats while reactions change the inputs.
    async fn update_model(&mut self) -> Result<(), ControllerError> {
        for _ in 0..MAX_REBUILDS {
            let next = self.builder.build(&self.persist)?;
            let diffs = diff(&self.model, &next);
            for d in &diffs {
                self.apply_diff(d)?;
            }
            if !self.react(&diffs).await? {
                break;
            }
        }
        Ok(())
    }

    fn apply_diff(&mut self, d: &ModelDiff) -> Result<(), ModelError> {
        match (d.change, &d.old_file, &d.new_file) {
            (ChangeKind::Added, _, Some(new)) => self.model.add(new.clone()),
            (ChangeKind::Updated, _, Some(new)) => self.model.update(new.clone()),
            (ChangeKind::Removed, Some(old), _) => self.model.remove(old.name()),
            _ => Ok(()),
        }
    }

    /// Returns whether anything changed that needs another rebuild.
    async fn react(&mut self, diffs: &[ModelDiff]) -> Result<bool, ControllerError> {
        let mut changed = false;
        let mut persist_dirty = false;

        for d in diffs {
            let Some(new) = &d.new_file else { continue };
            if new.state() != FileState::Downloaded {
                continue;
            }
            persist_dirty |= self.persist.downloaded.insert(new.name().to_string());

            // Only a transfer observed finishing counts, not a copy found complete.
            let transferred = d.change == ChangeKind::Updated
                && d.old_file.as_ref().is_some_and(|old| {
                    matches!(old.state(), FileState::Queued | FileState::Downloading)
                });
            if !transferred {
                continue;
            }
            info!(name = %new.name(), "Download complete");
            if self.settings.auto_extract
                && new.is_extractable()
                && !self.persist.extracted.contains(new.name())
            {
                match self.start_extract(new.name(), new.is_dir()).await {
                    Ok(()) => changed = true,
                    Err(e) => warn!(name = %new.name(), "Auto-extract failed to start: {e}"),
                }
            }
        }
        if persist_dirty {
            self.save_persist().await?;
        }

        if self.settings.autoqueue_enabled {
            let (generation, patterns) = self.patterns.snapshot().await;
            let candidates: Vec<String> = if self.pattern_generation == Some(generation) {
                diffs
                    .iter()
                    .filter(|d| match (d.change, &d.old_file) {
                        (ChangeKind::Added, _) => true,
                        (ChangeKind::Updated, Some(old)) => old.remote_size().is_none(),
                        _ => false,
                    })
                    .map(|d| d.name().to_string())
                    .collect()
            } else {
                self.pattern_generation = Some(generation);
                self.model.get_all_names()
            };

            for name in candidates {
                let Ok(file) = self.model.get(&name) else { continue };
                if file.state() != FileState::Default
                    || file.remote_size().is_none()
                    || self.persist.downloaded.contains(&name)
                {
                    continue;
                }
                if self.settings.patterns_only && !patterns.matches(&name) {
                    continue;
                }
                match self.parts.transfer.queue(&name, file.is_dir()).await {
                    Ok(()) => {
                        info!(name = %name, "Auto-queued");
                        self.forget_extracted(&name).await?;
                        self.builder.queued.insert(name);
                        changed = true;
                    }
                    Err(e) => warn!(name = %name, "Auto-queue failed: {e}"),
                }
            }
        }
        Ok(changed)
    }

    async fn start_extract(&mut self, name: &str, is_dir: bool) -> Result<(), WorkerError> {
        let request = ExtractRequest {
            name: name.to_string(),
            is_dir,
            local_path: self.settings.local_path.join(name).display().to_string(),
            out_dir: self.settings.extract_dir.display().to_string(),
        };
        self.parts.extractor.dispatch(request).await?;
        self.builder.extracting.insert(name.to_string());
        info!(name, "Extraction started");
        Ok(())
    }

    /// Drop the extracted mark of a file that is being downloaded again.
    async fn forget_extracted(&mut self, name: &str) -> Result<(), PersistError> {
        if self.persist.extracted.remove(name) {
            self.save_persist().await?;
        }
        Ok(())
    }

    /// Apply one command, update the model, then run its callbacks.
    pub async fn handle_command(&mut self, command: Command) -> Result<(), ControllerError> {
        let Command {
            action,
            filename,
            callbacks,
        } = command;
        debug!(action = action.as_str(), name = %filename, "Command received");

        let outcome = match action {
            Action::Queue => self.cmd_queue(&filename).await,
            Action::Stop => self.cmd_stop(&filename).await,
            Action::Extract => self.cmd_extract(&filename).await,
            Action::DeleteLocal => self.cmd_delete_local(&filename).await,
        };
        if outcome.is_ok() {
            self.update_model().await?;
        }

        match outcome {
            Ok(()) => {
                info!(action = action.as_str(), name = %filename, "Command succeeded");
                for cb in callbacks {
                    cb.on_success();
                }
            }
            Err(reason) => {
                warn!(action = action.as_str(), name = %filename, "Command failed: {reason}");
                for cb in callbacks {
                    cb.on_failure(&reason);
                }
            }
        }
        Ok(())
    }

    async fn cmd_queue(&mut self, name: &str) -> Result<(), String> {
        let file = self
            .model
            .get(name)
            .map_err(|_| format!("File '{name}' not found"))?;
        if file.remote_size().is_none() {
            return Err(format!("File '{name}' does not exist remotely"));
        }
        match file.state() {
            FileState::Queued | FileState::Downloading => {
                return Err(format!("File '{name}' is already queued"));
            }
            FileState::Downloaded | FileState::Extracting | FileState::Extracted => {
                return Err(format!("File '{name}' is already downloaded"));
            }
            FileState::Default | FileState::Deleted => {}
        }
        self.parts
            .transfer
            .queue(name, file.is_dir())
            .await
            .map_err(|e| format!("Failed to queue '{name}': {e}"))?;
        self.forget_extracted(name)
            .await
            .map_err(|e| format!("Queued '{name}' but failed to save state: {e}"))?;
        self.builder.stopped.remove(name);
        self.builder.queued.insert(name.to_string());
        Ok(())
    }

    async fn cmd_stop(&mut self, name: &str) -> Result<(), String> {
        let file = self
            .model
            .get(name)
            .map_err(|_| format!("File '{name}' not found"))?;
        if !matches!(file.state(), FileState::Queued | FileState::Downloading) {
            return Err(format!("File '{name}' is not queued or downloading"));
        }
        let killed = self
            .parts
            .transfer
            .kill(name)
            .await
            .map_err(|e| format!("Failed to stop '{name}': {e}"))?;
        if !killed {
            debug!(name, "No lftp job to stop");
        }
        self.builder.queued.remove(name);
        self.builder.drop_queued_job(name);
        self.builder.stopped.insert(name.to_string());
        Ok(())
    }

    async fn cmd_extract(&mut self, name: &str) -> Result<(), String> {
        let file = self
            .model
            .get(name)
            .map_err(|_| format!("File '{name}' not found"))?;
        if !matches!(file.state(), FileState::Downloaded | FileState::Extracted) {
            return Err(format!("File '{name}' is not downloaded"));
        }
        if !file.is_extractable() {
            return Err(format!("File '{name}' is not extractable"));
        }
        if file.local_size().is_none() {
            return Err(format!("File '{name}' does not exist locally"));
        }
        self.start_extract(name, file.is_dir())
            .await
            .map_err(|e| format!("Failed to start extraction of '{name}': {e}"))
    }

    async fn cmd_delete_local(&mut self, name: &str) -> Result<(), String> {
        let file = self
            .model
            .get(name)
            .map_err(|_| format!("File '{name}' not found"))?;
        if file.local_size().is_none() {
            return Err(format!("File '{name}' does not exist locally"));
        }
        if matches!(
            file.state(),
            FileState::Queued | FileState::Downloading | FileState::Extracting
        ) {
            return Err(format!("File '{name}' is busy ({})", file.state().as_str()));
        }
        let path = self.settings.local_path.join(name);
        let removed = if file.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| format!("Failed to delete '{}': {e}", path.display()))?;
        info!(name, "Deleted local copy");

        self.builder.remove_local(name);
        self.builder.stopped.insert(name.to_string());
        if self.persist.extracted.remove(name) {
            self.save_persist()
                .await
                .map_err(|e| format!("Deleted '{name}' but failed to save state: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lftp::{JobState, JobType, LftpJobStatus};
    use crate::scan::SystemFile;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeScan {
        results: Arc<Mutex<VecDeque<ScanResult>>>,
        fatal: Arc<Mutex<Option<WorkerError>>>,
        terminated: Arc<Mutex<bool>>,
        rescans: Arc<Mutex<usize>>,
    }

    impl FakeScan {
        fn push(&self, files: Vec<SystemFile>) {
            self.results.lock().unwrap().push_back(ScanResult::ok(files));
        }
    }

    #[async_trait]
    impl ScanSource for FakeScan {
        fn pop_latest(&mut self) -> Option<ScanResult> {
            let mut results = self.results.lock().unwrap();
            let latest = results.pop_back();
            results.clear();
            latest
        }

        async fn request_scan(&mut self) -> Result<(), WorkerError> {
            *self.rescans.lock().unwrap() += 1;
            Ok(())
        }

        fn propagate_exception(&mut self) -> Result<(), WorkerError> {
            match self.fatal.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn terminate(&mut self) {
            *self.terminated.lock().unwrap() = true;
        }
    }

    #[derive(Clone, Default)]
    struct FakeTransfer {
        queued: Arc<Mutex<Vec<String>>>,
        killed: Arc<Mutex<Vec<String>>>,
        statuses: Arc<Mutex<Vec<LftpJobStatus>>>,
        exited: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl TransferClient for FakeTransfer {
        async fn queue(&mut self, name: &str, _is_dir: bool) -> Result<(), LftpError> {
            self.queued.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn kill(&mut self, name: &str) -> Result<bool, LftpError> {
            self.killed.lock().unwrap().push(name.to_string());
            let mut statuses = self.statuses.lock().unwrap();
            let before = statuses.len();
            statuses.retain(|s| s.name() != name || s.state() == JobState::Running);
            Ok(statuses.len() != before)
        }

        async fn status(&mut self) -> Result<Vec<LftpJobStatus>, LftpError> {
            Ok(self.statuses.lock().unwrap().clone())
        }

        async fn exit(&mut self) {
            *self.exited.lock().unwrap() = true;
        }
    }

    #[derive(Clone, Default)]
    struct FakeExtractor {
        requests: Arc<Mutex<Vec<ExtractRequest>>>,
        events: Arc<Mutex<Vec<ExtractEvent>>>,
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn dispatch(&mut self, request: ExtractRequest) -> Result<(), WorkerError> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }

        fn drain_events(&mut self) -> Vec<ExtractEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn propagate_exception(&mut self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn terminate(&mut self) {}
    }

    struct Harness {
        controller: Controller,
        handle: ControllerHandle,
        remote: FakeScan,
        local: FakeScan,
        transfer: FakeTransfer,
        extractor: FakeExtractor,
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            local_path: PathBuf::from("/local"),
            extract_dir: PathBuf::from("/extract"),
            tick: Duration::from_millis(10),
            downloading_scan_interval: Duration::ZERO,
            autoqueue_enabled: false,
            patterns_only: false,
            auto_extract: false,
            persist_path: None,
        }
    }

    fn harness_with(settings: ControllerSettings, persist: ControllerPersist) -> Harness {
        let remote = FakeScan::default();
        let local = FakeScan::default();
        let transfer = FakeTransfer::default();
        let extractor = FakeExtractor::default();
        let parts = ControllerParts {
            remote_scan: Box::new(remote.clone()),
            local_scan: Box::new(local.clone()),
            extractor: Box::new(extractor.clone()),
            transfer: Box::new(transfer.clone()),
        };
        let patterns = PatternStore::new(AutoQueuePatterns::default(), None);
        let (controller, handle) = Controller::new(settings, parts, persist, patterns);
        Harness {
            controller,
            handle,
            remote,
            local,
            transfer,
            extractor,
        }
    }

    fn harness() -> Harness {
        harness_with(settings(), ControllerPersist::default())
    }

    impl Harness {
        fn state(&self, name: &str) -> FileState {
            self.controller.model().get(name).unwrap().state()
        }

        async fn command(&mut self, action: Action, name: &str) -> Result<(), String> {
            let (cmd, rx) = Command::with_reply(action, name);
            self.controller.handle_command(cmd).await.unwrap();
            rx.await.unwrap()
        }

        fn set_jobs(&self, jobs: Vec<LftpJobStatus>) {
            *self.transfer.statuses.lock().unwrap() = jobs;
        }
    }

    fn running(name: &str) -> LftpJobStatus {
        LftpJobStatus::new(1, JobType::Pget, JobState::Running, name, "-c")
    }

    #[tokio::test]
    async fn remote_file_appears_then_queue_command() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("show.mkv", 1000)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("show.mkv"), FileState::Default);

        assert_eq!(h.command(Action::Queue, "show.mkv").await, Ok(()));
        assert_eq!(h.state("show.mkv"), FileState::Queued);
        assert_eq!(*h.transfer.queued.lock().unwrap(), vec!["show.mkv"]);
    }

    #[tokio::test]
    async fn listeners_see_change_before_callback() {
        let mut h = harness();
        let mut events = h.handle.subscribe();
        h.remote.push(vec![SystemFile::file("a", 1)]);
        h.controller.process().await.unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ModelEvent::FileAdded { .. }
        ));

        h.command(Action::Queue, "a").await.unwrap();
        match events.try_recv().unwrap() {
            ModelEvent::FileUpdated { old_file, new_file } => {
                assert_eq!(old_file.state(), FileState::Default);
                assert_eq!(new_file.state(), FileState::Queued);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_rejections() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("done", 10), SystemFile::file("new", 10)]);
        h.local.push(vec![SystemFile::file("done", 10), SystemFile::file("local-only", 3)]);
        h.controller.process().await.unwrap();

        let err = h.command(Action::Queue, "missing").await.unwrap_err();
        assert!(err.contains("not found"));
        let err = h.command(Action::Queue, "local-only").await.unwrap_err();
        assert!(err.contains("does not exist remotely"));
        let err = h.command(Action::Queue, "done").await.unwrap_err();
        assert!(err.contains("already downloaded"));

        h.command(Action::Queue, "new").await.unwrap();
        let err = h.command(Action::Queue, "new").await.unwrap_err();
        assert!(err.contains("already queued"));
        assert_eq!(*h.transfer.queued.lock().unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn manual_queue_ignores_download_history() {
        let mut persist = ControllerPersist::default();
        persist.downloaded.insert("again.mkv".into());
        let mut h = harness_with(settings(), persist);
        h.remote.push(vec![SystemFile::file("again.mkv", 10)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("again.mkv"), FileState::Deleted);

        assert_eq!(h.command(Action::Queue, "again.mkv").await, Ok(()));
        assert_eq!(h.state("again.mkv"), FileState::Queued);
    }

    #[tokio::test]
    async fn autoqueue_queues_once_per_name() {
        let mut s = settings();
        s.autoqueue_enabled = true;
        s.patterns_only = true;
        let mut h = harness_with(s, ControllerPersist::default());
        h.handle.patterns().add("show").await.unwrap();

        let snapshot = vec![SystemFile::file("show.s01e01.mkv", 5), SystemFile::file("other", 5)];
        h.remote.push(snapshot.clone());
        h.controller.process().await.unwrap();
        h.remote.push(snapshot.clone());
        h.controller.process().await.unwrap();
        h.remote.push(snapshot);
        h.controller.process().await.unwrap();

        assert_eq!(*h.transfer.queued.lock().unwrap(), vec!["show.s01e01.mkv"]);
        assert_eq!(h.state("show.s01e01.mkv"), FileState::Queued);
        assert_eq!(h.state("other"), FileState::Default);
    }

    #[tokio::test]
    async fn autoqueue_skips_previously_downloaded() {
        let mut s = settings();
        s.autoqueue_enabled = true;
        let mut persist = ControllerPersist::default();
        persist.downloaded.insert("old".into());
        let mut h = harness_with(s, persist);
        h.remote.push(vec![SystemFile::file("old", 5), SystemFile::file("fresh", 5)]);
        h.controller.process().await.unwrap();
        assert_eq!(*h.transfer.queued.lock().unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn new_pattern_requeues_waiting_files() {
        let mut s = settings();
        s.autoqueue_enabled = true;
        s.patterns_only = true;
        let mut h = harness_with(s, ControllerPersist::default());
        h.remote.push(vec![SystemFile::file("movie.mkv", 5)]);
        h.controller.process().await.unwrap();
        assert!(h.transfer.queued.lock().unwrap().is_empty());

        h.handle.patterns().add("movie*").await.unwrap();
        h.controller.process().await.unwrap();
        assert_eq!(*h.transfer.queued.lock().unwrap(), vec!["movie.mkv"]);
    }

    #[tokio::test]
    async fn download_lifecycle_with_auto_extract() {
        let mut s = settings();
        s.auto_extract = true;
        let mut h = harness_with(s, ControllerPersist::default());
        h.remote.push(vec![SystemFile::file("pack.rar", 100)]);
        h.controller.process().await.unwrap();
        h.command(Action::Queue, "pack.rar").await.unwrap();

        h.set_jobs(vec![running("pack.rar")]);
        h.local.push(vec![SystemFile::file("pack.rar", 40)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("pack.rar"), FileState::Downloading);

        h.set_jobs(vec![]);
        h.local.push(vec![SystemFile::file("pack.rar", 100)]);
        h.controller.process().await.unwrap();
        assert!(h.controller.persist().downloaded.contains("pack.rar"));
        assert_eq!(h.state("pack.rar"), FileState::Extracting);
        let requests = h.extractor.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].local_path, "/local/pack.rar");
        assert_eq!(requests[0].out_dir, "/extract");

        h.extractor
            .events
            .lock()
            .unwrap()
            .push(ExtractEvent::Completed {
                name: "pack.rar".into(),
            });
        h.controller.process().await.unwrap();
        assert_eq!(h.state("pack.rar"), FileState::Extracted);
        assert!(h.controller.persist().extracted.contains("pack.rar"));
    }

    #[tokio::test]
    async fn finished_job_stays_downloading_until_local_rescan() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("big.mkv", 100)]);
        h.controller.process().await.unwrap();
        h.command(Action::Queue, "big.mkv").await.unwrap();
        h.set_jobs(vec![running("big.mkv")]);
        h.local.push(vec![SystemFile::file("big.mkv", 40)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("big.mkv"), FileState::Downloading);

        let mut events = h.handle.subscribe();
        h.set_jobs(vec![]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("big.mkv"), FileState::Downloading);
        assert_eq!(*h.local.rescans.lock().unwrap(), 1);

        // Scanned before the job ended.
        h.local
            .results
            .lock()
            .unwrap()
            .push_back(ScanResult::ok(vec![SystemFile::file("big.mkv", 40)]).started_at(0));
        h.controller.process().await.unwrap();
        assert_eq!(h.state("big.mkv"), FileState::Downloading);

        h.local.push(vec![SystemFile::file("big.mkv", 100)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("big.mkv"), FileState::Downloaded);
        assert_eq!(*h.local.rescans.lock().unwrap(), 1);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ModelEvent::FileUpdated { new_file, .. } = event {
                states.push(new_file.state());
            }
        }
        assert_eq!(states, vec![FileState::Downloaded]);
    }

    #[tokio::test]
    async fn redownload_of_extracted_archive_extracts_again() {
        let mut s = settings();
        s.auto_extract = true;
        let mut persist = ControllerPersist::default();
        persist.downloaded.insert("pack.rar".into());
        persist.extracted.insert("pack.rar".into());
        let mut h = harness_with(s, persist);
        h.remote.push(vec![SystemFile::file("pack.rar", 100)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("pack.rar"), FileState::Deleted);

        h.command(Action::Queue, "pack.rar").await.unwrap();
        assert!(!h.controller.persist().extracted.contains("pack.rar"));
        h.set_jobs(vec![running("pack.rar")]);
        h.local.push(vec![SystemFile::file("pack.rar", 10)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("pack.rar"), FileState::Downloading);

        h.set_jobs(vec![]);
        h.local.push(vec![SystemFile::file("pack.rar", 100)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("pack.rar"), FileState::Extracting);
        assert_eq!(h.extractor.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_archive_found_at_startup_is_not_extracted() {
        let mut s = settings();
        s.auto_extract = true;
        let mut h = harness_with(s, ControllerPersist::default());
        h.remote.push(vec![SystemFile::file("pack.rar", 100)]);
        h.local.push(vec![
            SystemFile::file("pack.rar", 100),
            SystemFile::file("old.zip", 7),
        ]);
        h.controller.process().await.unwrap();
        h.controller.process().await.unwrap();

        assert_eq!(h.state("pack.rar"), FileState::Downloaded);
        assert!(h.controller.persist().downloaded.contains("pack.rar"));
        assert!(h.extractor.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_extraction_falls_back_to_downloaded() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("a.zip", 10), SystemFile::file("b.mkv", 10)]);
        h.local.push(vec![SystemFile::file("a.zip", 10), SystemFile::file("b.mkv", 10)]);
        h.controller.process().await.unwrap();
        assert!(h.extractor.requests.lock().unwrap().is_empty());

        let err = h.command(Action::Extract, "b.mkv").await.unwrap_err();
        assert!(err.contains("not extractable"));

        h.command(Action::Extract, "a.zip").await.unwrap();
        assert_eq!(h.state("a.zip"), FileState::Extracting);

        h.extractor.events.lock().unwrap().push(ExtractEvent::Failed {
            name: "a.zip".into(),
            message: "corrupt".into(),
        });
        h.controller.process().await.unwrap();
        assert_eq!(h.state("a.zip"), FileState::Downloaded);
    }

    #[tokio::test]
    async fn stop_queued_job_deletes_immediately() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("a", 10)]);
        h.controller.process().await.unwrap();
        h.command(Action::Queue, "a").await.unwrap();
        h.set_jobs(vec![LftpJobStatus::new(-1, JobType::Pget, JobState::Queued, "a", "-c")]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("a"), FileState::Queued);

        h.command(Action::Stop, "a").await.unwrap();
        assert_eq!(h.state("a"), FileState::Deleted);
        assert_eq!(*h.transfer.killed.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn stop_running_job_waits_for_confirmation() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("a", 10)]);
        h.set_jobs(vec![running("a")]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("a"), FileState::Downloading);

        h.command(Action::Stop, "a").await.unwrap();
        assert_eq!(h.state("a"), FileState::Downloading);
        assert_eq!(*h.transfer.killed.lock().unwrap(), vec!["a"]);

        h.set_jobs(vec![]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("a"), FileState::Deleted);
        assert_eq!(*h.local.rescans.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_rejections() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("a", 10)]);
        h.controller.process().await.unwrap();
        assert!(h.command(Action::Stop, "missing").await.unwrap_err().contains("not found"));
        assert!(h
            .command(Action::Stop, "a")
            .await
            .unwrap_err()
            .contains("not queued"));
        assert!(h.transfer.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_removal_keeps_local_copies() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("kept", 10), SystemFile::file("gone", 10)]);
        h.local.push(vec![SystemFile::file("kept", 10)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("kept"), FileState::Downloaded);

        h.remote.push(vec![]);
        h.controller.process().await.unwrap();
        assert_eq!(h.controller.model().get_all_names(), vec!["kept"]);
        assert_eq!(h.state("kept"), FileState::Downloaded);
    }

    #[tokio::test]
    async fn failed_scan_keeps_previous_snapshot() {
        let mut h = harness();
        h.remote.push(vec![SystemFile::file("a", 10)]);
        h.controller.process().await.unwrap();
        h.remote
            .results
            .lock()
            .unwrap()
            .push_back(ScanResult::failure("ssh: timeout"));
        h.controller.process().await.unwrap();
        assert_eq!(h.controller.model().get_all_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn worker_failure_is_fatal() {
        let mut h = harness();
        *h.local.fatal.lock().unwrap() = Some(WorkerError::Fatal {
            worker: "local-scan".into(),
            code: "scan_panicked".into(),
            message: "boom".into(),
        });
        let err = h.controller.process().await.unwrap_err();
        assert!(matches!(err, ControllerError::Worker(_)));
        assert!(h.controller.process().await.is_ok());
    }

    #[tokio::test]
    async fn delete_local_removes_copy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.mkv"), "0123456789").unwrap();
        let mut s = settings();
        s.local_path = tmp.path().to_path_buf();
        let mut h = harness_with(s, ControllerPersist::default());
        h.remote.push(vec![SystemFile::file("a.mkv", 10)]);
        h.local.push(vec![SystemFile::file("a.mkv", 10)]);
        h.controller.process().await.unwrap();
        assert_eq!(h.state("a.mkv"), FileState::Downloaded);

        h.command(Action::DeleteLocal, "a.mkv").await.unwrap();
        assert!(!tmp.path().join("a.mkv").exists());
        assert_eq!(h.state("a.mkv"), FileState::Deleted);
        assert!(h
            .command(Action::DeleteLocal, "a.mkv")
            .await
            .unwrap_err()
            .contains("does not exist locally"));
    }

    #[tokio::test]
    async fn run_loop_serves_commands_and_shuts_down() {
        let h = harness();
        h.remote.push(vec![SystemFile::file("a", 10)]);
        let transfer = h.transfer.clone();
        let remote = h.remote.clone();
        let handle = h.handle.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(h.controller.run(shutdown_rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match handle.execute(Action::Queue, "a").await {
                Ok(()) => break,
                Err(e) if e.contains("not found") && Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("queue failed: {e}"),
            }
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(*transfer.exited.lock().unwrap());
        assert!(*remote.terminated.lock().unwrap());
        assert!(handle.execute(Action::Stop, "a").await.is_err());
    }
}
