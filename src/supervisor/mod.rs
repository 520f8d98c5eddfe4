//! Out-of-process worker supervision.
//!
//! Scanning and extraction each run in a child process spawned from this same
//! binary (`seedsync worker <kind>`), so a hang or crash there cannot take the
//! controller down with it.
//!
//! ```text
//! Controller
//!     │  WorkerProcess::send()      ──► child stdin   (JSON lines, requests)
//!     │  pop_latest() / drain()     ◄── child stdout  (JSON lines, WorkerFrame)
//!     │  propagate_exception()      ◄── fatal frame or unrequested exit
//!     │  terminate()                ──► close stdin, grace period, SIGKILL group
//!     ▼
//! seedsync worker <kind>  (worker::run_worker)
//! ```
//!
//! The child is a process-group leader with default signal dispositions, so a
//! forced kill reaches anything it spawned (ssh, tar, 7z).

pub mod worker;

use std::ffi::OsStr;
use std::marker::PhantomData;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One line on a worker's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerFrame<T> {
    /// A normal result, including recoverable failures carried in `T`.
    Result { data: T },
    /// The worker loop raised an error and is going down.
    Fatal { code: String, message: String },
}

/// Errors on either side of the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker process could not be started.
    SpawnFailed(String),
    /// Pipe I/O with the worker failed.
    Io(String),
    /// Raised by a worker's own loop. Sent to the supervisor as a fatal frame.
    Task { code: String, message: String },
    /// A fatal frame received from a worker.
    Fatal {
        worker: String,
        code: String,
        message: String,
    },
    /// The worker exited without being asked to and without a fatal frame.
    Exited { worker: String, status: String },
    /// Stops the worker loop cleanly. Never reported to the supervisor.
    ServiceExit,
}

impl WorkerError {
    pub fn task(code: &str, message: impl Into<String>) -> Self {
        WorkerError::Task {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable code, carried in fatal frames.
    pub fn code(&self) -> String {
        match self {
            WorkerError::SpawnFailed(_) => "spawn_failed".to_string(),
            WorkerError::Io(_) => "io".to_string(),
            WorkerError::Task { code, .. } | WorkerError::Fatal { code, .. } => code.clone(),
            WorkerError::Exited { .. } => "exited".to_string(),
            WorkerError::ServiceExit => "service_exit".to_string(),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::SpawnFailed(e) => write!(f, "Failed to spawn worker: {e}"),
            WorkerError::Io(e) => write!(f, "Worker I/O error: {e}"),
            WorkerError::Task { code, message } => write!(f, "{message} ({code})"),
            WorkerError::Fatal {
                worker,
                code,
                message,
            } => write!(f, "Worker {worker} failed: {message} ({code})"),
            WorkerError::Exited { worker, status } => {
                write!(f, "Worker {worker} exited unexpectedly: {status}")
            }
            WorkerError::ServiceExit => write!(f, "Service exit"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Supervisor-side handle to one worker child process.
///
/// `Req` is written to the child, `Out` is read back. Dropping the handle
/// kills the child.
pub struct WorkerProcess<Req, Out> {
    name: String,
    child: Child,
    pgid: Option<i32>,
    stdin: Option<ChildStdin>,
    results: mpsc::UnboundedReceiver<Out>,
    fatal: mpsc::UnboundedReceiver<WorkerError>,
    reader: JoinHandle<()>,
    grace: Duration,
    terminating: bool,
    exit_reported: bool,
    _requests: PhantomData<fn(Req)>,
}

impl<Req, Out> WorkerProcess<Req, Out>
where
    Req: Serialize,
    Out: DeserializeOwned + Send + 'static,
{
    /// Spawn `program args...` as a worker.
    ///
    /// `grace` bounds how long [`terminate`](Self::terminate) waits for a
    /// voluntary exit before killing the process group.
    pub fn spawn<S: AsRef<OsStr>>(
        name: &str,
        program: impl AsRef<OsStr>,
        args: &[S],
        grace: Duration,
    ) -> Result<Self, WorkerError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // SAFETY: setpgid and signal are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGPIPE] {
                    libc::signal(sig, libc::SIG_DFL);
                }
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(format!("{name}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("Failed to take stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("Failed to take stdout pipe".to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let pgid = child.id().map(|pid| pid as i32);
        info!(worker = %name, pid = ?pgid, "Worker started");

        let (results_tx, results) = mpsc::unbounded_channel();
        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let reader_name = name.to_string();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(worker = %reader_name, "Worker stdout read error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerFrame<Out>>(&line) {
                    Ok(WorkerFrame::Result { data }) => {
                        let _ = results_tx.send(data);
                    }
                    Ok(WorkerFrame::Fatal { code, message }) => {
                        let _ = fatal_tx.send(WorkerError::Fatal {
                            worker: reader_name.clone(),
                            code,
                            message,
                        });
                    }
                    Err(e) => warn!(worker = %reader_name, "Ignoring malformed worker frame: {e}"),
                }
            }
            debug!(worker = %reader_name, "Worker stdout closed");
        });

        Ok(Self {
            name: name.to_string(),
            child,
            pgid,
            stdin: Some(stdin),
            results,
            fatal,
            reader,
            grace,
            terminating: false,
            exit_reported: false,
            _requests: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one request line to the worker.
    pub async fn send(&mut self, request: &Req) -> Result<(), WorkerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerError::Io(format!("{} is terminating", self.name)))?;
        let mut line =
            serde_json::to_string(request).map_err(|e| WorkerError::Io(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WorkerError::Io(e.to_string()))?;
        stdin.flush().await.map_err(|e| WorkerError::Io(e.to_string()))
    }

    /// Newest pending result, discarding older ones.
    pub fn pop_latest(&mut self) -> Option<Out> {
        let mut latest = None;
        while let Ok(item) = self.results.try_recv() {
            latest = Some(item);
        }
        latest
    }

    /// Every pending result, oldest first.
    pub fn drain(&mut self) -> Vec<Out> {
        let mut items = Vec::new();
        while let Ok(item) = self.results.try_recv() {
            items.push(item);
        }
        items
    }

    /// Surface a failure of the worker, at most once per failure.
    ///
    /// Returns the worker's fatal frame if one is queued. Otherwise, once the
    /// worker's output has closed and the process has exited without
    /// [`terminate`](Self::terminate) being called, reports the exit.
    pub fn propagate_exception(&mut self) -> Result<(), WorkerError> {
        if let Ok(err) = self.fatal.try_recv() {
            self.exit_reported = true;
            return Err(err);
        }
        if self.terminating || self.exit_reported || !self.reader.is_finished() {
            return Ok(());
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_reported = true;
                Err(WorkerError::Exited {
                    worker: self.name.clone(),
                    status: status.to_string(),
                })
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.exit_reported = true;
                Err(WorkerError::Io(e.to_string()))
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the worker to stop, then force it after the grace period.
    pub async fn terminate(&mut self) -> Result<ExitStatus, WorkerError> {
        self.terminating = true;
        drop(self.stdin.take());

        let status = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => status.map_err(|e| WorkerError::Io(e.to_string()))?,
            Err(_) => {
                warn!(
                    worker = %self.name,
                    grace_ms = self.grace.as_millis() as u64,
                    "Worker ignored shutdown request, killing"
                );
                self.kill_group();
                let _ = self.child.start_kill();
                self.child
                    .wait()
                    .await
                    .map_err(|e| WorkerError::Io(e.to_string()))?
            }
        };
        self.reader.abort();
        info!(worker = %self.name, "Worker stopped: {status}");
        Ok(status)
    }

    fn kill_group(&self) {
        if let Some(pgid) = self.pgid {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pgid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str, grace: Duration) -> WorkerProcess<u32, u32> {
        WorkerProcess::spawn("test", "/bin/sh", &["-c", script], grace).unwrap()
    }

    async fn wait_for_exception(worker: &mut WorkerProcess<u32, u32>) -> WorkerError {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Err(e) = worker.propagate_exception() {
                return e;
            }
            assert!(Instant::now() < deadline, "no exception propagated");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn frame_wire_format() {
        let frame: WorkerFrame<u32> = WorkerFrame::Result { data: 7 };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"result","data":7}"#
        );
        let fatal: WorkerFrame<u32> =
            serde_json::from_str(r#"{"type":"fatal","code":"x","message":"y"}"#).unwrap();
        assert_eq!(
            fatal,
            WorkerFrame::Fatal {
                code: "x".into(),
                message: "y".into()
            }
        );
    }

    #[tokio::test]
    async fn stuck_worker_is_killed_within_grace() {
        let grace = Duration::from_millis(1000);
        let mut worker = sh("trap '' TERM INT; while true; do :; done", grace);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(worker.is_alive());

        let start = Instant::now();
        let status = worker.terminate().await.unwrap();
        assert!(start.elapsed() < grace.mul_f32(1.5));
        assert!(!status.success());
        assert!(!worker.is_alive());
        assert!(worker.propagate_exception().is_ok());
    }

    #[tokio::test]
    async fn cooperative_worker_exits_on_stdin_eof() {
        let mut worker = sh("cat > /dev/null", Duration::from_secs(5));
        let start = Instant::now();
        let status = worker.terminate().await.unwrap();
        assert!(status.success());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(worker.propagate_exception().is_ok());
    }

    #[tokio::test]
    async fn fatal_frame_is_propagated_once() {
        let mut worker = sh(
            r#"printf '{"type":"fatal","code":"boom","message":"it broke"}\n'; exit 1"#,
            Duration::from_secs(1),
        );
        match wait_for_exception(&mut worker).await {
            WorkerError::Fatal { code, message, .. } => {
                assert_eq!(code, "boom");
                assert_eq!(message, "it broke");
            }
            other => panic!("unexpected error {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(worker.propagate_exception().is_ok());
        assert!(worker.propagate_exception().is_ok());
    }

    #[tokio::test]
    async fn abnormal_exit_is_reported_once() {
        let mut worker = sh("exit 3", Duration::from_secs(1));
        let err = wait_for_exception(&mut worker).await;
        assert!(matches!(err, WorkerError::Exited { .. }));
        assert_eq!(err.code(), "exited");
        assert!(worker.propagate_exception().is_ok());
    }

    #[tokio::test]
    async fn latest_result_wins() {
        let mut worker = sh(
            r#"echo '{"type":"result","data":1}'; echo '{"type":"result","data":2}'; sleep 5"#,
            Duration::from_millis(200),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(worker.pop_latest(), Some(2));
        assert_eq!(worker.pop_latest(), None);
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn requests_reach_the_worker() {
        let mut worker = sh(
            r#"while read line; do printf '{"type":"result","data":%s}\n' "$line"; done"#,
            Duration::from_secs(1),
        );
        worker.send(&5).await.unwrap();
        worker.send(&6).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = Vec::new();
        while got.len() < 2 && Instant::now() < deadline {
            got.extend(worker.drain());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(got, vec![5, 6]);
        assert!(worker.terminate().await.unwrap().success());
    }

    #[tokio::test]
    async fn spawn_failure() {
        let res = WorkerProcess::<u32, u32>::spawn(
            "missing",
            "/nonexistent/seedsync-worker",
            &[] as &[&str],
            Duration::from_secs(1),
        );
        assert!(matches!(res, Err(WorkerError::SpawnFailed(_))));
    }
}
