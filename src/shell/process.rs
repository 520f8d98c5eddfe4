//! One-shot external program execution with output capture.
//!
//! The remote scanner (ssh) and the extractor (tar, 7z) go through
//! [`exec_program`]. The child runs in its own process group with
//! `kill_on_drop(true)`, so a timed-out or cancelled command does not leave
//! helpers behind.

use std::collections::HashMap;
use std::fmt::Write;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Max output size per stream for [`exec_program`] (16 MB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded. A truncation notice is appended to the returned
/// string.
const MAX_EXEC_OUTPUT: usize = 16 * 1024 * 1024;

/// Run `program args...` and capture its output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_EXEC_OUTPUT`] bytes. The entire operation is wrapped in a
/// `tokio::time::timeout`; on expiry the whole process group is killed.
///
/// When `env` is `Some`, the provided variables are merged into (not
/// replacing) the inherited environment.
pub async fn exec_program(
    program: &str,
    args: &[String],
    env: Option<&HashMap<String, String>>,
    timeout_ms: u64,
) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(format!("{program}: {e}")))?;
    #[allow(clippy::cast_possible_wrap)]
    let pgid = child.id().map(|pid| pid as i32);

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    match Box::pin(tokio::time::timeout(timeout, async {
        // Read stdout and stderr concurrently to avoid pipe deadlock
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, MAX_EXEC_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms,
        })
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => {
            if let Some(pgid) = pgid {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pgid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
            Err(ExecError::Timeout)
        }
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Keeps reading past the cap instead of closing the pipe early, so a child
/// still writing never hits SIGPIPE.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Successful result of [`exec_program`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable (e.g. killed by signal).
    pub exit_code: i32,
    /// Captured stdout (lossy UTF-8 conversion).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8 conversion).
    pub stderr: String,
    /// Wall-clock duration of the command in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
    }
}

/// Errors that can occur during [`exec_program`].
#[derive(Debug)]
pub enum ExecError {
    /// The program could not be started (e.g. not found, permission denied).
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    Timeout,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout => write!(f, "Command timed out"),
        }
    }
}

impl std::error::Error for ExecError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let res = exec_program(
            "/bin/sh",
            &args(&["-c", "echo out; echo err >&2; exit 4"]),
            None,
            5000,
        )
        .await
        .unwrap();
        assert_eq!(res.exit_code, 4);
        assert!(!res.success());
        assert_eq!(res.stdout, "out\n");
        assert_eq!(res.stderr_tail(), "err");
    }

    #[tokio::test]
    async fn env_is_merged() {
        let mut env = HashMap::new();
        env.insert("SEEDSYNC_TEST_VAR".to_string(), "hello".to_string());
        let res = exec_program(
            "/bin/sh",
            &args(&["-c", "echo $SEEDSYNC_TEST_VAR; test -n \"$PATH\""]),
            Some(&env),
            5000,
        )
        .await
        .unwrap();
        assert!(res.success());
        assert_eq!(res.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let start = std::time::Instant::now();
        let res = exec_program("/bin/sh", &args(&["-c", "sleep 10"]), None, 200).await;
        assert!(matches!(res, Err(ExecError::Timeout)));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program() {
        let res = exec_program("/nonexistent/prog", &[], None, 1000).await;
        assert!(matches!(res, Err(ExecError::SpawnFailed(_))));
    }
}
