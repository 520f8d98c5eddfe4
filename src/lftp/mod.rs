//! Transfers through a long-lived lftp process.
//!
//! [`Lftp`] keeps one `lftp` child with piped stdin/stdout for the lifetime of
//! the daemon; its job queue lives inside that process. Each command is
//! followed by `echo <marker>` and the reply is read up to the marker line, so
//! the caller knows exactly which output belongs to which command.
//!
//! The controller talks to transfers only through [`TransferClient`].

pub mod job_status;
pub mod parser;

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::Config;
pub use job_status::{JobState, JobType, LftpJobStatus, StatusError, TransferState};

/// Errors from the lftp process.
#[derive(Debug)]
pub enum LftpError {
    /// The lftp binary could not be started.
    SpawnFailed(String),
    /// Reading from or writing to lftp failed, or lftp exited.
    Io(String),
    /// No reply marker within the command timeout.
    Timeout(String),
    /// lftp rejected the command.
    Command(String),
}

impl std::fmt::Display for LftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LftpError::SpawnFailed(e) => write!(f, "Failed to spawn lftp: {e}"),
            LftpError::Io(e) => write!(f, "lftp I/O error: {e}"),
            LftpError::Timeout(cmd) => write!(f, "lftp did not answer command: {cmd}"),
            LftpError::Command(e) => write!(f, "lftp error: {e}"),
        }
    }
}

impl std::error::Error for LftpError {}

/// What the controller needs from the transfer backend.
#[async_trait]
pub trait TransferClient: Send {
    /// Queue a transfer of the remote `name` into the local directory.
    async fn queue(&mut self, name: &str, is_dir: bool) -> Result<(), LftpError>;
    /// Stop the job for `name`. Returns `false` if no such job exists.
    async fn kill(&mut self, name: &str) -> Result<bool, LftpError>;
    /// Queued and running jobs.
    async fn status(&mut self) -> Result<Vec<LftpJobStatus>, LftpError>;
    /// Kill every job and shut the backend down.
    async fn exit(&mut self);
}

/// Connection and tuning settings for [`Lftp`].
#[derive(Debug, Clone)]
pub struct LftpSettings {
    pub binary: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub ssh_key: Option<String>,
    pub remote_path: String,
    pub local_path: String,
    pub num_max_parallel_downloads: u32,
    pub num_max_parallel_files_per_download: u32,
    pub num_max_connections_per_file: u32,
    pub command_timeout: Duration,
}

impl LftpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.lftp.binary.clone(),
            address: config.remote.address.clone(),
            port: config.remote.port,
            username: config.remote.username.clone(),
            password: config.remote.password.clone(),
            ssh_key: config.remote.ssh_key.clone(),
            remote_path: config.remote.path.clone(),
            local_path: config.local.path.clone(),
            num_max_parallel_downloads: config.lftp.num_max_parallel_downloads,
            num_max_parallel_files_per_download: config.lftp.num_max_parallel_files_per_download,
            num_max_connections_per_file: config.lftp.num_max_connections_per_file,
            command_timeout: Duration::from_millis(config.lftp.command_timeout_ms),
        }
    }
}

/// A running lftp process.
pub struct Lftp {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    settings: LftpSettings,
    marker_seq: u64,
}

impl Lftp {
    /// Start lftp, apply settings and open the sftp connection.
    pub async fn spawn(settings: LftpSettings) -> Result<Self, LftpError> {
        let mut child = Command::new(&settings.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LftpError::SpawnFailed(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LftpError::SpawnFailed("Failed to take stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LftpError::SpawnFailed("Failed to take stdout pipe".to_string()))?;

        let mut lftp = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            settings,
            marker_seq: 0,
        };

        for command in lftp.setup_commands() {
            lftp.run_command(&command).await?;
        }
        info!(
            address = %lftp.settings.address,
            port = lftp.settings.port,
            "lftp connected"
        );
        Ok(lftp)
    }

    fn setup_commands(&self) -> Vec<String> {
        let s = &self.settings;
        let mut connect_program = format!("ssh -a -x -p {}", s.port);
        if let Some(key) = &s.ssh_key {
            connect_program.push_str(&format!(" -i {key}"));
        }
        let credentials = format!("{},{}", s.username, s.password.as_deref().unwrap_or(""));
        vec![
            "set cmd:interactive false".to_string(),
            "set xfer:clobber on".to_string(),
            "set sftp:auto-confirm yes".to_string(),
            format!("set sftp:connect-program {}", quote(&connect_program)),
            format!("set cmd:queue-parallel {}", s.num_max_parallel_downloads),
            format!(
                "set mirror:parallel-transfer-count {}",
                s.num_max_parallel_files_per_download
            ),
            format!("set pget:default-n {}", s.num_max_connections_per_file),
            format!("set mirror:use-pget-n {}", s.num_max_connections_per_file),
            format!(
                "open -u {} -p {} sftp://{}",
                quote(&credentials),
                s.port,
                s.address
            ),
        ]
    }

    fn remote_path_of(&self, name: &str) -> String {
        format!("{}/{name}", self.settings.remote_path.trim_end_matches('/'))
    }

    fn local_dir(&self) -> String {
        format!("{}/", self.settings.local_path.trim_end_matches('/'))
    }

    /// Send one command and collect everything it printed.
    async fn run_command(&mut self, command: &str) -> Result<String, LftpError> {
        self.marker_seq += 1;
        let marker = format!("__seedsync_done_{}__", self.marker_seq);
        debug!(command, "lftp <-");

        let payload = format!("{command}\necho {marker}\n");
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| LftpError::Io(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| LftpError::Io(e.to_string()))?;

        let stdout = &mut self.stdout;
        let read = async {
            let mut output = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = stdout
                    .read_line(&mut line)
                    .await
                    .map_err(|e| LftpError::Io(e.to_string()))?;
                if n == 0 {
                    return Err(LftpError::Io("lftp closed its output".to_string()));
                }
                if line.trim_end() == marker {
                    return Ok(output);
                }
                output.push_str(&line);
            }
        };
        match tokio::time::timeout(self.settings.command_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(LftpError::Timeout(command.to_string())),
        }
    }
}

#[async_trait]
impl TransferClient for Lftp {
    async fn queue(&mut self, name: &str, is_dir: bool) -> Result<(), LftpError> {
        let remote = quote(&self.remote_path_of(name));
        let local = quote(&self.local_dir());
        let command = if is_dir {
            format!("queue mirror -c {remote} {local}")
        } else {
            format!("queue pget -c {remote} -o {local}")
        };
        let output = self.run_command(&command).await?;
        if let Some(err) = output.lines().find(|l| l.contains("Unknown command")) {
            return Err(LftpError::Command(err.trim().to_string()));
        }
        info!(name, is_dir, "Queued transfer");
        Ok(())
    }

    async fn kill(&mut self, name: &str) -> Result<bool, LftpError> {
        let jobs = self.status().await?;
        let Some(job) = jobs.iter().find(|j| j.name() == name) else {
            return Ok(false);
        };
        let command = match job.state() {
            JobState::Running => format!("kill {}", job.id()),
            JobState::Queued => {
                format!("queue --delete {}", quote(&format!("*{}*", self.remote_path_of(name))))
            }
        };
        self.run_command(&command).await?;
        info!(name, job_id = job.id(), "Killed transfer");
        Ok(true)
    }

    async fn status(&mut self) -> Result<Vec<LftpJobStatus>, LftpError> {
        let output = self.run_command("jobs -v").await?;
        Ok(parser::parse(&output))
    }

    async fn exit(&mut self) {
        let _ = self.run_command("kill all").await;
        let _ = self.stdin.write_all(b"exit\n").await;
        let _ = self.stdin.flush().await;
        match tokio::time::timeout(self.settings.command_timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!("lftp exited: {status}"),
            Ok(Err(e)) => warn!("lftp wait error: {e}"),
            Err(_) => {
                warn!("lftp did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Double-quote a string for the lftp command line.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("/a b/c"), "\"/a b/c\"");
        assert_eq!(quote(r#"x"y\z"#), r#""x\"y\\z""#);
    }
}
