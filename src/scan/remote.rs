//! Scan the seedbox over ssh.
//!
//! The remote side runs `seedsync scan <path>` (configurable), which prints
//! the snapshot as JSON; see `scan_local`. Password logins go through
//! `sshpass -e` so the secret travels in the environment, not on the command
//! line.

use std::collections::HashMap;

use tracing::debug;

use super::{ScanError, SystemFile};
use crate::config::Config;
use crate::shell::exec_program;

/// Upper bound for one remote scan, connection setup included.
const SCAN_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone)]
pub struct RemoteScanner {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub ssh_key: Option<String>,
    pub remote_path: String,
    pub scan_command: String,
}

impl RemoteScanner {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.remote.address.clone(),
            port: config.remote.port,
            username: config.remote.username.clone(),
            password: config.remote.password.clone(),
            ssh_key: config.remote.ssh_key.clone(),
            remote_path: config.remote.path.clone(),
            scan_command: config.remote.scan_command.clone(),
        }
    }

    /// Program, arguments and extra environment for one scan.
    fn command(&self) -> (String, Vec<String>, Option<HashMap<String, String>>) {
        let mut ssh = vec!["ssh".to_string()];
        if self.password.is_none() {
            ssh.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        ssh.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ]);
        if let Some(key) = &self.ssh_key {
            ssh.extend(["-i".to_string(), key.clone()]);
        }
        ssh.push(format!("{}@{}", self.username, self.address));
        ssh.push(format!(
            "{} {}",
            self.scan_command,
            shell_quote(&self.remote_path)
        ));

        match &self.password {
            Some(password) => {
                let mut args = vec!["-e".to_string()];
                args.extend(ssh);
                let env = HashMap::from([("SSHPASS".to_string(), password.clone())]);
                ("sshpass".to_string(), args, Some(env))
            }
            None => {
                let program = ssh.remove(0);
                (program, ssh, None)
            }
        }
    }

    pub async fn scan(&self) -> Result<Vec<SystemFile>, ScanError> {
        let (program, args, env) = self.command();
        debug!(address = %self.address, path = %self.remote_path, "Running remote scan");
        let res = exec_program(&program, &args, env.as_ref(), SCAN_TIMEOUT_MS).await?;
        if !res.success() {
            return Err(ScanError::Remote(format!(
                "exit code {}: {}",
                res.exit_code,
                res.stderr_tail()
            )));
        }
        parse_scan_output(&res.stdout)
    }
}

/// Parse the JSON printed by `seedsync scan`.
pub fn parse_scan_output(stdout: &str) -> Result<Vec<SystemFile>, ScanError> {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).map_err(|e| {
        let preview: String = trimmed.chars().take(200).collect();
        ScanError::Parse(format!("{e}: {preview}"))
    })
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
