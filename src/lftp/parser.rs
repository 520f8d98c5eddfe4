//! Parser for lftp `jobs -v` output.
//!
//! The output has two kinds of blocks. A queue block lists commands that have
//! not started yet:
//!
//! ```text
//! [0] queue (sftp://user@host)
//! sftp://user@host/home/user
//! 	Now executing: [1] mirror -c /remote/show /local/
//! 	Commands queued:
//! 	 1. pget -c /remote/movie.mkv -o /local/
//! ```
//!
//! and one block per running job, with aggregate progress on the header and
//! per-file progress below it:
//!
//! ```text
//! [1] mirror -c /remote/show /local/  -- 34k/26M (0%) 22.3 KiB/s
//! 	\transfer `s01/e01.mkv'
//! 	`e01.mkv' at 1234 (5%) 2.6K/s eta:5m [Receiving data]
//! ```
//!
//! Lines that match nothing are skipped.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::job_status::{JobState, JobType, LftpJobStatus, TransferState};

static QUEUE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\d+\]\s+queue\s+\(").expect("valid regex"));

static QUEUED_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+\.\s+(mirror|pget)\s+(.+?)\s*$").expect("valid regex")
});

static JOB_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d+)\]\s+(mirror|pget)\s+(.+?)(?:\s+--\s+(.*?))?\s*$").expect("valid regex")
});

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<pos>[\d.]+\s?[A-Za-z]*)/(?P<size>[\d.]+\s?[A-Za-z]*)\s+\((?P<pct>\d+)%\)(?:\s+(?P<speed>[\d.]+\s?[A-Za-z]*/s))?(?:\s+eta:(?P<eta>\S+))?",
    )
    .expect("valid regex")
});

static TRANSFER_CONTEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\\transfer\s+`(.+)'\s*$").expect("valid regex"));

static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*`(?P<name>[^']+)',?\s+(?:at\s+(?P<at>\d+)|got\s+(?P<got>\d+)\s+of\s+(?P<of>\d+))\s+\((?P<pct>\d+)%\)(?:\s+(?P<speed>[\d.]+\s?[A-Za-z]*/s))?(?:\s+eta:(?P<eta>\S+))?",
    )
    .expect("valid regex")
});

static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)([dhms])").expect("valid regex"));

/// Options whose next token is a value rather than a path.
const VALUE_OPTIONS: &[&str] = &["-n", "-P", "-O"];

/// Parse the complete output of `jobs -v`.
pub fn parse(output: &str) -> Vec<LftpJobStatus> {
    let mut jobs: Vec<LftpJobStatus> = Vec::new();
    let mut in_queue = false;
    let mut current: Option<usize> = None;
    let mut context: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if QUEUE_HEADER.is_match(line) {
            in_queue = true;
            current = None;
            continue;
        }

        if let Some(caps) = JOB_HEADER.captures(line) {
            in_queue = false;
            context = None;
            current = None;
            let Ok(id) = caps[1].parse::<i32>() else {
                continue;
            };
            let Some(job_type) = JobType::from_str_opt(&caps[2]) else {
                continue;
            };
            let Some((name, flags)) = name_and_flags(&caps[3]) else {
                warn!(line, "Could not find a path in lftp job header");
                continue;
            };
            let mut job = LftpJobStatus::new(id, job_type, JobState::Running, name, flags);
            if let Some(progress) = caps.get(4).and_then(|m| parse_progress(m.as_str())) {
                // Running by construction, cannot fail
                let _ = job.set_total_transfer_state(progress);
            }
            jobs.push(job);
            current = Some(jobs.len() - 1);
            continue;
        }

        if in_queue {
            if let Some(caps) = QUEUED_COMMAND.captures(line) {
                let Some(job_type) = JobType::from_str_opt(&caps[1]) else {
                    continue;
                };
                if let Some((name, flags)) = name_and_flags(&caps[2]) {
                    jobs.push(LftpJobStatus::new(
                        -1,
                        job_type,
                        JobState::Queued,
                        name,
                        flags,
                    ));
                }
            }
            continue;
        }

        let Some(idx) = current else {
            continue;
        };

        if let Some(caps) = TRANSFER_CONTEXT.captures(line) {
            context = Some(caps[1].to_string());
            continue;
        }

        if let Some(caps) = FILE_LINE.captures(line) {
            let job = &mut jobs[idx];
            let (position, size) = match (caps.name("at"), caps.name("got")) {
                (Some(at), _) => (at.as_str().parse().ok(), None),
                (None, Some(got)) => (
                    got.as_str().parse().ok(),
                    caps.name("of").and_then(|m| m.as_str().parse().ok()),
                ),
                (None, None) => (None, None),
            };
            let state = TransferState {
                position,
                size,
                percent: caps["pct"].parse().ok(),
                speed: caps.name("speed").and_then(|m| parse_speed(m.as_str())),
                eta: caps.name("eta").and_then(|m| parse_duration(m.as_str())),
            };
            let key = match job.job_type() {
                JobType::Pget => job.name().to_string(),
                JobType::Mirror => context
                    .take()
                    .unwrap_or_else(|| caps["name"].to_string()),
            };
            if job.job_type() == JobType::Pget && job.total_transfer_state().is_none() {
                let _ = job.set_total_transfer_state(state);
            }
            if let Err(e) = job.add_active_file_transfer_state(key, state) {
                warn!("Dropping file progress: {e}");
            }
        }
    }

    jobs
}

/// Aggregate progress after the `--` of a job header.
fn parse_progress(s: &str) -> Option<TransferState> {
    let caps = PROGRESS.captures(s.trim())?;
    Some(TransferState {
        position: parse_size(&caps["pos"]),
        size: parse_size(&caps["size"]),
        percent: caps["pct"].parse().ok(),
        speed: caps.name("speed").and_then(|m| parse_speed(m.as_str())),
        eta: caps.name("eta").and_then(|m| parse_duration(m.as_str())),
    })
}

/// Human-readable size (`1234`, `34k`, `2.6 KiB`, `26M`) in bytes, base 1024.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        _ => return None,
    };
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    Some((value * multiplier as f64).round() as u64)
}

/// Speed such as `15.8 KiB/s` or `1.2M/s`, in bytes per second.
pub fn parse_speed(s: &str) -> Option<u64> {
    parse_size(s.trim().strip_suffix("/s")?)
}

/// Duration such as `45s`, `5m`, `1h2m3s` or `2d`, in seconds. `None` if
/// nothing matches or the total does not fit in a `u64`.
pub fn parse_duration(s: &str) -> Option<u64> {
    let mut total: Option<u64> = None;
    for caps in DURATION_PART.captures_iter(s) {
        let value: u64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "d" => 86_400,
            "h" => 3_600,
            "m" => 60,
            _ => 1,
        };
        let part = value.checked_mul(unit)?;
        total = Some(total.unwrap_or(0).checked_add(part)?);
    }
    total
}

/// Pull the transferred name (basename of the source path) and the flags out of
/// a `mirror`/`pget` argument string.
fn name_and_flags(args: &str) -> Option<(String, String)> {
    let tokens = split_args(args);
    let mut flags: Vec<String> = Vec::new();
    let mut paths: Vec<String> = Vec::new();
    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        if token == "-o" {
            iter.next();
        } else if VALUE_OPTIONS.contains(&token.as_str()) {
            let value = iter.next().unwrap_or_default();
            flags.push(format!("{token} {value}"));
        } else if token.starts_with('-') {
            flags.push(token);
        } else {
            paths.push(token);
        }
    }
    let source = paths.first()?.trim_end_matches('/');
    let name = source.rsplit('/').next().unwrap_or(source);
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), flags.join(" ")))
}

/// Split on whitespace, honoring double quotes and backslash escapes.
fn split_args(args: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = args.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}
