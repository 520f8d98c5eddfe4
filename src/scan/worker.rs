//! Periodic scanning inside a supervised worker.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use super::local::scan_local;
use super::remote::RemoteScanner;
use super::{ScanError, ScanResult, SystemFile};
use crate::supervisor::worker::{Worker, WorkerContext};
use crate::supervisor::WorkerError;
use crate::util::now_millis;

/// What a [`ScannerWorker`] scans.
pub enum ScanTarget {
    Local(PathBuf),
    Remote(RemoteScanner),
}

/// Emits one [`ScanResult`] per interval, or as soon as a request arrives.
/// A failed scan is reported as a failed result and retried at the next
/// interval.
pub struct ScannerWorker {
    name: String,
    target: ScanTarget,
    interval: Duration,
}

impl ScannerWorker {
    pub fn new(name: &str, target: ScanTarget, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            target,
            interval,
        }
    }

    async fn scan(&self) -> Result<Result<Vec<SystemFile>, ScanError>, WorkerError> {
        match &self.target {
            ScanTarget::Local(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || scan_local(&path))
                    .await
                    .map_err(|e| WorkerError::task("scan_panicked", e.to_string()))
            }
            ScanTarget::Remote(scanner) => Ok(scanner.scan().await),
        }
    }
}

impl Worker for ScannerWorker {
    type Request = ();
    type Output = ScanResult;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run_loop(
        &mut self,
        ctx: &mut WorkerContext<(), ScanResult>,
    ) -> Result<(), WorkerError> {
        let started = now_millis();
        let result = match self.scan().await? {
            Ok(files) => {
                debug!(worker = %self.name, count = files.len(), "Scan complete");
                ScanResult::ok(files)
            }
            Err(e) => {
                warn!(worker = %self.name, "{e}");
                ScanResult::failure(e.to_string())
            }
        };
        ctx.emit(result.started_at(started))?;
        if ctx.wait_for_request(self.interval).await.is_some() {
            // Requests that piled up during the wait are covered by the next scan.
            while ctx.next_request().is_some() {}
            debug!(worker = %self.name, "Rescan requested");
        }
        Ok(())
    }
}
