//! Child side of a supervised worker.
//!
//! [`run_worker`] drives a [`Worker`] inside the `seedsync worker <kind>`
//! process: `run_init` once, `run_loop` until stdin reaches EOF (the
//! supervisor's shutdown request) or the loop fails, then `run_cleanup` exactly
//! once. A loop error other than [`WorkerError::ServiceExit`] is written to
//! stdout as a fatal frame before the process exits.

use std::io::Write;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{WorkerError, WorkerFrame};

/// A unit of work run inside a worker process.
///
/// Each `run_loop` call should return promptly; long waits go through
/// [`WorkerContext::sleep`] or [`WorkerContext::wait_for_request`], which
/// return early on shutdown.
#[allow(async_fn_in_trait)]
pub trait Worker {
    type Request: DeserializeOwned + Send + 'static;
    type Output: Serialize;

    fn name(&self) -> &str;

    async fn run_init(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn run_loop(
        &mut self,
        ctx: &mut WorkerContext<Self::Request, Self::Output>,
    ) -> Result<(), WorkerError>;

    async fn run_cleanup(&mut self) {}
}

/// What a worker loop can see of the outside world.
pub struct WorkerContext<Req, Out> {
    requests: mpsc::UnboundedReceiver<Req>,
    shutdown: watch::Receiver<bool>,
    output: Box<dyn Write + Send>,
    _output: PhantomData<fn(Out)>,
}

impl<Req, Out: Serialize> WorkerContext<Req, Out> {
    /// Send one result to the supervisor.
    pub fn emit(&mut self, item: Out) -> Result<(), WorkerError> {
        self.write_frame(&WorkerFrame::Result { data: item })
    }

    /// A request that has already arrived, if any.
    pub fn next_request(&mut self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    /// Wait up to `timeout` for a request. `None` on timeout or shutdown.
    pub async fn wait_for_request(&mut self, timeout: Duration) -> Option<Req> {
        if let Some(req) = self.next_request() {
            return Some(req);
        }
        if self.is_shutdown() {
            return None;
        }
        tokio::select! {
            req = self.requests.recv() => req,
            _ = self.shutdown.changed() => None,
            () = tokio::time::sleep(timeout) => None,
        }
    }

    /// Sleep for `duration`, returning early on shutdown.
    pub async fn sleep(&mut self, duration: Duration) {
        if self.is_shutdown() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn write_frame(&mut self, frame: &WorkerFrame<Out>) -> Result<(), WorkerError> {
        let mut line = serde_json::to_string(frame).map_err(|e| WorkerError::Io(e.to_string()))?;
        line.push('\n');
        self.output
            .write_all(line.as_bytes())
            .and_then(|()| self.output.flush())
            .map_err(|e| WorkerError::Io(e.to_string()))
    }
}

/// Run `worker` until shutdown or failure.
///
/// Requests are read as JSON lines from `input`; EOF on `input` requests
/// shutdown. Frames are written to `output`.
pub async fn run_worker<W, R>(
    mut worker: W,
    input: R,
    output: Box<dyn Write + Send>,
) -> Result<(), WorkerError>
where
    W: Worker,
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = worker.name().to_string();
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(read_requests(name.clone(), input, requests_tx, shutdown_tx));

    let mut ctx = WorkerContext {
        requests,
        shutdown,
        output,
        _output: PhantomData,
    };

    info!(worker = %name, "Worker running");
    let mut result = worker.run_init().await;
    if result.is_ok() {
        while !ctx.is_shutdown() {
            match worker.run_loop(&mut ctx).await {
                Ok(()) => {}
                Err(WorkerError::ServiceExit) => {
                    info!(worker = %name, "Worker requested service exit");
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
    }

    if let Err(e) = &result {
        error!(worker = %name, "Worker failed: {e}");
        let frame = WorkerFrame::Fatal {
            code: e.code(),
            message: e.to_string(),
        };
        if let Err(write_err) = ctx.write_frame(&frame) {
            warn!(worker = %name, "Could not report failure: {write_err}");
        }
    }

    worker.run_cleanup().await;
    info!(worker = %name, "Worker stopped");
    result
}

async fn read_requests<R, Req>(
    name: String,
    input: R,
    requests: mpsc::UnboundedSender<Req>,
    shutdown: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
    Req: DeserializeOwned,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Req>(&line) {
                Ok(req) => {
                    let _ = requests.send(req);
                }
                Err(e) => warn!(worker = %name, "Ignoring malformed request: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(worker = %name, "Request read error: {e}");
                break;
            }
        }
    }
    debug!(worker = %name, "Input closed, shutting down");
    let _ = shutdown.send(true);
}
