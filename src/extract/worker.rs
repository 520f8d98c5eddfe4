//! Extraction inside a supervised worker.

use std::time::Duration;

use tracing::warn;

use super::{extract_request, ExtractEvent, ExtractRequest};
use crate::supervisor::worker::{Worker, WorkerContext};
use crate::supervisor::WorkerError;

/// How long one loop iteration waits for a request.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Handles [`ExtractRequest`]s one at a time, in arrival order. Every request
/// produces exactly one [`ExtractEvent`].
#[derive(Default)]
pub struct ExtractWorker;

impl Worker for ExtractWorker {
    type Request = ExtractRequest;
    type Output = ExtractEvent;

    fn name(&self) -> &str {
        "extract"
    }

    async fn run_loop(
        &mut self,
        ctx: &mut WorkerContext<ExtractRequest, ExtractEvent>,
    ) -> Result<(), WorkerError> {
        let Some(req) = ctx.wait_for_request(POLL_INTERVAL).await else {
            return Ok(());
        };
        let event = match extract_request(&req).await {
            Ok(()) => ExtractEvent::Completed { name: req.name },
            Err(e) => {
                warn!(name = %req.name, "{e}");
                ExtractEvent::Failed {
                    name: req.name,
                    message: e.to_string(),
                }
            }
        };
        ctx.emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::worker::run_worker;
    use crate::supervisor::WorkerFrame;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn every_request_gets_one_event() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.mkv"), "x").unwrap();
        let requests = [
            ExtractRequest {
                name: "a.mkv".into(),
                is_dir: false,
                local_path: tmp.path().join("a.mkv").display().to_string(),
                out_dir: tmp.path().display().to_string(),
            },
            ExtractRequest {
                name: "gone.zip".into(),
                is_dir: false,
                local_path: tmp.path().join("gone.zip").display().to_string(),
                out_dir: tmp.path().display().to_string(),
            },
        ];

        let out = SharedBuf::default();
        let (reader, mut writer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            for req in &requests {
                let line = serde_json::to_string(req).unwrap() + "\n";
                writer.write_all(line.as_bytes()).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(1500)).await;
            drop(writer);
        });
        run_worker(ExtractWorker, reader, Box::new(out.clone()))
            .await
            .unwrap();

        let bytes = out.0.lock().unwrap().clone();
        let frames: Vec<WorkerFrame<ExtractEvent>> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        let names: Vec<String> = frames
            .iter()
            .map(|f| match f {
                WorkerFrame::Result {
                    data: ExtractEvent::Failed { name, .. },
                } => name.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["a.mkv", "gone.zip"]);
    }
}
