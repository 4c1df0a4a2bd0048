use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use solver_bridge_core::{EnvelopeProbe, Request, RequestEnvelope, ResponseEnvelope};

use crate::calls::dispatch;
use crate::error::WorkerError;
use crate::loader::EngineLoader;
use crate::worker::WorkerConfig;

const WORKER_THREAD_NAME: &str = "solver-engine-worker";

pub(crate) fn spawn(
    config: &WorkerConfig,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
) -> Result<(), WorkerError> {
    let loader = EngineLoader::new(
        "worker",
        config.fetcher.clone(),
        config.runtimes.clone(),
        config.runtime.clone(),
        config.readiness,
    );

    thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    // Dropping `outbound` here disconnects the channel.
                    error!(error = %err, "failed to build worker runtime");
                    return;
                }
            };
            rt.block_on(WorkerHost::new(loader, outbound).run(inbound));
        })
        .map(|_| ())
        .map_err(|err| WorkerError::Spawn(err.to_string()))
}

pub(crate) struct WorkerHost {
    loader: EngineLoader,
    outbound: mpsc::UnboundedSender<String>,
    announced: bool,
}

impl WorkerHost {
    pub(crate) fn new(loader: EngineLoader, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            loader,
            outbound,
            announced: false,
        }
    }

    pub(crate) async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = inbound.recv().await {
            if self.handle_frame(&frame).await.is_break() {
                break;
            }
        }
        self.loader.unload();
        debug!("worker host stopped");
    }

    async fn handle_frame(&mut self, frame: &str) -> ControlFlow<()> {
        let RequestEnvelope { id, request } = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.reject_undecodable(frame, &err);
                return ControlFlow::Continue(());
            }
        };

        match request {
            Request::Init => match self.loader.load().await {
                Ok(_) => {
                    self.reply(ResponseEnvelope::result(id, Value::Null));
                    if !self.announced {
                        self.announced = true;
                        self.reply(ResponseEnvelope::Ready);
                    }
                }
                Err(err) => self.reply(ResponseEnvelope::error(Some(id), err.to_string())),
            },
            Request::Terminate => {
                self.loader.unload();
                self.reply(ResponseEnvelope::result(id, Value::Null));
                return ControlFlow::Break(());
            }
            request => {
                let name = request.name();
                let response = match self.serve(request).await {
                    Ok(data) => ResponseEnvelope::result(id, data),
                    Err(message) => {
                        debug!(request = name, error = %message, "worker request failed");
                        ResponseEnvelope::error(Some(id), message)
                    }
                };
                self.reply(response);
            }
        }
        ControlFlow::Continue(())
    }

    async fn serve(&self, request: Request) -> Result<Value, String> {
        let handle = self.loader.load().await.map_err(|err| err.to_string())?;
        match catch_unwind(AssertUnwindSafe(|| dispatch(handle.engine(), request))) {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(format!("engine panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    fn reject_undecodable(&self, frame: &str, err: &serde_json::Error) {
        let probe = serde_json::from_str::<EnvelopeProbe>(frame).ok();
        let (id, kind) = match probe {
            Some(probe) => (probe.id, probe.kind),
            None => (None, None),
        };
        let message = match kind {
            Some(kind) if !Request::NAMES.contains(&kind.as_str()) => {
                format!("unknown operation `{kind}`")
            }
            _ => format!("malformed request: {err}"),
        };
        warn!(id = id.as_deref().unwrap_or("-"), error = %message, "rejecting worker request");
        self.reply(ResponseEnvelope::error(id, message));
    }

    fn reply(&self, response: ResponseEnvelope) {
        match serde_json::to_string(&response) {
            Ok(frame) => {
                let _ = self.outbound.send(frame);
            }
            Err(err) => error!(error = %err, "failed to encode worker response"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::readiness::ReadinessPolicy;
    use crate::testing::{CountingFetcher, FAKE_VERSION, FakeRuntime, Readiness, full_board, registry_with};

    struct Harness {
        to_host: mpsc::UnboundedSender<String>,
        from_host: mpsc::UnboundedReceiver<String>,
        runtime: Arc<FakeRuntime>,
        fetcher: CountingFetcher,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let runtime = FakeRuntime::new(Readiness::Immediate);
            let fetcher = CountingFetcher::new();
            let loader = EngineLoader::new(
                "worker",
                Arc::new(fetcher.clone()),
                registry_with(runtime.clone()),
                "fake",
                ReadinessPolicy::default(),
            );
            let (to_host, inbound) = mpsc::unbounded_channel();
            let (outbound, from_host) = mpsc::unbounded_channel();
            let task = tokio::spawn(WorkerHost::new(loader, outbound).run(inbound));
            Self {
                to_host,
                from_host,
                runtime,
                fetcher,
                task,
            }
        }

        fn send(&self, frame: serde_json::Value) {
            self.to_host.send(frame.to_string()).unwrap();
        }

        async fn recv(&mut self) -> ResponseEnvelope {
            let frame = self.from_host.recv().await.unwrap();
            serde_json::from_str(&frame).unwrap()
        }
    }

    #[tokio::test]
    async fn init_replies_then_announces_ready_once() {
        let mut h = Harness::start();
        h.send(serde_json::json!({"id": "1", "type": "init"}));
        assert_eq!(h.recv().await, ResponseEnvelope::result("1", Value::Null));
        assert_eq!(h.recv().await, ResponseEnvelope::Ready);

        h.send(serde_json::json!({"id": "2", "type": "init"}));
        assert_eq!(h.recv().await, ResponseEnvelope::result("2", Value::Null));
        h.send(serde_json::json!({"id": "3", "type": "getVersion"}));
        assert_eq!(
            h.recv().await,
            ResponseEnvelope::result("3", serde_json::json!({"version": FAKE_VERSION}))
        );
        assert_eq!(h.fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn operations_load_lazily_and_pass_null_moves_through() {
        let mut h = Harness::start();
        let board = serde_json::to_value(full_board()).unwrap();
        h.send(serde_json::json!({"id": "7", "type": "findNextMove", "payload": board}));
        match h.recv().await {
            ResponseEnvelope::Result { id, success, data } => {
                assert_eq!(id, "7");
                assert!(success);
                assert!(data["move"].is_null());
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(h.fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_get_error_responses() {
        let mut h = Harness::start();
        h.send(serde_json::json!({"id": "4", "type": "explode"}));
        assert_eq!(
            h.recv().await,
            ResponseEnvelope::error(Some("4".to_string()), "unknown operation `explode`")
        );

        h.to_host.send("not json".to_string()).unwrap();
        match h.recv().await {
            ResponseEnvelope::Error { id, error } => {
                assert_eq!(id, None);
                assert!(error.starts_with("malformed request"));
            }
            other => panic!("unexpected response {other:?}"),
        }

        h.send(serde_json::json!({"id": "5", "type": "solveAll", "payload": {"cells": [1]}}));
        assert!(matches!(
            h.recv().await,
            ResponseEnvelope::Error { id: Some(id), .. } if id == "5"
        ));
    }

    #[tokio::test]
    async fn engine_panic_becomes_error_response() {
        let mut h = Harness::start();
        h.send(serde_json::json!({"id": "1", "type": "init"}));
        h.recv().await;
        h.recv().await;

        h.runtime.flags().panic_operations.store(true, Ordering::SeqCst);
        h.send(serde_json::json!({"id": "2", "type": "getVersion"}));
        match h.recv().await {
            ResponseEnvelope::Error { id, error } => {
                assert_eq!(id.as_deref(), Some("2"));
                assert!(error.contains("scripted engine panic"));
            }
            other => panic!("unexpected response {other:?}"),
        }

        h.runtime.flags().panic_operations.store(false, Ordering::SeqCst);
        h.send(serde_json::json!({"id": "3", "type": "getVersion"}));
        assert!(matches!(h.recv().await, ResponseEnvelope::Result { .. }));
    }

    #[tokio::test]
    async fn terminate_unloads_and_stops() {
        let mut h = Harness::start();
        h.send(serde_json::json!({"id": "1", "type": "init"}));
        h.recv().await;
        h.recv().await;

        h.send(serde_json::json!({"id": "2", "type": "terminate"}));
        assert_eq!(h.recv().await, ResponseEnvelope::result("2", Value::Null));
        h.task.await.unwrap();
        assert_eq!(h.runtime.flags().shutdowns.load(Ordering::SeqCst), 1);
        assert!(h.from_host.recv().await.is_none());
    }
}
