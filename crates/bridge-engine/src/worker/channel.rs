use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use solver_bridge_core::{Request, RequestEnvelope, ResponseEnvelope};

use crate::calls::EngineCall;
use crate::error::WorkerError;
use crate::worker::{WorkerConfig, host};

type Reply = Result<Value, WorkerError>;
// `None` once the link is closed; nothing may be registered after that.
type Pending = Arc<Mutex<Option<HashMap<String, oneshot::Sender<Reply>>>>>;

struct Link {
    to_host: mpsc::UnboundedSender<String>,
    pending: Pending,
    ready: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
}

impl Link {
    fn reject_all(&self, err: WorkerError) {
        for (_, tx) in close(&self.pending) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// Caller-side end of the worker boundary.
///
/// Presents the worker as async calls: every request gets a fresh id and
/// a pending entry that is settled by the matching response, in whatever
/// order responses arrive.
pub struct WorkerChannel {
    config: WorkerConfig,
    link: Mutex<Option<Arc<Link>>>,
    init_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl WorkerChannel {
    /// Channel that spawns its worker from `config` on first use.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether background threads are available on this target.
    pub fn is_supported() -> bool {
        cfg!(not(target_family = "wasm"))
    }

    /// Whether the worker has finished loading its engine.
    pub fn is_ready(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| *link.ready.borrow())
    }

    /// Spawn the worker if needed and wait until it has loaded its engine.
    ///
    /// On failure the worker is torn down, so a later call starts afresh.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        if !Self::is_supported() {
            return Err(WorkerError::Unsupported);
        }
        let _guard = self.init_lock.lock().await;

        let link = match self.current_link() {
            Some(link) if !link.reader.is_finished() => link,
            _ => {
                // Drop a link whose transport already closed.
                self.terminate();
                self.spawn_link()?
            }
        };
        if *link.ready.borrow() {
            return Ok(());
        }

        let mut ready = link.ready.subscribe();
        let res = tokio::select! {
            res = self.request(&link, Request::Init, None) => res.map(|_| ()),
            _ = ready_announced(&mut ready) => Ok(()),
        };
        match res {
            Ok(()) => {
                link.ready.send_replace(true);
                info!("engine worker ready");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "engine worker failed to initialize");
                self.terminate();
                Err(err)
            }
        }
    }

    /// Run `call` on the worker, initializing it first if necessary.
    pub async fn call<C: EngineCall>(&self, call: C) -> Result<C::Output, WorkerError> {
        self.initialize().await?;
        let link = self.current_link().ok_or(WorkerError::Terminated)?;
        let data = self
            .request(&link, call.into_request(), self.config.call_timeout)
            .await?;
        serde_json::from_value(data)
            .map_err(|err| WorkerError::Protocol(format!("{} output: {err}", C::NAME)))
    }

    /// Ask the worker to stop, then drop it regardless of the answer.
    ///
    /// Outstanding requests fail with [`WorkerError::Terminated`]. Calling
    /// this with no worker running does nothing.
    pub fn terminate(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        let envelope = RequestEnvelope {
            id: self.next_id().to_string(),
            request: Request::Terminate,
        };
        if let Ok(frame) = serde_json::to_string(&envelope) {
            let _ = link.to_host.send(frame);
        }
        link.ready.send_replace(false);
        link.reader.abort();
        link.reject_all(WorkerError::Terminated);
        debug!("engine worker terminated");
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    fn spawn_link(&self) -> Result<Arc<Link>, WorkerError> {
        let (to_host, host_inbound) = mpsc::unbounded_channel();
        let (host_outbound, from_host) = mpsc::unbounded_channel();
        host::spawn(&self.config, host_inbound, host_outbound)?;
        debug!("engine worker spawned");
        Ok(self.attach(to_host, from_host))
    }

    fn attach(
        &self,
        to_host: mpsc::UnboundedSender<String>,
        from_host: mpsc::UnboundedReceiver<String>,
    ) -> Arc<Link> {
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (ready, _) = watch::channel(false);
        let ready = Arc::new(ready);
        let reader = tokio::spawn(read_responses(from_host, pending.clone(), ready.clone()));
        let link = Arc::new(Link {
            to_host,
            pending,
            ready,
            reader,
        });
        *self.link.lock() = Some(link.clone());
        link
    }

    async fn request(
        &self,
        link: &Link,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Value, WorkerError> {
        let id = self.next_id().to_string();
        let name = request.name();
        let frame = serde_json::to_string(&RequestEnvelope {
            id: id.clone(),
            request,
        })
        .map_err(|err| WorkerError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        match link.pending.lock().as_mut() {
            Some(entries) => {
                entries.insert(id.clone(), tx);
            }
            None => return Err(WorkerError::Terminated),
        }
        if link.to_host.send(frame).is_err() {
            forget(&link.pending, &id);
            return Err(WorkerError::Disconnected);
        }
        debug!(id = %id, request = name, "worker request sent");

        let reply = async { rx.await.unwrap_or(Err(WorkerError::Disconnected)) };
        match timeout {
            None => reply.await,
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(res) => res,
                Err(_) => {
                    forget(&link.pending, &id);
                    Err(WorkerError::Timeout(limit))
                }
            },
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn ready_announced(rx: &mut watch::Receiver<bool>) {
    let announced = rx.wait_for(|ready| *ready).await.is_ok();
    if !announced {
        std::future::pending::<()>().await;
    }
}

async fn read_responses(
    mut from_host: mpsc::UnboundedReceiver<String>,
    pending: Pending,
    ready: Arc<watch::Sender<bool>>,
) {
    while let Some(frame) = from_host.recv().await {
        let response = match serde_json::from_str::<ResponseEnvelope>(&frame) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "dropping malformed worker response");
                continue;
            }
        };
        match response {
            ResponseEnvelope::Ready => {
                ready.send_replace(true);
            }
            ResponseEnvelope::Result { id, success, data } => {
                let reply = if success {
                    Ok(data)
                } else {
                    Err(WorkerError::Remote("request failed".to_string()))
                };
                settle(&pending, &id, reply);
            }
            ResponseEnvelope::Error { id: Some(id), error } => {
                settle(&pending, &id, Err(WorkerError::Remote(error)));
            }
            ResponseEnvelope::Error { id: None, error } => {
                warn!(error = %error, "worker reported an uncorrelated error");
            }
        }
    }

    // Transport closed: nothing still pending can ever be answered.
    ready.send_replace(false);
    let drained = close(&pending);
    if !drained.is_empty() {
        warn!(pending = drained.len(), "engine worker disconnected with requests in flight");
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(WorkerError::Disconnected));
    }
}

fn close(pending: &Pending) -> Vec<(String, oneshot::Sender<Reply>)> {
    pending.lock().take().into_iter().flatten().collect()
}

fn forget(pending: &Pending, id: &str) {
    if let Some(entries) = pending.lock().as_mut() {
        entries.remove(id);
    }
}

fn settle(pending: &Pending, id: &str, reply: Reply) {
    let entry = pending.lock().as_mut().and_then(|entries| entries.remove(id));
    match entry {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(id, "response for unknown or abandoned request"),
    }
}
