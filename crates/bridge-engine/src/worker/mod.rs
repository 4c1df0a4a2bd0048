//! The background execution context: a dedicated thread that owns its own
//! engine and talks to the caller over JSON frames.

use std::sync::Arc;
use std::time::Duration;

use crate::fetch::ModuleFetcher;
use crate::readiness::ReadinessPolicy;
use crate::runtime::RuntimeRegistry;

mod channel;
mod host;

pub use channel::WorkerChannel;

/// What the worker thread needs to load its own engine.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Module fetcher used inside the worker.
    pub fetcher: Arc<dyn ModuleFetcher>,
    /// Runtimes available to the worker's loader.
    pub runtimes: Arc<RuntimeRegistry>,
    /// Runtime name to bootstrap.
    pub runtime: String,
    /// Readiness bounds for the worker's load.
    pub readiness: ReadinessPolicy,
    /// Upper bound on a single operation round trip. `None` waits forever.
    pub call_timeout: Option<Duration>,
}
