//! How decoded messages reach `on_receive`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// Dispatch strategy for decoded messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Call `on_receive` on the read task, in order, before the next read
    #[default]
    Inline,
    /// One blocking-pool task per message, no ordering between messages. At
    /// most the inbound bound are in flight at once
    Pooled,
    /// A per-session worker runs messages one at a time in arrival order
    Ordered,
}

/// Single-concurrency worker preserving arrival order.
///
/// The worker owns no backlog: on each wake-up it pulls messages from `next`
/// until it returns `None`, running each on the blocking pool and starting
/// the next only after the previous has returned. Messages therefore wait in
/// the caller's bounded queue, where its overflow policy still applies.
pub struct OrderedWorker {
    wake: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl OrderedWorker {
    /// Start a worker on `runtime`
    pub fn spawn<M, N, F>(runtime: &Handle, next: N, handler: F) -> Self
    where
        M: Send + 'static,
        N: Fn() -> Option<M> + Send + 'static,
        F: Fn(M) + Send + Sync + 'static,
    {
        let wake = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);
        let handle = runtime.spawn({
            let wake = wake.clone();
            let stopped = stopped.clone();
            async move {
                loop {
                    while let Some(message) = next() {
                        let handler = handler.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || handler(message)).await {
                            warn!("Ordered dispatch task failed: {}", e);
                        }
                    }
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    wake.notified().await;
                }
            }
        });
        Self {
            wake,
            stopped,
            handle,
        }
    }

    /// Tell the worker new messages may be available
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop once `next` runs dry
    pub fn shutdown(self) -> JoinHandle<()> {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
        self.handle
    }
}
