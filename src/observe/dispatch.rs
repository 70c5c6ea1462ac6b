//! Queue-driven dispatch engine.
//!
//! Published events go onto one unbounded FIFO queue. A single loop takes
//! them off in order, resolves them against the [`SubscriptionRegistry`] and
//! spawns every matched listener as its own task. Tasks are tracked so the
//! engine can be drained before shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::listener::{Listener, ListenerContext};
use super::registry::{RegistryError, SubscriptionRegistry};
use crate::events::{Event, EventPattern, PatternKey};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch loop is already running")]
    AlreadyRunning,

    #[error("Dispatch queue is closed")]
    Closed,
}

/// Cloneable publishing handle for producers that do not own the engine.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

impl Publisher {
    /// Enqueues an event. Never waits.
    pub fn publish(&self, event: Event) -> Result<(), DispatchError> {
        self.tx.send(Arc::new(event)).map_err(|_| DispatchError::Closed)
    }
}

/// Single-queue dispatcher over a subscription registry.
pub struct DispatchEngine {
    name: String,
    registry: Arc<SubscriptionRegistry>,
    context: Arc<ListenerContext>,
    tx: mpsc::UnboundedSender<Arc<Event>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Event>>>>,
    tracker: TaskTracker,
    shutdown: Mutex<CancellationToken>,
}

impl DispatchEngine {
    /// Creates an engine with its own registry and listener context.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parts(
            name,
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(ListenerContext::new()),
        )
    }

    /// Creates an engine over an existing registry and context.
    pub fn with_parts(
        name: impl Into<String>,
        registry: Arc<SubscriptionRegistry>,
        context: Arc<ListenerContext>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            name: name.into(),
            registry,
            context,
            tx,
            rx: Mutex::new(Some(rx)),
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<ListenerContext> {
        &self.context
    }

    pub fn subscribe(
        &self,
        pattern: Arc<dyn EventPattern>,
        listener: Listener,
    ) -> Result<PatternKey, RegistryError> {
        self.registry.subscribe(pattern, listener)
    }

    pub fn unsubscribe(&self, pattern: &dyn EventPattern, listener: &Listener) -> bool {
        self.registry.unsubscribe(pattern, listener)
    }

    /// Enqueues an event for dispatch.
    pub fn publish(&self, event: Event) -> Result<(), DispatchError> {
        self.tx.send(Arc::new(event)).map_err(|_| DispatchError::Closed)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher { tx: self.tx.clone() }
    }

    /// Runs the dispatch loop until [`stop`](Self::stop) is called.
    ///
    /// Events left in the queue when the loop stops stay there for the next
    /// `run`.
    pub async fn run(&self) -> Result<(), DispatchError> {
        let (rx, shutdown) = self.claim()?;
        self.run_loop(rx, shutdown).await
    }

    /// Runs the loop on a new task. The queue is claimed before this returns,
    /// so a `stop` issued right after applies to this run.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), DispatchError>> {
        let claimed = self.claim();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let (rx, shutdown) = claimed?;
            engine.run_loop(rx, shutdown).await
        })
    }

    /// Stops the current run. In-flight listeners finish. Without a run in
    /// progress this does nothing.
    pub fn stop(&self) {
        self.shutdown.lock().cancel();
    }

    /// Takes the queue and gives the new run its own shutdown token.
    fn claim(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<Arc<Event>>, CancellationToken), DispatchError> {
        let rx = self.rx.lock().take().ok_or(DispatchError::AlreadyRunning)?;
        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();
        Ok((rx, shutdown))
    }

    async fn run_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
        shutdown: CancellationToken,
    ) -> Result<(), DispatchError> {
        info!("[{}] Dispatch loop started", self.name);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                next = rx.recv() => match next {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }

        *self.rx.lock() = Some(rx);
        info!("[{}] Dispatch loop stopped", self.name);
        Ok(())
    }

    /// Waits until every spawned listener invocation has completed.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of listener invocations still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn dispatch(&self, event: Arc<Event>) {
        let matches = self.registry.resolve(event.as_ref());
        trace!("[{}] Event matched {} listener(s)", self.name, matches.len());

        for (_pattern, listener) in matches {
            let event = Arc::clone(&event);
            let context = Arc::clone(&self.context);
            let name = self.name.clone();

            self.tracker.spawn(async move {
                let invocation = AssertUnwindSafe(listener.invoke(event, &context)).catch_unwind();
                match invocation.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("[{}] Listener {:?} failed: {:#}", name, listener, e),
                    Err(_) => error!("[{}] Listener {:?} panicked", name, listener),
                }
            });
        }
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("name", &self.name)
            .field("patterns", &self.registry.pattern_count())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shutdown.lock().cancel();
        debug!("[{}] Dispatch engine dropped", self.name);
    }
}
