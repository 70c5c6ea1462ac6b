//! Listener targets for dispatched events.
//!
//! A listener is either a callback, a method on a service registered by name,
//! or a named broadcast channel. Services and channels are resolved through
//! the [`ListenerContext`] owned by the dispatch engine at invocation time, so
//! subscriptions can be declared before the target exists.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::events::Event;

/// Boxed async callback.
pub type ListenerFn = dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Default capacity of a channel group's ring buffer.
const CHANNEL_CAPACITY: usize = 1024;

/// Where a matched event is delivered.
#[derive(Clone)]
pub enum Listener {
    /// Invoke the callback with the event.
    Callback(Arc<ListenerFn>),
    /// Call `method` on the service registered as `service`.
    Service { service: String, method: String },
    /// Broadcast to every receiver of the named channel group.
    Channel(String),
}

impl Listener {
    /// Wraps an async closure.
    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: Arc<ListenerFn> =
            Arc::new(move |event| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(event)) });
        Listener::Callback(callback)
    }

    pub fn service(service: impl Into<String>, method: impl Into<String>) -> Self {
        Listener::Service {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Listener::Channel(name.into())
    }

    /// Delivers the event to this listener.
    pub async fn invoke(&self, event: Arc<Event>, context: &ListenerContext) -> anyhow::Result<()> {
        match self {
            Listener::Callback(callback) => callback(event).await,
            Listener::Service { service, method } => {
                let target = context
                    .services
                    .get(service)
                    .ok_or_else(|| anyhow!("No service registered as '{}'", service))?;
                target.handle(method, event).await
            }
            Listener::Channel(name) => {
                context.channels.broadcast(name, event);
                Ok(())
            }
        }
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Listener::Callback(a), Listener::Callback(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (
                Listener::Service { service: a, method: m },
                Listener::Service { service: b, method: n },
            ) => a == b && m == n,
            (Listener::Channel(a), Listener::Channel(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Callback(callback) => {
                write!(f, "Callback({:p})", Arc::as_ptr(callback) as *const ())
            }
            Listener::Service { service, method } => write!(f, "Service({}.{})", service, method),
            Listener::Channel(name) => write!(f, "Channel({})", name),
        }
    }
}

/// A named target for [`Listener::Service`].
#[async_trait]
pub trait Service: Send + Sync {
    /// Handles `event` with the method named `method`.
    async fn handle(&self, method: &str, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Registry of services addressable by name.
#[derive(Default)]
pub struct ServiceLocator {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn Service>) {
        let name = name.into();
        debug!("Service '{}' registered", name);
        self.services.write().insert(name, service);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().get(name).cloned()
    }
}

/// Named broadcast channels for [`Listener::Channel`].
#[derive(Default)]
pub struct ChannelGroups {
    groups: RwLock<HashMap<String, broadcast::Sender<Arc<Event>>>>,
}

impl ChannelGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a group, creating it on first use.
    pub fn join(&self, name: &str) -> broadcast::Receiver<Arc<Event>> {
        if let Some(sender) = self.groups.read().get(name) {
            return sender.subscribe();
        }

        self.groups
            .write()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Sends to every current member. Returns how many received it.
    pub fn broadcast(&self, name: &str, event: Arc<Event>) -> usize {
        match self.groups.read().get(name) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                trace!("Channel group '{}' has no members", name);
                0
            }
        }
    }
}

/// What a dispatch engine needs to resolve non-callback listeners.
#[derive(Default)]
pub struct ListenerContext {
    pub services: ServiceLocator,
    pub channels: ChannelGroups,
}

impl ListenerContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: parking_lot::Mutex<Vec<(String, Event)>>,
    }

    #[async_trait]
    impl Service for Recorder {
        async fn handle(&self, method: &str, event: Arc<Event>) -> anyhow::Result<()> {
            self.calls.lock().push((method.to_string(), (*event).clone()));
            Ok(())
        }
    }

    #[test]
    fn test_callback_equality_is_identity() {
        let a = Listener::callback(|_| async { Ok(()) });
        let b = a.clone();
        let c = Listener::callback(|_| async { Ok(()) });

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Listener::channel("quotes"), Listener::channel("quotes"));
        assert_ne!(Listener::service("book", "on_quote"), Listener::service("book", "on_trade"));
    }

    #[tokio::test]
    async fn test_callback_invocation() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let listener = Listener::callback(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let context = ListenerContext::new();
        listener.invoke(Arc::new(Event::new()), &context).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_listener_resolves_by_name() {
        let context = ListenerContext::new();
        let recorder = Arc::new(Recorder {
            calls: parking_lot::Mutex::new(Vec::new()),
        });
        context.services.register("book", recorder.clone());

        let event = Arc::new(Event::new().with("symbol", "AAPL"));
        Listener::service("book", "on_quote")
            .invoke(Arc::clone(&event), &context)
            .await
            .unwrap();

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "on_quote");
        assert_eq!(calls[0].1, *event);
    }

    #[tokio::test]
    async fn test_missing_service_is_an_error() {
        let context = ListenerContext::new();
        let result = Listener::service("nope", "run")
            .invoke(Arc::new(Event::new()), &context)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_channel_listener_broadcasts_to_members() {
        let context = ListenerContext::new();
        let mut first = context.channels.join("quotes");
        let mut second = context.channels.join("quotes");

        let event = Arc::new(Event::new().with("symbol", "AAPL"));
        Listener::channel("quotes")
            .invoke(Arc::clone(&event), &context)
            .await
            .unwrap();

        assert_eq!(*first.recv().await.unwrap(), *event);
        assert_eq!(*second.recv().await.unwrap(), *event);
        assert_eq!(context.channels.broadcast("empty", event), 0);
    }
}
