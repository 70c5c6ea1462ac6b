//! Subscription-based stream connection with reconnection logic.
//!
//! Key behaviour:
//! 1. Connect backoff: 2s, 4s, 8s, ... capped, optional retry ceiling
//! 2. Every outbound frame carries the current access token
//! 3. Topics survive reconnects and are resubscribed on every new link
//! 4. One receive loop routes inbound messages to per-topic listeners

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::auth::{AuthError, TokenProvider};
use super::backoff::{Backoff, ReconnectPacer, INITIAL_BACKOFF, MAX_BACKOFF};
use super::transport::{
    ConnectionLimiter, Connector, FrameSink, FrameSource, TransportError, TungsteniteConnector,
};
use crate::events::Event;
use crate::observe::Publisher;

/// Default connect retry ceiling.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default minimum spacing between reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect spacing ceiling for a flapping link.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection limit of {limit} reached")]
    TooManyConnections { limit: usize },

    #[error("Gave up connecting after {attempts} attempt(s)")]
    ConnectExhausted { attempts: u32 },

    #[error("Connection failed: {0}")]
    ConnectFailed(TransportError),

    #[error("Send failed: {0}")]
    SendFailed(TransportError),

    #[error("Not connected")]
    NotConnected,

    #[error("Stream closed")]
    Closed,

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Connection state for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            initial_delay: INITIAL_BACKOFF,
            max_delay: MAX_BACKOFF,
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
        }
    }
}

/// A decoded inbound message and the topic it was routed by.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Extracts the topic key from a decoded message.
pub type TopicExtractor = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Extractor reading a string or number at a JSON pointer such as `/header/tr_cd`.
pub fn pointer_extractor(pointer: impl Into<String>) -> TopicExtractor {
    let pointer = pointer.into();
    Arc::new(move |message: &Value| match message.pointer(&pointer)? {
        Value::String(topic) => Some(topic.clone()),
        Value::Number(topic) => Some(topic.to_string()),
        _ => None,
    })
}

type TopicListenerFn =
    dyn Fn(Arc<InboundMessage>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Handler for one topic's messages. Compares by identity.
#[derive(Clone)]
pub struct TopicListener(Arc<TopicListenerFn>);

impl TopicListener {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Arc<TopicListenerFn> = Arc::new(
            move |message| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(message)) },
        );
        Self(handler)
    }

    pub async fn call(&self, message: Arc<InboundMessage>) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

impl PartialEq for TopicListener {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl Eq for TopicListener {}

impl std::fmt::Debug for TopicListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TopicListener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Forwards every inbound object to a dispatch engine as an [`Event`].
impl From<Publisher> for TopicListener {
    fn from(publisher: Publisher) -> Self {
        TopicListener::new(move |message: Arc<InboundMessage>| {
            let result = Event::from_value(message.payload.clone())
                .map_err(anyhow::Error::from)
                .and_then(|event| publisher.publish(event).map_err(anyhow::Error::from));
            futures_util::future::ready(result)
        })
    }
}

struct TopicEntry {
    header: Map<String, Value>,
    body: Map<String, Value>,
    listeners: Vec<TopicListener>,
}

/// One open link. Replaced wholesale on reconnect.
struct Link {
    generation: u64,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    source: tokio::sync::Mutex<Box<dyn FrameSource>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Link {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.sink.lock().await.send_text(text).await
    }

    /// Closes the write half and gives the limiter slot back.
    async fn close(&self) -> Result<(), TransportError> {
        let result = self.sink.lock().await.close().await;
        self.permit.lock().take();
        result
    }
}

struct Inner {
    name: String,
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    limiter: ConnectionLimiter,
    tokens: Arc<dyn TokenProvider>,
    extractor: TopicExtractor,
    link: RwLock<Option<Arc<Link>>>,
    generation: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    backoff: Mutex<Backoff>,
    pacer: Mutex<ReconnectPacer>,
    topics: Mutex<BTreeMap<String, TopicEntry>>,
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    receive: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    handlers: TaskTracker,
}

/// Authenticated, self-healing subscription stream.
pub struct StreamConnection {
    inner: Arc<Inner>,
}

/// Builder for [`StreamConnection`].
pub struct StreamConnectionBuilder {
    name: String,
    config: StreamConfig,
    tokens: Arc<dyn TokenProvider>,
    extractor: TopicExtractor,
    connector: Option<Arc<dyn Connector>>,
    limiter: Option<ConnectionLimiter>,
}

impl StreamConnectionBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Shares a connection cap with other streams.
    pub fn limiter(mut self, limiter: ConnectionLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> StreamConnection {
        let config = self.config;

        StreamConnection {
            inner: Arc::new(Inner {
                name: self.name,
                connector: self.connector.unwrap_or_else(|| Arc::new(TungsteniteConnector)),
                limiter: self.limiter.unwrap_or_default(),
                tokens: self.tokens,
                extractor: self.extractor,
                link: RwLock::new(None),
                generation: watch::channel(0).0,
                state: watch::channel(ConnectionState::Disconnected).0,
                backoff: Mutex::new(Backoff::new(
                    config.initial_delay,
                    config.max_delay,
                    config.max_retries,
                )),
                pacer: Mutex::new(ReconnectPacer::new(
                    config.reconnect_delay,
                    config.max_reconnect_delay,
                )),
                topics: Mutex::new(BTreeMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                receive: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                handlers: TaskTracker::new(),
                config,
            }),
        }
    }
}

impl StreamConnection {
    /// Creates a stream over WebSocket with no connection cap.
    pub fn new(
        name: impl Into<String>,
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        extractor: TopicExtractor,
    ) -> Self {
        Self::builder(name, config, tokens, extractor).build()
    }

    pub fn builder(
        name: impl Into<String>,
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        extractor: TopicExtractor,
    ) -> StreamConnectionBuilder {
        StreamConnectionBuilder {
            name: name.into(),
            config,
            tokens,
            extractor,
            connector: None,
            limiter: None,
        }
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Topics with at least one listener, in resubscription order.
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.lock().keys().cloned().collect()
    }

    /// Consecutive failed connect attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.inner.backoff.lock().retry_count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_link().is_some()
    }

    /// Establishes a link, retrying refusals with exponential backoff.
    pub async fn connect(&self) -> Result<(), WebSocketError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.connect_locked().await.map(|_| ())
    }

    /// Sends `{header: {token, ..header}, body}`. Caller header keys win.
    ///
    /// With `allow_reconnect`, a write that fails because the peer closed the
    /// link triggers a reconnect and one more write on the new link.
    pub async fn send(
        &self,
        header: Option<Map<String, Value>>,
        body: Option<Map<String, Value>>,
        allow_reconnect: bool,
    ) -> Result<(), WebSocketError> {
        self.inner.send(header, body, allow_reconnect).await
    }

    /// Registers `listener` for `topic` and sends the subscribe request.
    ///
    /// The request goes out on every call. The first header/body recorded for
    /// a topic is the one used to resubscribe.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        listener: TopicListener,
        header: Map<String, Value>,
        body: Map<String, Value>,
    ) -> Result<(), WebSocketError> {
        let topic = topic.into();
        self.inner.closed.store(false, Ordering::SeqCst);

        self.inner.ensure_link().await?;
        self.inner.ensure_receive_loop();

        {
            let mut topics = self.inner.topics.lock();
            let entry = topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
                header: header.clone(),
                body: body.clone(),
                listeners: Vec::new(),
            });
            if !entry.listeners.contains(&listener) {
                entry.listeners.push(listener);
            }
        }

        info!("[{}] Subscribing to '{}'", self.inner.name, topic);
        self.inner.send(Some(header), Some(body), true).await
    }

    /// Removes `listener` from `topic`. When the topic has no listener left it
    /// is dropped and the unsubscribe notification is sent.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        listener: &TopicListener,
        header: Option<Map<String, Value>>,
        body: Option<Map<String, Value>>,
    ) -> Result<(), WebSocketError> {
        let emptied = {
            let mut topics = self.inner.topics.lock();
            let Some(entry) = topics.get_mut(topic) else {
                warn!("[{}] Unsubscribe from unknown topic '{}'", self.inner.name, topic);
                return Ok(());
            };
            entry.listeners.retain(|l| l != listener);
            let emptied = entry.listeners.is_empty();
            if emptied {
                topics.remove(topic);
            }
            emptied
        };

        if !emptied {
            return Ok(());
        }

        info!("[{}] Unsubscribing from '{}'", self.inner.name, topic);
        self.inner.send(header, body, true).await
    }

    /// Re-sends every live topic's stored subscribe request. Failures are
    /// logged per topic.
    pub async fn resubscribe(&self) {
        for (topic, header, body) in self.inner.topic_requests() {
            if let Err(e) = self.inner.send(Some(header), Some(body), false).await {
                warn!("[{}] Resubscribe to '{}' failed: {}", self.inner.name, topic, e);
            }
        }
    }

    /// Replaces the current link and resubscribes. No-op after [`close`](Self::close).
    pub async fn reconnect(&self) {
        let observed = self.inner.current_generation();
        self.inner.reconnect_from(observed).await;
    }

    /// Forces a token refresh, then resubscribes with the new token.
    pub async fn refresh_and_resubscribe(&self) -> Result<(), WebSocketError> {
        self.inner.tokens.access_token(true).await?;
        self.resubscribe().await;
        Ok(())
    }

    /// Drops all topics, stops the receive loop and closes the link.
    pub async fn close(&self) {
        let inner = &self.inner;
        info!("[{}] Closing stream", inner.name);

        inner.closed.store(true, Ordering::SeqCst);
        inner.set_state(ConnectionState::Closing);
        inner.topics.lock().clear();

        let cancel = std::mem::replace(&mut *inner.cancel.lock(), CancellationToken::new());
        cancel.cancel();

        let receive = inner.receive.lock().take();
        if let Some(handle) = receive {
            if let Err(e) = handle.await {
                error!("[{}] Receive loop ended abnormally: {}", inner.name, e);
            }
        }

        let link = inner.link.write().take();
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                debug!("[{}] Error closing link: {}", inner.name, e);
            }
        }

        inner.set_state(ConnectionState::Disconnected);
        info!("[{}] Stream closed", inner.name);
    }

    /// Waits for running topic listeners to finish.
    pub async fn drain(&self) {
        self.inner.handlers.close();
        self.inner.handlers.wait().await;
        self.inner.handlers.reopen();
    }
}

impl Inner {
    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().clone()
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] State {:?} -> {:?}", self.name, previous, state);
        }
    }

    fn topic_requests(&self) -> Vec<(String, Map<String, Value>, Map<String, Value>)> {
        self.topics
            .lock()
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.header.clone(), entry.body.clone()))
            .collect()
    }

    /// Connect loop. Caller holds `connect_lock`.
    async fn connect_locked(&self) -> Result<Arc<Link>, WebSocketError> {
        if self.link.read().is_some() {
            return Err(WebSocketError::AlreadyConnected);
        }

        let permit = self
            .limiter
            .try_acquire()
            .ok_or(WebSocketError::TooManyConnections {
                limit: self.limiter.limit(),
            })?;

        self.set_state(ConnectionState::Connecting);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.backoff.lock().reset();
                self.set_state(ConnectionState::Disconnected);
                return Err(WebSocketError::Closed);
            }

            info!(
                "[{}] Connecting to {} (retry {})",
                self.name,
                self.config.url,
                self.backoff.lock().retry_count()
            );

            match self.connector.connect(&self.config.url).await {
                Ok((sink, source)) => {
                    self.backoff.lock().reset();
                    self.pacer.lock().connected(Instant::now());

                    let generation = self.current_generation() + 1;
                    let link = Arc::new(Link {
                        generation,
                        sink: tokio::sync::Mutex::new(sink),
                        source: tokio::sync::Mutex::new(source),
                        permit: Mutex::new(Some(permit)),
                    });

                    // `close()` sets the flag before it takes the link, so
                    // checking under the write lock cannot miss it.
                    let installed = {
                        let mut slot = self.link.write();
                        let closed = self.closed.load(Ordering::SeqCst);
                        if !closed {
                            *slot = Some(Arc::clone(&link));
                        }
                        !closed
                    };
                    if !installed {
                        info!("[{}] Stream closed while connecting, dropping link", self.name);
                        if let Err(e) = link.close().await {
                            debug!("[{}] Error closing dropped link: {}", self.name, e);
                        }
                        self.set_state(ConnectionState::Disconnected);
                        return Err(WebSocketError::Closed);
                    }

                    self.generation.send_replace(generation);
                    self.set_state(ConnectionState::Connected);

                    info!("[{}] Connected (link #{})", self.name, generation);
                    return Ok(link);
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.backoff.lock().record_failure();
                    match delay {
                        Some(delay) => {
                            warn!(
                                "[{}] Connect refused ({}), retrying in {}s",
                                self.name,
                                e,
                                delay.as_secs()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            let attempts = {
                                let mut backoff = self.backoff.lock();
                                let attempts = backoff.retry_count();
                                backoff.reset();
                                attempts
                            };
                            self.set_state(ConnectionState::Disconnected);
                            error!("[{}] Giving up after {} attempt(s)", self.name, attempts);
                            return Err(WebSocketError::ConnectExhausted { attempts });
                        }
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    error!("[{}] Connection failed: {}", self.name, e);
                    return Err(WebSocketError::ConnectFailed(e));
                }
            }
        }
    }

    async fn ensure_link(&self) -> Result<Arc<Link>, WebSocketError> {
        if let Some(link) = self.current_link() {
            return Ok(link);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(link) = self.current_link() {
            return Ok(link);
        }

        warn!("[{}] Not connected, connecting first", self.name);
        self.connect_locked().await
    }

    async fn encode(
        &self,
        header: Option<Map<String, Value>>,
        body: Option<Map<String, Value>>,
    ) -> Result<String, WebSocketError> {
        let token = self.tokens.access_token(false).await?;

        let mut merged = Map::new();
        merged.insert("token".to_string(), Value::String(token));
        merged.extend(header.unwrap_or_default());

        Ok(serde_json::to_string(&json!({
            "header": merged,
            "body": body.unwrap_or_default(),
        }))?)
    }

    async fn send(
        &self,
        header: Option<Map<String, Value>>,
        body: Option<Map<String, Value>>,
        allow_reconnect: bool,
    ) -> Result<(), WebSocketError> {
        let frame = self.encode(header, body).await?;
        let link = self.ensure_link().await?;

        match link.send(frame.clone()).await {
            Ok(()) => {
                trace!("[{}] Sent {}", self.name, frame);
                Ok(())
            }
            Err(e) if e.is_closed() && allow_reconnect => {
                warn!("[{}] Send hit a closed link ({}), reconnecting", self.name, e);
                self.reconnect_from(link.generation).await;

                let link = self.current_link().ok_or(WebSocketError::NotConnected)?;
                link.send(frame).await.map_err(WebSocketError::SendFailed)
            }
            Err(e) => Err(WebSocketError::SendFailed(e)),
        }
    }

    /// Reconnects unless the link of generation `observed` was already
    /// replaced or the stream was closed.
    async fn reconnect_from(&self, observed: u64) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("[{}] Stream closed, not reconnecting", self.name);
            return;
        }

        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.current_generation() != observed {
            debug!("[{}] Link #{} already replaced", self.name, observed);
            return;
        }

        self.set_state(ConnectionState::Reconnecting);

        let stale = self.link.write().take();
        if let Some(link) = stale {
            if let Err(e) = link.close().await {
                debug!("[{}] Error closing stale link: {}", self.name, e);
            }
        }

        let wait = self.pacer.lock().plan(Instant::now());
        if !wait.is_zero() {
            info!(
                "[{}] Last connect too recent, reconnecting in {}ms",
                self.name,
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;

            if self.closed.load(Ordering::SeqCst) {
                debug!("[{}] Stream closed during reconnect pause", self.name);
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        }

        match self.connect_locked().await {
            Ok(link) => {
                self.resubscribe_on(&link).await;
                info!("[{}] Reconnection successful", self.name);
            }
            Err(WebSocketError::Closed) => {
                debug!("[{}] Stream closed, reconnect abandoned", self.name);
            }
            Err(e) => {
                error!("[{}] Reconnection failed: {}", self.name, e);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Resubscribes directly on `link`. Used while `connect_lock` is held.
    async fn resubscribe_on(&self, link: &Link) {
        for (topic, header, body) in self.topic_requests() {
            let result = match self.encode(Some(header), Some(body)).await {
                Ok(frame) => link.send(frame).await.map_err(WebSocketError::SendFailed),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("[{}] Resubscribed to '{}'", self.name, topic),
                Err(e) => warn!("[{}] Resubscribe to '{}' failed: {}", self.name, topic, e),
            }
        }
    }

    fn ensure_receive_loop(self: &Arc<Self>) {
        let mut slot = self.receive.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let cancel = self.cancel.lock().clone();
        *slot = Some(tokio::spawn(Arc::clone(self).receive_loop(cancel)));
    }

    async fn receive_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("[{}] Receive loop started", self.name);
        let mut generations = self.generation.subscribe();

        loop {
            let Some(link) = self.current_link() else {
                let observed = self.current_generation();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.reconnect_from(observed) => {}
                }

                if self.current_link().is_none() && !self.closed.load(Ordering::SeqCst) {
                    let pause = self.pacer.lock().delay();
                    warn!(
                        "[{}] Still disconnected, next attempt in {}s",
                        self.name,
                        pause.as_secs()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                continue;
            };

            if *generations.borrow_and_update() != link.generation {
                continue;
            }

            let next = {
                let mut source = link.source.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = generations.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!("[{}] Link replaced, switching", self.name);
                        continue;
                    }
                    next = source.next_text() => next,
                }
            };

            match next {
                Ok(text) => self.route(text),
                Err(TransportError::Decode(reason)) => {
                    warn!("[{}] Undecodable frame skipped: {}", self.name, reason);
                }
                Err(e) if e.is_closed() => {
                    warn!("[{}] Connection lost ({}), reconnecting", self.name, e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.reconnect_from(link.generation) => {}
                    }
                }
                Err(e) => {
                    error!("[{}] Receive failed: {}", self.name, e);
                    break;
                }
            }
        }

        info!("[{}] Receive loop stopped", self.name);
    }

    fn route(&self, text: String) {
        let payload: Value = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] Undecodable message skipped: {}", self.name, e);
                return;
            }
        };

        let Some(topic) = (self.extractor)(&payload) else {
            debug!("[{}] Message without topic skipped", self.name);
            return;
        };

        let listeners = match self.topics.lock().get(&topic) {
            Some(entry) => entry.listeners.clone(),
            None => {
                trace!("[{}] No listener for topic '{}'", self.name, topic);
                return;
            }
        };

        let message = Arc::new(InboundMessage {
            topic,
            payload,
            received_at: Utc::now(),
        });

        for listener in listeners {
            let message = Arc::clone(&message);
            let name = self.name.clone();

            self.handlers.spawn(async move {
                let topic = message.topic.clone();
                match AssertUnwindSafe(listener.call(message)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("[{}] Listener for '{}' failed: {:#}", name, topic, e),
                    Err(_) => error!("[{}] Listener for '{}' panicked", name, topic),
                }
            });
        }
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("name", &self.inner.name)
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("topics", &self.inner.topics.lock().len())
            .finish()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::auth::StaticToken;
    use crate::observe::{DispatchEngine, Listener};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};

    type Feed = mpsc::UnboundedSender<Result<String, TransportError>>;

    /// Shared view of everything the fake venue saw.
    #[derive(Default)]
    struct Wire {
        sent: Mutex<Vec<Value>>,
        feed: Mutex<Option<Feed>>,
        refusals: Mutex<usize>,
        failing_sends: Mutex<usize>,
        attempts: AtomicUsize,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl Wire {
        fn push(&self, message: Value) {
            self.push_raw(message.to_string());
        }

        fn push_raw(&self, text: String) {
            if let Some(feed) = self.feed.lock().as_ref() {
                feed.send(Ok(text)).unwrap();
            }
        }

        fn push_error(&self, error: TransportError) {
            if let Some(feed) = self.feed.lock().as_ref() {
                feed.send(Err(error)).unwrap();
            }
        }

        fn drop_peer(&self) {
            if let Some(feed) = self.feed.lock().take() {
                feed.send(Err(TransportError::Closed(Some("bye".into())))).unwrap();
            }
        }

        fn sent(&self) -> Vec<Value> {
            self.sent.lock().clone()
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    struct FakeConnector(Arc<Wire>);

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
            self.0.attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut refusals = self.0.refusals.lock();
                if *refusals > 0 {
                    *refusals -= 1;
                    return Err(TransportError::Refused("busy".into()));
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.0.feed.lock() = Some(tx);
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok((Box::new(FakeSink(Arc::clone(&self.0))), Box::new(FakeSource(rx))))
        }
    }

    /// Holds every connect attempt until the gate opens.
    struct GatedConnector {
        gate: Arc<Notify>,
        inner: FakeConnector,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(
            &self,
            url: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
            self.gate.notified().await;
            self.inner.connect(url).await
        }
    }

    struct FakeSink(Arc<Wire>);

    #[async_trait]
    impl FrameSink for FakeSink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            {
                let mut failing = self.0.failing_sends.lock();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(TransportError::Closed(None));
                }
            }
            self.0.sent.lock().push(serde_json::from_str(&text).unwrap());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeSource(mpsc::UnboundedReceiver<Result<String, TransportError>>);

    #[async_trait]
    impl FrameSource for FakeSource {
        async fn next_text(&mut self) -> Result<String, TransportError> {
            self.0.recv().await.unwrap_or(Err(TransportError::Closed(None)))
        }
    }

    fn stream_with(wire: &Arc<Wire>, config: StreamConfig, limiter: ConnectionLimiter) -> StreamConnection {
        StreamConnection::builder(
            "test",
            config,
            Arc::new(StaticToken("tok".to_string())),
            pointer_extractor("/topic"),
        )
        .connector(Arc::new(FakeConnector(Arc::clone(wire))))
        .limiter(limiter)
        .build()
    }

    fn stream(wire: &Arc<Wire>) -> StreamConnection {
        stream_with(wire, StreamConfig::new("ws://venue"), ConnectionLimiter::unlimited())
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn recorder() -> (TopicListener, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = TopicListener::new(move |message: Arc<InboundMessage>| {
            let tx = tx.clone();
            async move {
                tx.send(message.payload.clone()).ok();
                Ok(())
            }
        });
        (listener, rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_connection_state_initial() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.topics().is_empty());
    }

    #[test]
    fn test_pointer_extractor() {
        let extract = pointer_extractor("/header/tr_cd");
        assert_eq!(extract(&json!({"header": {"tr_cd": "S3_"}})), Some("S3_".to_string()));
        assert_eq!(extract(&json!({"header": {"tr_cd": 7}})), Some("7".to_string()));
        assert_eq!(extract(&json!({"header": {}})), None);
        assert_eq!(extract(&json!({"header": {"tr_cd": null}})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_backoff_then_success() {
        let wire = Arc::new(Wire::default());
        *wire.refusals.lock() = 3;
        let mut config = StreamConfig::new("ws://venue");
        config.max_retries = None;
        let conn = stream_with(&wire, config, ConnectionLimiter::unlimited());

        let start = Instant::now();
        conn.connect().await.unwrap();

        assert_eq!(start.elapsed().as_secs(), 2 + 4 + 8);
        assert_eq!(wire.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(conn.retry_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausted() {
        let wire = Arc::new(Wire::default());
        *wire.refusals.lock() = 100;
        let mut config = StreamConfig::new("ws://venue");
        config.max_retries = Some(3);
        let limiter = ConnectionLimiter::new(1);
        let conn = stream_with(&wire, config, limiter.clone());

        let start = Instant::now();
        let result = conn.connect().await;

        assert!(matches!(result, Err(WebSocketError::ConnectExhausted { attempts: 3 })));
        assert_eq!(start.elapsed().as_secs(), 2 + 4);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.retry_count(), 0);
        assert_eq!(limiter.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_guards() {
        let wire = Arc::new(Wire::default());
        let limiter = ConnectionLimiter::new(1);
        let first = stream_with(&wire, StreamConfig::new("ws://venue"), limiter.clone());
        let second = stream_with(&wire, StreamConfig::new("ws://venue"), limiter.clone());

        first.connect().await.unwrap();
        assert!(matches!(first.connect().await, Err(WebSocketError::AlreadyConnected)));
        assert!(matches!(
            second.connect().await,
            Err(WebSocketError::TooManyConnections { limit: 1 })
        ));

        first.close().await;
        assert_eq!(limiter.open_connections(), 0);
        second.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_injects_token_and_merges_header() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);

        conn.send(Some(map(json!({"tr_type": "3"}))), Some(map(json!({"tr_key": "AAPL"}))), true)
            .await
            .unwrap();
        conn.send(Some(map(json!({"token": "mine"}))), None, true).await.unwrap();
        conn.send(None, None, true).await.unwrap();

        assert_eq!(wire.connects(), 1);
        assert_eq!(
            wire.sent(),
            vec![
                json!({"header": {"token": "tok", "tr_type": "3"}, "body": {"tr_key": "AAPL"}}),
                json!({"header": {"token": "mine"}, "body": {}}),
                json!({"header": {"token": "tok"}, "body": {}}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reconnects_on_closed_link() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        conn.connect().await.unwrap();

        *wire.failing_sends.lock() = 1;
        conn.send(None, Some(map(json!({"n": 1}))), true).await.unwrap();

        assert_eq!(wire.connects(), 2);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);
        assert_eq!(wire.sent(), vec![json!({"header": {"token": "tok"}, "body": {"n": 1}})]);

        *wire.failing_sends.lock() = 1;
        let result = conn.send(None, None, false).await;
        assert!(matches!(result, Err(WebSocketError::SendFailed(_))));
        assert_eq!(wire.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_dedups_listener_but_always_sends() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let (listener, mut rx) = recorder();

        let header = map(json!({"tr_type": "3"}));
        conn.subscribe("quotes", listener.clone(), header.clone(), map(json!({"tr_key": "AAPL"})))
            .await
            .unwrap();
        conn.subscribe("quotes", listener.clone(), header, map(json!({"tr_key": "MSFT"})))
            .await
            .unwrap();

        assert_eq!(wire.sent().len(), 2);
        assert_eq!(conn.topics(), vec!["quotes".to_string()]);

        wire.push(json!({"topic": "quotes", "px": 1}));
        assert_eq!(rx.recv().await.unwrap(), json!({"topic": "quotes", "px": 1}));
        conn.drain().await;
        assert!(rx.try_recv().is_err());

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_sends_when_topic_empties() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let (a, _rx_a) = recorder();
        let (b, _rx_b) = recorder();

        conn.subscribe("quotes", a.clone(), Map::new(), Map::new()).await.unwrap();
        conn.subscribe("quotes", b.clone(), Map::new(), Map::new()).await.unwrap();
        assert_eq!(wire.sent().len(), 2);

        conn.unsubscribe("quotes", &a, None, None).await.unwrap();
        assert_eq!(wire.sent().len(), 2);
        assert_eq!(conn.topics(), vec!["quotes".to_string()]);

        conn.unsubscribe("quotes", &b, None, None).await.unwrap();
        assert!(conn.topics().is_empty());
        assert_eq!(
            wire.sent().last().unwrap(),
            &json!({"header": {"token": "tok"}, "body": {}})
        );

        conn.unsubscribe("quotes", &b, None, None).await.unwrap();
        assert_eq!(wire.sent().len(), 3);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_reconnects_and_resubscribes_all_topics() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let (quotes, mut quotes_rx) = recorder();
        let (trades, _trades_rx) = recorder();

        conn.subscribe(
            "quotes",
            quotes,
            map(json!({"tr_type": "3"})),
            map(json!({"tr_cd": "S3_", "tr_key": "AAPL"})),
        )
        .await
        .unwrap();
        conn.subscribe(
            "trades",
            trades,
            map(json!({"tr_type": "3"})),
            map(json!({"tr_cd": "K3_", "tr_key": "MSFT"})),
        )
        .await
        .unwrap();
        wire.sent.lock().clear();

        tokio::time::sleep(Duration::from_secs(5)).await;
        wire.drop_peer();

        wait_until(|| wire.sent().len() >= 2).await;
        assert_eq!(wire.connects(), 2);
        assert_eq!(
            wire.sent(),
            vec![
                json!({"header": {"token": "tok", "tr_type": "3"}, "body": {"tr_cd": "S3_", "tr_key": "AAPL"}}),
                json!({"header": {"token": "tok", "tr_type": "3"}, "body": {"tr_cd": "K3_", "tr_key": "MSFT"}}),
            ]
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.topics(), vec!["quotes".to_string(), "trades".to_string()]);

        wire.push(json!({"topic": "quotes", "px": 2}));
        assert_eq!(quotes_rx.recv().await.unwrap()["px"], 2);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_everything() {
        let wire = Arc::new(Wire::default());
        let limiter = ConnectionLimiter::new(4);
        let conn = stream_with(&wire, StreamConfig::new("ws://venue"), limiter.clone());
        let (listener, _rx) = recorder();
        conn.subscribe("quotes", listener, Map::new(), Map::new()).await.unwrap();

        let mut states = conn.state_changes();
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(states.has_changed().unwrap());
        assert!(conn.topics().is_empty());
        assert!(!conn.is_connected());
        assert_eq!(limiter.open_connections(), 0);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);

        conn.reconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(wire.connects(), 1);
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_reconnect_pause_stays_closed() {
        let wire = Arc::new(Wire::default());
        let limiter = ConnectionLimiter::new(4);
        let conn = Arc::new(stream_with(&wire, StreamConfig::new("ws://venue"), limiter.clone()));
        conn.connect().await.unwrap();

        *wire.failing_sends.lock() = 1;
        let sender = Arc::clone(&conn);
        let pending = tokio::spawn(async move { sender.send(None, None, true).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        conn.close().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(WebSocketError::NotConnected)));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(wire.connects(), 1);
        assert_eq!(limiter.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_while_connecting_drops_new_link() {
        let wire = Arc::new(Wire::default());
        let gate = Arc::new(Notify::new());
        let limiter = ConnectionLimiter::new(1);
        let conn = Arc::new(
            StreamConnection::builder(
                "test",
                StreamConfig::new("ws://venue"),
                Arc::new(StaticToken("tok".to_string())),
                pointer_extractor("/topic"),
            )
            .connector(Arc::new(GatedConnector {
                gate: Arc::clone(&gate),
                inner: FakeConnector(Arc::clone(&wire)),
            }))
            .limiter(limiter.clone())
            .build(),
        );

        let connecting = Arc::clone(&conn);
        let pending = tokio::spawn(async move { connecting.connect().await });
        wait_until(|| conn.state() == ConnectionState::Connecting).await;

        conn.close().await;
        gate.notify_one();

        assert!(matches!(pending.await.unwrap(), Err(WebSocketError::Closed)));
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(wire.connects(), 1);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_keeps_receive_loop_alive() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let (listener, mut rx) = recorder();
        conn.subscribe("quotes", listener, Map::new(), Map::new()).await.unwrap();

        wire.push_error(TransportError::Decode("binary frame is not UTF-8".into()));
        wire.push(json!({"topic": "quotes", "px": 3}));

        assert_eq!(rx.recv().await.unwrap()["px"], 3);
        assert_eq!(wire.connects(), 1);
        assert!(conn.is_connected());

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_isolates_listeners_and_skips_bad_messages() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let failing = TopicListener::new(|_| async { Err(anyhow::anyhow!("boom")) });
        let panicking = TopicListener::new(|message: Arc<InboundMessage>| async move {
            if message.topic == "quotes" {
                panic!("listener panic");
            }
            Ok(())
        });
        let (quotes, mut quotes_rx) = recorder();
        let (trades, mut trades_rx) = recorder();

        for listener in [failing, panicking, quotes] {
            conn.subscribe("quotes", listener, Map::new(), Map::new()).await.unwrap();
        }
        conn.subscribe("trades", trades, Map::new(), Map::new()).await.unwrap();

        wire.push_raw("not json".to_string());
        wire.push(json!({"no": "topic"}));
        wire.push(json!({"topic": "unknown"}));
        wire.push(json!({"topic": "quotes", "px": 1}));
        wire.push(json!({"topic": "trades", "qty": 5}));
        wire.push(json!({"topic": "quotes", "px": 2}));

        assert_eq!(quotes_rx.recv().await.unwrap()["px"], 1);
        assert_eq!(quotes_rx.recv().await.unwrap()["px"], 2);
        assert_eq!(trades_rx.recv().await.unwrap()["qty"], 5);
        assert_eq!(wire.connects(), 1);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_bridge_feeds_dispatch_engine() {
        let wire = Arc::new(Wire::default());
        let conn = stream(&wire);
        let engine = Arc::new(DispatchEngine::new("bridge"));
        let handle = engine.spawn();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pattern = Event::from_value(json!({"topic": "quotes", "symbol": "AAPL"})).unwrap();
        engine
            .subscribe(
                Arc::new(pattern),
                Listener::callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        tx.send(event).ok();
                        Ok(())
                    }
                }),
            )
            .unwrap();

        conn.subscribe("quotes", engine.publisher().into(), Map::new(), Map::new())
            .await
            .unwrap();

        wire.push(json!({"topic": "quotes", "symbol": "MSFT", "px": 1}));
        wire.push(json!({"topic": "quotes", "symbol": "AAPL", "px": 2}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.get("px"), Some(&json!(2)));

        conn.close().await;
        engine.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_and_resubscribe_forces_new_token() {
        struct Rotating(AtomicUsize);

        #[async_trait]
        impl TokenProvider for Rotating {
            async fn access_token(&self, force_refresh: bool) -> Result<String, AuthError> {
                if force_refresh {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
                Ok(format!("tok-{}", self.0.load(Ordering::SeqCst)))
            }
        }

        let wire = Arc::new(Wire::default());
        let conn = StreamConnection::builder(
            "test",
            StreamConfig::new("ws://venue"),
            Arc::new(Rotating(AtomicUsize::new(0))),
            pointer_extractor("/topic"),
        )
        .connector(Arc::new(FakeConnector(Arc::clone(&wire))))
        .build();

        let (listener, _rx) = recorder();
        conn.subscribe("quotes", listener, Map::new(), map(json!({"tr_key": "AAPL"})))
            .await
            .unwrap();
        conn.refresh_and_resubscribe().await.unwrap();

        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["header"]["token"], "tok-0");
        assert_eq!(sent[1], json!({"header": {"token": "tok-1"}, "body": {"tr_key": "AAPL"}}));

        conn.close().await;
    }
}
