//! marketlink - real-time data core of a market-data client.
//!
//! This crate keeps authenticated, self-healing stream connections to a
//! venue and routes the structured events they carry to whoever is
//! interested, without consumers having to know the full shape of those
//! events.
//!
//! # Architecture
//!
//! - **Token lifecycle**: one bearer token per venue, refreshed on a timer,
//!   on near-expiry, and after an authorization failure
//! - **Stream connection**: connect with backoff, token-stamped frames,
//!   per-topic listeners, reconnect and resubscribe
//! - **Attribute index**: a trie over attribute chains, so a subscription
//!   can name only the attributes it cares about
//! - **Dispatch engine**: one FIFO queue, one matching loop, one tracked
//!   task per matched listener
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use marketlink::connectors::{pointer_extractor, StaticToken, StreamConfig, StreamConnection};
//! use marketlink::events::Event;
//! use marketlink::observe::{DispatchEngine, Listener};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(DispatchEngine::new("quotes"));
//!     let _loop = engine.spawn();
//!
//!     let pattern = Event::new().with("symbol", "AAPL");
//!     engine.subscribe(Arc::new(pattern), Listener::callback(|event| async move {
//!         println!("{}", event);
//!         Ok(())
//!     }))?;
//!
//!     let stream = StreamConnection::new(
//!         "venue",
//!         StreamConfig::new("wss://venue.example/websocket"),
//!         Arc::new(StaticToken("key".to_string())),
//!         pointer_extractor("/topic"),
//!     );
//!     let body = serde_json::Map::from_iter([("topic".to_string(), "quotes".into())]);
//!     stream
//!         .subscribe("quotes", engine.publisher().into(), serde_json::Map::new(), body)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod events;
pub mod observe;
pub mod utils;

// Re-export commonly used types
pub use config::{ClientConfig, ConfigError, SnapshotConfig};
pub use connectors::{StreamConnection, TokenLifecycle, TopicListener};
pub use events::{Event, EventPattern, PatternKey, Scalar};
pub use observe::{DispatchEngine, Listener, SubscriptionRegistry};
