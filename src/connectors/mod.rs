//! Connectors to the venue.
//!
//! This module owns everything that talks to the outside: the token
//! lifecycle, the streaming connection and its transport, and the
//! request/response client. Inbound stream messages are handed to topic
//! listeners as raw JSON; turning them into events is the observe layer's job.

pub mod api_client;
pub mod auth;
pub mod backoff;
pub mod transport;
pub mod websocket;

pub use api_client::{gateway_token_rejection, ApiClient, ApiClientConfig, ApiError, TokenRejection};
pub use auth::{
    AuthError, AuthFailure, ClientCredentials, CredentialSource, HttpCredentialSource, StaticToken,
    Token, TokenConfig, TokenGrant, TokenLifecycle, TokenProvider,
};
pub use backoff::{Backoff, ReconnectPacer};
pub use transport::{
    ConnectionLimiter, Connector, FrameSink, FrameSource, TransportError, TungsteniteConnector,
};
pub use websocket::{
    pointer_extractor, ConnectionState, InboundMessage, StreamConfig, StreamConnection,
    StreamConnectionBuilder, TopicExtractor, TopicListener, WebSocketError,
};
