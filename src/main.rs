//! marketlink demo client.
//!
//! Authenticates against the venue, opens one stream, subscribes to the
//! configured topics and routes every inbound message through a dispatch
//! engine. Each topic gets a logging listener keyed on `{"topic": ...}`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use marketlink::config::ClientConfig;
use marketlink::connectors::{
    pointer_extractor, ApiClient, ConnectionLimiter, CredentialSource, HttpCredentialSource,
    StreamConnection, TokenLifecycle, TokenProvider,
};
use marketlink::events::Event;
use marketlink::observe::{DispatchEngine, Listener};
use marketlink::utils::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Note: No .env file found or error loading it: {}", e);
    }

    init_telemetry();

    let config = ClientConfig::from_env()?;
    info!("Streaming from {}", config.stream.url);

    let source: Arc<dyn CredentialSource> = Arc::new(HttpCredentialSource::new(
        config.token_url.clone(),
        config.credentials.clone(),
    ));
    let tokens = Arc::new(TokenLifecycle::with_config("token", source, config.token.clone()));
    tokens.start_background_refresh(config.token.refresh_period);

    if let Some(snapshot) = config.snapshot.clone() {
        let api = ApiClient::new("api", snapshot.api, Arc::clone(&tokens))?;
        match api.get(&snapshot.path).await {
            Ok(body) => info!("Snapshot from {}: {}", snapshot.path, body),
            Err(e) => warn!("Snapshot request to {} failed: {}", snapshot.path, e),
        }
    }

    let engine = Arc::new(DispatchEngine::new("dispatch"));
    let dispatch_loop = engine.spawn();

    for topic in &config.topics {
        let pattern = Event::new().with("topic", topic.as_str());
        let name = topic.clone();
        engine.subscribe(
            Arc::new(pattern),
            Listener::callback(move |event| {
                let name = name.clone();
                async move {
                    info!("[{}] {}", name, event);
                    Ok(())
                }
            }),
        )?;
    }

    let limiter = match config.max_connections {
        Some(limit) => ConnectionLimiter::new(limit),
        None => ConnectionLimiter::unlimited(),
    };
    let token_provider: Arc<dyn TokenProvider> = tokens.clone();
    let stream = StreamConnection::builder(
        "stream",
        config.stream.clone(),
        token_provider,
        pointer_extractor(config.topic_pointer.clone()),
    )
    .limiter(limiter)
    .build();

    if config.topics.is_empty() {
        warn!("No topics configured; set MARKETLINK_TOPICS to subscribe");
    }

    for topic in &config.topics {
        let mut body = Map::new();
        body.insert("topic".to_string(), Value::String(topic.clone()));

        if let Err(e) = stream
            .subscribe(
                topic.clone(),
                engine.publisher().into(),
                config.subscribe_header.clone(),
                body,
            )
            .await
        {
            error!("[{}] Subscribe failed: {}", topic, e);
        }
    }

    info!("Streaming {} topic(s). Press Ctrl+C to stop.", config.topics.len());
    shutdown_signal().await;

    stream.close().await;
    stream.drain().await;
    tokens.stop();
    engine.stop();
    match dispatch_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Dispatch loop failed: {}", e),
        Err(e) => error!("Dispatch loop panicked: {:?}", e),
    }
    engine.drain().await;

    info!("Shut down cleanly");
    Ok(())
}

/// Resolves on Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
