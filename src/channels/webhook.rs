use super::{BaseChannel, Channel};
use crate::bus::{MessageBus, OutboundMessage};
use crate::config::WebhookConfig;
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const MAX_BODY_SIZE: usize = 65_536;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives external events via HTTP POST and routes them to the agent.
/// Replies are fire-and-forget: the agent's response goes to the last
/// active channel, not back over the webhook.
pub struct WebhookChannel {
    base: BaseChannel,
    config: WebhookConfig,
    cancel: Mutex<Option<CancellationToken>>,
    server: Mutex<Option<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    source: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Clone)]
struct WebhookState {
    base: BaseChannel,
    secret: Option<String>,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig, bus: Arc<MessageBus>) -> Self {
        // No allow-list: webhook auth is bearer-token based.
        let base = BaseChannel::new("webhook", bus, Vec::new());
        Self {
            base,
            config,
            cancel: Mutex::new(None),
            server: Mutex::new(None),
            bound_addr: Mutex::new(None),
        }
    }

    /// Address the HTTP server actually bound to (set after `start`).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self
            .bound_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn handle_inbound(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Result<Json<WebhookPayload>, JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(secret) = &state.secret {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let expected = format!("Bearer {secret}");
        if !auth.eq_ignore_ascii_case(&expected) {
            tracing::warn!("webhook: invalid or missing bearer token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Unauthorized"})),
            );
        }
    }

    let Json(payload) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::error!(error = %rejection, "webhook: failed to parse payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Bad request"})),
            );
        }
    };

    if payload.content.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "content is required"})),
        );
    }

    tracing::info!(
        source = %payload.source,
        event = %payload.event,
        preview = %truncate_with_ellipsis(&payload.content, 80),
        "webhook: received event"
    );

    // Answer immediately; the agent does its work asynchronously.
    let base = state.base.clone();
    tokio::spawn(async move { process_event(&base, payload).await });

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

async fn process_event(base: &BaseChannel, payload: WebhookPayload) {
    let content = format!(
        "[Webhook: {}/{}] {}",
        payload.source, payload.event, payload.content
    );
    let sender_id = format!("webhook:{}", payload.source);
    let chat_id = format!("webhook:{}:{}", payload.source, payload.event);

    let mut metadata = HashMap::from([
        ("platform".to_string(), "webhook".to_string()),
        ("source".to_string(), payload.source),
        ("event".to_string(), payload.event),
    ]);
    metadata.extend(payload.metadata);

    base.handle_message(sender_id, chat_id, content, Vec::new(), metadata)
        .await;
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let path = if self.config.path.is_empty() {
            "/webhook/inbound"
        } else {
            self.config.path.as_str()
        };

        let state = WebhookState {
            base: self.base.clone(),
            secret: self.config.secret.clone(),
        };
        let app = Router::new()
            .route(path, post(handle_inbound))
            .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .with_state(state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind webhook listener on {addr}"))?;
        let bound = listener.local_addr().context("webhook local addr")?;
        tracing::info!(addr = %bound, path, "webhook server listening");

        let child = cancel.child_token();
        let shutdown = child.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(error) = result {
                tracing::error!(%error, "webhook server error");
            }
        });

        *self.cancel.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(child);
        *self.server.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        *self
            .bound_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(bound);
        self.base.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }

        let handle = self
            .server
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("webhook server did not stop within the shutdown window");
            }
        }

        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        // Fire-and-forget channel: outbound traffic is logged only.
        tracing::debug!(
            chat_id = %msg.chat_id,
            content_len = msg.content.len(),
            "webhook outbound (logged only)"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}
