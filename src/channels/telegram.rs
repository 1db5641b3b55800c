use super::{BaseChannel, Channel};
use crate::bus::{MessageBus, OutboundMessage};
use crate::config::TelegramConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram transport speaking the Bot API directly: a `getUpdates`
/// long-poll for ingress and `sendMessage`/`sendPhoto` for delivery.
pub struct TelegramChannel {
    base: BaseChannel,
    client: reqwest::Client,
    api_base: String,
    token: String,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, bus: Arc<MessageBus>) -> Self {
        Self::with_api_base(config, bus, "https://api.telegram.org")
    }

    pub fn with_api_base(config: TelegramConfig, bus: Arc<MessageBus>, api_base: &str) -> Self {
        Self {
            base: BaseChannel::new("telegram", bus, config.allowed_users),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 20))
                .build()
                .unwrap_or_default(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: config.bot_token,
            poll: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }
}

async fn poll_loop(
    base: BaseChannel,
    client: reqwest::Client,
    updates_url: String,
    cancel: CancellationToken,
) {
    let mut offset: i64 = 0;
    tracing::info!("telegram channel listening for messages");

    loop {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"]
        });

        let request = client.post(&updates_url).json(&body);
        let response = tokio::select! {
            () = cancel.cancelled() => return,
            response = request.send() => response,
        };

        let data: Value = match response {
            Ok(resp) => match resp.json().await {
                Ok(data) => data,
                Err(error) => {
                    tracing::warn!(%error, "telegram parse error");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            },
            Err(error) => {
                tracing::warn!(%error, "telegram poll error");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        let Some(updates) = data.get("result").and_then(Value::as_array) else {
            continue;
        };
        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                offset = update_id + 1;
            }
            handle_update(&base, update).await;
        }
    }
}

async fn handle_update(base: &BaseChannel, update: &Value) {
    let Some(message) = update.get("message") else {
        return;
    };
    let Some(text) = message.get("text").and_then(Value::as_str) else {
        return;
    };

    let username = message
        .get("from")
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let user_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();

    if !base.is_any_allowed([username, user_id.as_str()]) {
        tracing::warn!(
            username,
            %user_id,
            "telegram: ignoring message from unauthorized user"
        );
        return;
    }

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();

    let metadata = HashMap::from([
        ("platform".to_string(), "telegram".to_string()),
        ("username".to_string(), username.to_string()),
    ]);
    base.handle_message(user_id, chat_id, text, Vec::new(), metadata)
        .await;
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        anyhow::ensure!(!self.token.is_empty(), "telegram bot token is empty");

        let handle = tokio::spawn(poll_loop(
            self.base.clone(),
            self.client.clone(),
            self.api_url("getUpdates"),
            cancel,
        ));
        *self
            .poll
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        self.base.set_running(true);
        tracing::info!("telegram channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self
            .poll
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": msg.chat_id,
            "text": msg.content,
            "parse_mode": "Markdown"
        });
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("telegram sendMessage failed ({status}): {detail}");
        }

        for url in &msg.media_urls {
            let body = serde_json::json!({"chat_id": msg.chat_id, "photo": url});
            let response = self
                .client
                .post(self.api_url("sendPhoto"))
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                tracing::warn!(status = %response.status(), %url, "telegram sendPhoto failed");
            }
        }

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}
