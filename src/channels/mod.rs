mod telegram;
mod webhook;

pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Channels that originate inside the process. They are never reply
/// destinations for asynchronous alerts and never overwrite
/// `last_channel`.
pub const INTERNAL_CHANNELS: &[&str] = &["cron", "webhook"];

pub fn is_internal_channel(name: &str) -> bool {
    INTERNAL_CHANNELS.contains(&name)
}

/// Uniform lifecycle over heterogeneous transports. Each adapter owns
/// its ingress and publishes `InboundMessage`s to the bus; the outbound
/// pump hands it back every `OutboundMessage` whose channel matches.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name, also the routing key on the bus.
    fn name(&self) -> &str;

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;
}

/// Shared plumbing for adapters: the bus handle, an allow-list, and the
/// running flag. Allow-list enforcement is the adapter's responsibility;
/// an empty list means nobody is allowed.
#[derive(Clone)]
pub struct BaseChannel {
    name: &'static str,
    bus: Arc<MessageBus>,
    allow_list: Vec<String>,
    running: Arc<AtomicBool>,
}

impl BaseChannel {
    pub fn new(name: &'static str, bus: Arc<MessageBus>, allow_list: Vec<String>) -> Self {
        Self {
            name,
            bus,
            allow_list,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_any_allowed<'a>(&self, identities: impl IntoIterator<Item = &'a str>) -> bool {
        identities
            .into_iter()
            .any(|id| self.allow_list.iter().any(|allowed| allowed == id))
    }

    /// Build an inbound message for this channel and publish it.
    pub async fn handle_message(
        &self,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
        attachments: Vec<String>,
        metadata: HashMap<String, String>,
    ) {
        self.bus
            .publish_inbound(InboundMessage {
                channel: self.name.to_string(),
                sender_id: sender_id.into(),
                chat_id: chat_id.into(),
                content: content.into(),
                attachments,
                metadata,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_channels_are_recognized() {
        assert!(is_internal_channel("cron"));
        assert!(is_internal_channel("webhook"));
        assert!(!is_internal_channel("telegram"));
    }

    #[test]
    fn allow_list_matches_any_identity() {
        let bus = Arc::new(MessageBus::new());
        let base = BaseChannel::new("telegram", bus, vec!["alice".into(), "1234".into()]);

        assert!(base.is_any_allowed(["alice"]));
        assert!(base.is_any_allowed(["unknown", "1234"]));
        assert!(!base.is_any_allowed(["bob"]));
        assert!(!base.is_any_allowed([]));
    }

    #[tokio::test]
    async fn handle_message_publishes_with_the_channel_name() {
        let bus = Arc::new(MessageBus::new());
        let base = BaseChannel::new("telegram", Arc::clone(&bus), Vec::new());

        base.handle_message("7", "7", "hola", Vec::new(), HashMap::new())
            .await;

        let cancel = CancellationToken::new();
        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.content, "hola");
    }
}
