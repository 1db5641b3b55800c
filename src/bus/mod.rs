use crate::channels::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

const QUEUE_CAPACITY: usize = 100;
const PUBLISH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A message received from a transport, consumed exactly once by the agent.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub attachments: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// A message destined for the transport whose name matches `channel`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub media_urls: Vec<String>,
}

impl OutboundMessage {
    pub fn text(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media_urls: Vec::new(),
        }
    }
}

/// Bounded inbound/outbound queues plus a handler registry keyed by
/// channel name. Publishing waits at most ten seconds; on timeout the
/// message is dropped with an error log so producers never wedge.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    handlers: std::sync::RwLock<HashMap<String, Arc<dyn Channel>>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            handlers: std::sync::RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(channel = %msg.channel, "bus closed, inbound message dropped");
            return;
        }
        match self.inbound_tx.send_timeout(msg, PUBLISH_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg) | SendTimeoutError::Closed(msg)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    channel = %msg.channel,
                    sender_id = %msg.sender_id,
                    "inbound publish timed out, message dropped"
                );
            }
        }
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(channel = %msg.channel, "bus closed, outbound message dropped");
            return;
        }
        match self.outbound_tx.send_timeout(msg, PUBLISH_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(msg) | SendTimeoutError::Closed(msg)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "outbound publish timed out, message dropped"
                );
            }
        }
    }

    /// Block until an inbound message arrives or `cancel` fires.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            () = cancel.cancelled() => None,
        }
    }

    /// Block until an outbound message arrives or `cancel` fires.
    pub async fn consume_outbound(&self, cancel: &CancellationToken) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            () = cancel.cancelled() => None,
        }
    }

    pub fn register_handler(&self, channel: impl Into<String>, handler: Arc<dyn Channel>) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(channel.into(), handler);
    }

    pub fn handler(&self, channel: &str) -> Option<Arc<dyn Channel>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Discard everything queued in both directions. Called during
    /// graceful shutdown to release producers stuck in a bounded send.
    pub async fn drain(&self) {
        let mut inbound = self.inbound_rx.lock().await;
        while inbound.try_recv().is_ok() {}
        drop(inbound);

        let mut outbound = self.outbound_rx.lock().await;
        while outbound.try_recv().is_ok() {}
    }

    /// Drain both queues and refuse any further publishes.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain().await;
    }

    /// Messages dropped because of a full queue or a closed bus.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            sender_id: "42".into(),
            chat_id: "42".into(),
            content: content.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn publish_then_consume_is_fifo() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_inbound(inbound("first")).await;
        bus.publish_inbound(inbound("second")).await;

        let a = bus.consume_inbound(&cancel).await.unwrap();
        let b = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
    }

    #[tokio::test]
    async fn consume_returns_none_when_cancelled() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(bus.consume_inbound(&cancel).await.is_none());
        assert!(bus.consume_outbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn close_rejects_further_publishes() {
        let bus = MessageBus::new();
        bus.close().await;

        bus.publish_outbound(OutboundMessage::text("telegram", "42", "late"))
            .await;
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn drain_empties_queued_messages() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        bus.publish_outbound(OutboundMessage::text("telegram", "42", "queued"))
            .await;
        bus.drain().await;

        cancel.cancel();
        assert!(bus.consume_outbound(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_drops_after_timeout_when_queue_is_full() {
        let bus = Arc::new(MessageBus::new());
        for i in 0..100 {
            bus.publish_inbound(inbound(&format!("fill-{i}"))).await;
        }

        // Queue is at capacity with no consumer; the bounded wait expires
        // and the message is dropped instead of blocking forever.
        bus.publish_inbound(inbound("overflow")).await;
        assert_eq!(bus.dropped_count(), 1);
    }
}
