use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::channels::is_internal_channel;
use crate::providers::{LlmProvider, Message};
use crate::state::{StateManager, parse_last_channel};
use crate::telemetry::{FEATURE_CHAT, FEATURE_CRON, Tracker};
use crate::tools::{ToolRegistry, ToolResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const MAX_HISTORY_MESSAGES: usize = 40;

/// The reasoning core: pulls inbound messages, runs the LLM tool loop,
/// and publishes the reply. Replies to internal channels (cron,
/// webhook) are routed to the user's last active external transport.
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    bus: Arc<MessageBus>,
    state: Arc<StateManager>,
    tracker: Arc<Tracker>,
    model: String,
    system_prompt: String,
    max_tool_iterations: u32,
    history: Mutex<HashMap<String, Vec<Message>>>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        bus: Arc<MessageBus>,
        state: Arc<StateManager>,
        tracker: Arc<Tracker>,
        model: String,
        system_prompt: String,
        max_tool_iterations: u32,
    ) -> Self {
        Self {
            provider,
            registry,
            bus,
            state,
            tracker,
            model,
            system_prompt,
            max_tool_iterations: max_tool_iterations.max(1),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Consume inbound messages until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(model = %self.model, tools = self.registry.len(), "agent loop started");
        while let Some(msg) = self.bus.consume_inbound(&cancel).await {
            self.handle(msg).await;
        }
        tracing::info!("agent loop stopped");
    }

    pub async fn handle(&self, msg: InboundMessage) {
        let external = !is_internal_channel(&msg.channel);
        if external {
            let last = format!("{}:{}", msg.channel, msg.sender_id);
            if let Err(error) = self.state.set_last_channel(&last) {
                tracing::warn!(%error, "failed to persist last channel");
            }
        }

        self.registry.set_context(&msg.channel, &msg.chat_id);

        let feature = if msg.channel == "cron" {
            FEATURE_CRON
        } else {
            FEATURE_CHAT
        };
        let history_key = format!("{}:{}", msg.channel, msg.chat_id);

        let user_message = if msg.attachments.is_empty() {
            Message::user(&msg.content)
        } else {
            Message::user_with_images(&msg.content, &msg.attachments)
        };

        let mut messages = vec![Message::system(&self.system_prompt)];
        {
            let history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(past) = history.get(&history_key) {
                messages.extend(past.iter().cloned());
            }
        }
        messages.push(user_message.clone());

        let tools = self.registry.definitions();
        let mut media_urls = Vec::new();
        let mut reply = String::new();

        for iteration in 0..self.max_tool_iterations {
            let response = match self.provider.chat(&messages, &tools, &self.model).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(%error, channel = %msg.channel, "llm request failed");
                    reply = format!("Error processing your message: {error}");
                    break;
                }
            };

            if let Some(usage) = response.usage {
                self.tracker.record(
                    feature,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                );
            }

            if !response.has_tool_calls() {
                reply = response.content;
                break;
            }

            messages.push(Message::assistant(
                &response.content,
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                tracing::debug!(tool = %call.name, id = %call.id, "executing tool call");
                let result = self.registry.execute(&call.name, call.arguments).await;
                if let ToolResult::Media { urls, .. } = &result {
                    media_urls.extend(urls.iter().cloned());
                }
                let content = match &result {
                    ToolResult::Error { text } => format!("Error: {text}"),
                    other => other.text().to_string(),
                };
                messages.push(Message::tool_result(&call.id, content));
            }

            if iteration + 1 == self.max_tool_iterations {
                tracing::warn!(channel = %msg.channel, "tool iteration cap reached");
                reply = "I could not finish processing that within the tool call limit.".into();
            }
        }

        if reply.is_empty() && media_urls.is_empty() {
            return;
        }

        {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = history.entry(history_key).or_default();
            entry.push(user_message);
            entry.push(Message::assistant(&reply, Vec::new()));
            if entry.len() > MAX_HISTORY_MESSAGES {
                let excess = entry.len() - MAX_HISTORY_MESSAGES;
                entry.drain(..excess);
            }
        }

        let Some((channel, chat_id)) = self.reply_destination(&msg) else {
            tracing::warn!(
                channel = %msg.channel,
                "no reply destination for internal message, dropping response"
            );
            return;
        };

        self.bus
            .publish_outbound(OutboundMessage {
                channel,
                chat_id,
                content: reply,
                media_urls,
            })
            .await;
    }

    /// External messages are answered in place; internal ones chase the
    /// user's most recently active transport.
    fn reply_destination(&self, msg: &InboundMessage) -> Option<(String, String)> {
        if !is_internal_channel(&msg.channel) {
            return Some((msg.channel.clone(), msg.chat_id.clone()));
        }

        let last = self.state.last_channel()?;
        let (platform, user_id) = parse_last_channel(&last)?;
        if is_internal_channel(platform) {
            return None;
        }
        Some((platform.to_string(), user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmResponse, ToolCall, ToolDefinition, UsageInfo};
    use crate::tools::{Args, Tool};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct ScriptedProvider {
        responses: Mutex<Vec<LlmResponse>>,
        seen_messages: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                seen_messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _model: &str,
        ) -> anyhow::Result<LlmResponse> {
            self.seen_messages.lock().unwrap().push(messages.to_vec());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("provider exhausted")
            }
            Ok(responses.remove(0))
        }

        fn default_model(&self) -> &str {
            "scripted"
        }
    }

    struct PingTool;

    #[async_trait]
    impl Tool for PingTool {
        fn name(&self) -> &str {
            "ping"
        }

        fn description(&self) -> &str {
            "ping"
        }

        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Args) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::media("pong", vec!["https://e/pong.png".into()]))
        }
    }

    fn plain(content: &str, prompt: i64, completion: i64) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: "stop".into(),
            usage: Some(UsageInfo {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }),
        }
    }

    fn tool_call_response(id: &str, name: &str) -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: serde_json::Map::new(),
            }],
            finish_reason: "tool_calls".into(),
            usage: None,
        }
    }

    fn inbound(channel: &str, sender: &str, chat: &str, content: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender.into(),
            chat_id: chat.into(),
            content: content.into(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    struct Fixture {
        agent: Agent,
        bus: Arc<MessageBus>,
        state: Arc<StateManager>,
        tracker: Arc<Tracker>,
        provider: Arc<ScriptedProvider>,
        _tmp: TempDir,
    }

    fn fixture(responses: Vec<LlmResponse>, with_ping: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let bus = Arc::new(MessageBus::new());
        let state = Arc::new(StateManager::load(tmp.path()));
        let tracker = Arc::new(Tracker::load(tmp.path()));
        let provider = Arc::new(ScriptedProvider::new(responses));

        let mut registry = ToolRegistry::new();
        if with_ping {
            registry.register(Arc::new(PingTool));
        }

        let agent = Agent::new(
            provider.clone(),
            Arc::new(registry),
            Arc::clone(&bus),
            Arc::clone(&state),
            Arc::clone(&tracker),
            "scripted".into(),
            "You are a test assistant.".into(),
            5,
        );
        Fixture {
            agent,
            bus,
            state,
            tracker,
            provider,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn plain_reply_goes_back_to_the_origin() {
        let fx = fixture(vec![plain("hola!", 10, 5)], false);

        fx.agent
            .handle(inbound("telegram", "42", "42", "hola"))
            .await;

        let cancel = CancellationToken::new();
        let reply = fx.bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "42");
        assert_eq!(reply.content, "hola!");

        assert_eq!(fx.state.last_channel().as_deref(), Some("telegram:42"));
        let today = fx.tracker.get_today().unwrap();
        assert_eq!(today.features["chat"].total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_loop_preserves_call_ids_and_collects_media() {
        let fx = fixture(
            vec![tool_call_response("call_7", "ping"), plain("done", 1, 1)],
            true,
        );

        fx.agent
            .handle(inbound("telegram", "42", "42", "haz ping"))
            .await;

        let cancel = CancellationToken::new();
        let reply = fx.bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(reply.content, "done");
        assert_eq!(reply.media_urls, vec!["https://e/pong.png".to_string()]);

        // Second request contains the assistant tool call and its result,
        // with the id echoed verbatim.
        let seen = fx.provider.seen_messages.lock().unwrap();
        let second = &seen[1];
        let tool_msg = second.iter().find(|m| m.role == "tool").unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(tool_msg.content, "pong");
    }

    #[tokio::test]
    async fn failing_tool_feeds_an_error_back_to_the_model() {
        let fx = fixture(
            vec![tool_call_response("call_1", "no_such_tool"), plain("ok", 1, 1)],
            false,
        );

        fx.agent
            .handle(inbound("telegram", "42", "42", "x"))
            .await;

        let seen = fx.provider.seen_messages.lock().unwrap();
        let tool_msg = seen[1].iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_msg.content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn internal_messages_reply_to_the_last_external_channel() {
        let fx = fixture(vec![plain("resumen listo", 2, 2)], false);
        fx.state.set_last_channel("telegram:42").unwrap();

        fx.agent
            .handle(inbound("cron", "cron:morning", "cron:morning", "resume"))
            .await;

        let cancel = CancellationToken::new();
        let reply = fx.bus.consume_outbound(&cancel).await.unwrap();
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "42");

        // Internal traffic never overwrites last_channel.
        assert_eq!(fx.state.last_channel().as_deref(), Some("telegram:42"));
        let today = fx.tracker.get_today().unwrap();
        assert_eq!(today.features["cron"].calls, 1);
    }

    #[tokio::test]
    async fn internal_messages_without_a_last_channel_are_dropped() {
        let fx = fixture(vec![plain("nadie escucha", 1, 1)], false);

        fx.agent
            .handle(inbound("webhook", "webhook:gh", "webhook:gh:push", "[Webhook] x"))
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(fx.bus.consume_outbound(&cancel).await.is_none());
        assert_eq!(fx.state.last_channel(), None);
    }

    #[tokio::test]
    async fn provider_errors_surface_as_assistant_text() {
        let fx = fixture(vec![], false);

        fx.agent
            .handle(inbound("telegram", "42", "42", "hola"))
            .await;

        let cancel = CancellationToken::new();
        let reply = fx.bus.consume_outbound(&cancel).await.unwrap();
        assert!(reply.content.contains("Error processing your message"));
    }

    #[tokio::test]
    async fn tool_iteration_cap_stops_runaway_loops() {
        let responses = (0..10)
            .map(|i| tool_call_response(&format!("call_{i}"), "ping"))
            .collect();
        let fx = fixture(responses, true);

        fx.agent
            .handle(inbound("telegram", "42", "42", "loop"))
            .await;

        let cancel = CancellationToken::new();
        let reply = fx.bus.consume_outbound(&cancel).await.unwrap();
        assert!(reply.content.contains("tool call limit"));
        // Exactly max_tool_iterations provider calls were made.
        assert_eq!(fx.provider.seen_messages.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn history_is_bounded_and_replayed() {
        let mut responses = Vec::new();
        for i in 0..30 {
            responses.push(plain(&format!("r{i}"), 1, 1));
        }
        let fx = fixture(responses, false);

        for i in 0..30 {
            fx.agent
                .handle(inbound("telegram", "42", "42", &format!("m{i}")))
                .await;
        }

        let seen = fx.provider.seen_messages.lock().unwrap();
        let last = seen.last().unwrap();
        // system + bounded history + current user message
        assert!(last.len() <= MAX_HISTORY_MESSAGES + 2);
        assert!(last.iter().any(|m| m.content == "m28"));
        assert!(!last.iter().any(|m| m.content == "m0"));
    }
}
