mod image_gen;
mod notes;
mod reminder;
mod snippets;
mod tasks;
mod telemetry;
mod translate;
mod weather;
mod youtube;

pub use image_gen::ImageGenTool;
pub use notes::NotesTool;
pub use reminder::ReminderTool;
pub use snippets::SnippetTool;
pub use tasks::TasksTool;
pub use telemetry::TelemetryTool;
pub use translate::TranslateTool;
pub use weather::WeatherTool;
pub use youtube::YouTubeTool;

use crate::providers::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type Args = serde_json::Map<String, Value>;

/// Outcome of a tool invocation. `Silent` and `Error` both flow back to
/// the model as tool output (`Error` marks the call failed); `Media`
/// additionally attaches URLs to the eventual outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Silent { text: String },
    Media { text: String, urls: Vec<String> },
    Error { text: String },
}

impl ToolResult {
    pub fn silent(text: impl Into<String>) -> Self {
        Self::Silent { text: text.into() }
    }

    pub fn media(text: impl Into<String>, urls: Vec<String>) -> Self {
        Self::Media {
            text: text.into(),
            urls,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Silent { text } | Self::Media { text, .. } | Self::Error { text } => text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A named side-effecting capability invoked by the model through
/// structured calls.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in function calling).
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Args) -> anyhow::Result<ToolResult>;
}

/// A tool that needs to know where the current conversation lives, so
/// deferred work (reminder firings) can find its way back to the
/// originating transport.
pub trait ContextualTool: Tool {
    fn set_context(&self, channel: &str, chat_id: &str);
}

/// Named tools, dispatched by the agent core. Arguments are validated
/// against each tool's declared `required` fields here at the registry
/// boundary, and execution failures come back as `Error` results —
/// nothing is ever raised to the caller.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    contextual: Vec<Arc<dyn ContextualTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_contextual<T: ContextualTool + 'static>(&mut self, tool: Arc<T>) {
        self.tools
            .insert(tool.name().to_string(), tool.clone() as Arc<dyn Tool>);
        self.contextual.push(tool);
    }

    pub fn set_context(&self, channel: &str, chat_id: &str) {
        for tool in &self.contextual {
            tool.set_context(channel, chat_id);
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition::function(tool.name(), tool.description(), tool.parameters()))
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn execute(&self, name: &str, args: Args) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!("Tool not found: {name}"));
        };

        if let Some(missing) = missing_required(&tool.parameters(), &args) {
            return ToolResult::error(format!("missing required argument '{missing}'"));
        }

        match tool.execute(args).await {
            Ok(result) => result,
            Err(error) => ToolResult::error(error.to_string()),
        }
    }
}

fn missing_required(schema: &Value, args: &Args) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    for field in required {
        let name = field.as_str()?;
        if !args.contains_key(name) {
            return Some(name.to_string());
        }
    }
    None
}

/// Read an optional string argument, treating absent and non-string as None.
pub(crate) fn arg_str<'a>(args: &'a Args, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Collect an optional string-array argument, skipping non-string items.
pub(crate) fn arg_str_vec(args: &Args, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echo back"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Args) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::silent(
                args["text"].as_str().unwrap_or_default(),
            ))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _args: Args) -> anyhow::Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn execute_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry.execute("echo", args(json!({"text": "hola"}))).await;
        assert_eq!(result, ToolResult::silent("hola"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", Args::new()).await;
        assert!(result.is_error());
        assert!(result.text().contains("Tool not found"));
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected_at_the_boundary() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry.execute("echo", Args::new()).await;
        assert!(result.is_error());
        assert!(result.text().contains("'text'"));
    }

    #[tokio::test]
    async fn execution_failures_become_error_results() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));

        let result = registry.execute("failing", Args::new()).await;
        assert!(result.is_error());
        assert!(result.text().contains("disk on fire"));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool));
        registry.register(Arc::new(EchoTool));

        let defs = registry.definitions();
        assert_eq!(defs[0].function.name, "echo");
        assert_eq!(defs[1].function.name, "failing");
    }
}
