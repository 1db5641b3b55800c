use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// A structured tool invocation reported by the model. `arguments`
/// arrives on the wire as a JSON-encoded string and is decoded into an
/// object before it reaches the registry; `id` must be echoed verbatim
/// on the matching tool-result message.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Option<UsageInfo>,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One part of a multimodal message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A chat message. `content` serializes as a plain string unless
/// `parts` is non-empty, in which case the multimodal array form is
/// used — that branch lives here, not in the tool layer.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub parts: Vec<ContentPart>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user_with_images(content: impl Into<String>, image_urls: &[String]) -> Self {
        let mut parts = vec![ContentPart::Text {
            text: content.into(),
        }];
        for url in image_urls {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.clone() },
            });
        }
        Self {
            role: "user".into(),
            parts,
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = 2;
        if !self.tool_calls.is_empty() {
            fields += 1;
        }
        if self.tool_call_id.is_some() {
            fields += 1;
        }

        let mut msg = serializer.serialize_struct("Message", fields)?;
        msg.serialize_field("role", &self.role)?;
        if self.parts.is_empty() {
            msg.serialize_field("content", &self.content)?;
        } else {
            msg.serialize_field("content", &self.parts)?;
        }
        if !self.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = self
                .tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": serde_json::Value::Object(call.arguments.clone())
                                .to_string(),
                        },
                    })
                })
                .collect();
            msg.serialize_field("tool_calls", &calls)?;
        }
        if let Some(id) = &self.tool_call_id {
            msg.serialize_field("tool_call_id", id)?;
        }
        msg.end()
    }
}

/// A tool advertised to the model, in function-calling form.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function",
            function: ToolFunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}
