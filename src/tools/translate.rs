use super::{Args, Tool, ToolResult, arg_str};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INPUT_CHARS: usize = 500;

/// Text translation via the anonymous mymemory API.
pub struct TranslateTool {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "responseData")]
    response_data: TranslateData,
    #[serde(rename = "responseStatus")]
    response_status: i64,
}

#[derive(Deserialize)]
struct TranslateData {
    #[serde(rename = "translatedText")]
    translated_text: String,
    #[serde(default)]
    r#match: f64,
}

impl TranslateTool {
    pub fn new() -> Self {
        Self::with_api_base("https://api.mymemory.translated.net")
    }

    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for TranslateTool {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Tool for TranslateTool {
    fn name(&self) -> &str {
        "translate"
    }

    fn description(&self) -> &str {
        "Translate text between languages. Use language codes like 'en', 'es', 'fr', 'de', \
         'pt', 'it', 'ja', 'zh', 'ko', 'ru', etc."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Text to translate (max 500 characters)"
                },
                "from": {
                    "type": "string",
                    "description": "Source language code (default: 'auto' for auto-detection)"
                },
                "to": {
                    "type": "string",
                    "description": "Target language code (default: 'es')"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        let Some(text) = arg_str(&args, "text") else {
            return Ok(ToolResult::error("text is required"));
        };

        let from = match arg_str(&args, "from") {
            Some("auto") | None => "autodetect",
            Some(code) => code,
        };
        let to = arg_str(&args, "to").unwrap_or("es");

        let text = truncate_chars(text, MAX_INPUT_CHARS);
        let lang_pair = format!("{from}|{to}");

        let response = self
            .client
            .get(format!("{}/get", self.api_base))
            .query(&[("q", text), ("langpair", lang_pair.as_str())])
            .send()
            .await;

        let parsed: TranslateResponse = match response {
            Ok(resp) => match resp.json().await.context("failed to parse response") {
                Ok(parsed) => parsed,
                Err(error) => return Ok(ToolResult::error(error.to_string())),
            },
            Err(error) => {
                return Ok(ToolResult::error(format!(
                    "translation request failed: {error}"
                )));
            }
        };

        if parsed.response_status != 200 {
            return Ok(ToolResult::error(format!(
                "translation API returned status {}",
                parsed.response_status
            )));
        }

        Ok(ToolResult::silent(format!(
            "Translation ({from} → {to}):\n{}\n\nMatch quality: {:.0}%",
            parsed.response_data.translated_text,
            parsed.response_data.r#match * 100.0
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn translates_with_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .and(query_param("langpair", "autodetect|es"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responseData": {"translatedText": "hola mundo", "match": 0.98},
                "responseStatus": 200
            })))
            .mount(&server)
            .await;

        let tool = TranslateTool::with_api_base(&server.uri());
        let result = tool
            .execute(args(json!({"text": "hello world"})))
            .await
            .unwrap();

        assert!(result.text().contains("Translation (autodetect → es)"));
        assert!(result.text().contains("hola mundo"));
        assert!(result.text().contains("Match quality: 98%"));
    }

    #[tokio::test]
    async fn honors_explicit_language_pair() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .and(query_param("langpair", "es|en"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responseData": {"translatedText": "good morning", "match": 1.0},
                "responseStatus": 200
            })))
            .mount(&server)
            .await;

        let tool = TranslateTool::with_api_base(&server.uri());
        let result = tool
            .execute(args(json!({"text": "buenos días", "from": "es", "to": "en"})))
            .await
            .unwrap();
        assert!(result.text().contains("good morning"));
    }

    #[tokio::test]
    async fn long_input_is_truncated_to_500_chars() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .and(query_param("q", "x".repeat(500).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responseData": {"translatedText": "…", "match": 0.5},
                "responseStatus": 200
            })))
            .mount(&server)
            .await;

        let tool = TranslateTool::with_api_base(&server.uri());
        let result = tool
            .execute(args(json!({"text": "x".repeat(800)})))
            .await
            .unwrap();
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn api_level_failure_is_an_error_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responseData": {"translatedText": "", "match": 0.0},
                "responseStatus": 403
            })))
            .mount(&server)
            .await;

        let tool = TranslateTool::with_api_base(&server.uri());
        let result = tool.execute(args(json!({"text": "hi"}))).await.unwrap();
        assert!(result.is_error());
        assert!(result.text().contains("status 403"));
    }
}
