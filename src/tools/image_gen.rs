use super::{Args, Tool, ToolResult, arg_str};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Image generation via the pollinations prompt-in-URL API. The service
/// can be flaky, so the URL is verified with retries before being
/// handed to the user.
pub struct ImageGenTool {
    client: reqwest::Client,
    api_base: String,
    backoff: Duration,
}

impl ImageGenTool {
    pub fn new() -> Self {
        Self::with_api_base("https://image.pollinations.ai", DEFAULT_BACKOFF)
    }

    pub fn with_api_base(api_base: &str, backoff: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(VERIFY_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_base: api_base.trim_end_matches('/').to_string(),
            backoff,
        }
    }
}

impl Default for ImageGenTool {
    fn default() -> Self {
        Self::new()
    }
}

fn path_escape(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    for byte in prompt.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl Tool for ImageGenTool {
    fn name(&self) -> &str {
        "image_gen"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt using AI. Returns a URL to the generated image. \
         Use when the user asks to create, draw, or generate an image."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Text description of the image to generate (in English for best results)"
                },
                "width": {
                    "type": "integer",
                    "description": "Image width in pixels (default 1024)"
                },
                "height": {
                    "type": "integer",
                    "description": "Image height in pixels (default 1024)"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        let Some(prompt) = arg_str(&args, "prompt") else {
            return Ok(ToolResult::error("prompt is required"));
        };

        let width = args.get("width").and_then(Value::as_i64).unwrap_or(1024);
        let height = args.get("height").and_then(Value::as_i64).unwrap_or(1024);

        let image_url = format!(
            "{}/prompt/{}?width={width}&height={height}&nologo=true",
            self.api_base,
            path_escape(prompt)
        );

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.backoff).await;
            }

            let response = match self.client.get(&image_url).send().await {
                Ok(response) => response,
                Err(error) => {
                    last_error = format!("request failed: {error}");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                last_error = format!("HTTP {}", status.as_u16());
                continue;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !content_type.starts_with("image/") {
                last_error = format!("unexpected content-type \"{content_type}\"");
                continue;
            }

            return Ok(ToolResult::media(
                format!("Image generated successfully for prompt: \"{prompt}\""),
                vec![image_url],
            ));
        }

        Ok(ToolResult::error(format!(
            "Image generation failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    fn fast_tool(server: &MockServer) -> ImageGenTool {
        ImageGenTool::with_api_base(&server.uri(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn success_returns_media_with_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/prompt/.*"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "image/jpeg"),
            )
            .mount(&server)
            .await;

        let tool = fast_tool(&server);
        let result = tool
            .execute(args(json!({"prompt": "a red fox", "width": 512, "height": 256})))
            .await
            .unwrap();

        let ToolResult::Media { text, urls } = result else {
            panic!("expected media result");
        };
        assert!(text.contains("a red fox"));
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("/prompt/a%20red%20fox"));
        assert!(urls[0].contains("width=512"));
        assert!(urls[0].contains("height=256"));
    }

    #[tokio::test]
    async fn retries_until_an_image_content_type_appears() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/prompt/.*"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "text/html"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("^/prompt/.*"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "image/png"),
            )
            .mount(&server)
            .await;

        let tool = fast_tool(&server);
        let result = tool
            .execute(args(json!({"prompt": "retry me"})))
            .await
            .unwrap();
        assert!(matches!(result, ToolResult::Media { .. }));
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/prompt/.*"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let tool = fast_tool(&server);
        let result = tool
            .execute(args(json!({"prompt": "never works"})))
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.text().contains("failed after 3 attempts"));
        assert!(result.text().contains("HTTP 502"));
    }
}
