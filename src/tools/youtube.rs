use super::{Args, Tool, ToolResult, arg_str};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_TRANSCRIPT_CHARS: usize = 15_000;
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static PLAYER_RESPONSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ytInitialPlayerResponse\s*=\s*(\{.+?\});").expect("valid regex"));
static CAPTION_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<text[^>]*>(.*?)</text>").expect("valid regex"));

/// Transcript extraction from a YouTube watch page plus its timedtext
/// caption track. No API key involved; this scrapes the same data the
/// player uses.
pub struct YouTubeTool {
    client: reqwest::Client,
    watch_base: String,
}

#[derive(Deserialize, Default)]
struct PlayerResponse {
    #[serde(default)]
    captions: Captions,
}

#[derive(Deserialize, Default)]
struct Captions {
    #[serde(rename = "playerCaptionsTracklistRenderer", default)]
    tracklist: Tracklist,
}

#[derive(Deserialize, Default)]
struct Tracklist {
    #[serde(rename = "captionTracks", default)]
    caption_tracks: Vec<CaptionTrack>,
}

#[derive(Deserialize)]
struct CaptionTrack {
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(rename = "languageCode", default)]
    language_code: String,
}

impl YouTubeTool {
    pub fn new() -> Self {
        Self::with_watch_base("https://www.youtube.com")
    }

    pub fn with_watch_base(watch_base: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            watch_base: watch_base.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_transcript(&self, video_id: &str, preferred_lang: &str) -> Result<String> {
        let html = self
            .client
            .get(format!("{}/watch", self.watch_base))
            .query(&[("v", video_id)])
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .context("failed to fetch watch page")?
            .text()
            .await
            .context("failed to read watch page")?;

        let captures = PLAYER_RESPONSE_RE
            .captures(&html)
            .context("could not find player response in page")?;
        let player: PlayerResponse =
            serde_json::from_str(&captures[1]).context("failed to parse player response")?;

        let tracks = player.captions.tracklist.caption_tracks;
        if tracks.is_empty() {
            anyhow::bail!("no captions available for this video");
        }

        // Preferred language, then English, then whatever is first.
        let track = tracks
            .iter()
            .find(|t| t.language_code == preferred_lang)
            .or_else(|| tracks.iter().find(|t| t.language_code == "en"))
            .unwrap_or(&tracks[0]);

        let xml = self
            .client
            .get(&track.base_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .context("failed to fetch captions")?
            .text()
            .await
            .context("failed to read captions")?;

        Ok(parse_caption_xml(&xml))
    }
}

impl Default for YouTubeTool {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_video_id(raw_url: &str) -> Option<String> {
    if let Some((_, rest)) = raw_url.split_once("youtu.be/") {
        let id = rest.split(['?', '&']).next().unwrap_or_default().trim();
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }

    let without_scheme = raw_url.split_once("://").map_or(raw_url, |(_, r)| r);
    let (path_part, query) = without_scheme
        .split_once('?')
        .map_or((without_scheme, ""), |(p, q)| (p, q));

    for pair in query.split('&') {
        if let Some(v) = pair.strip_prefix("v=") {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }

    let segments: Vec<&str> = path_part.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if (*segment == "embed" || *segment == "v") && i + 1 < segments.len() {
            let id = segments[i + 1];
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }

    None
}

fn parse_caption_xml(xml: &str) -> String {
    let mut lines = Vec::new();
    for captures in CAPTION_TEXT_RE.captures_iter(xml) {
        let text = captures[1]
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace('\n', " ");
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines.join(" ")
}

fn truncate_transcript(transcript: String) -> String {
    if transcript.len() <= MAX_TRANSCRIPT_CHARS {
        return transcript;
    }
    let mut end = MAX_TRANSCRIPT_CHARS;
    while !transcript.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (transcript truncated)", &transcript[..end])
}

#[async_trait]
impl Tool for YouTubeTool {
    fn name(&self) -> &str {
        "youtube"
    }

    fn description(&self) -> &str {
        "Extract transcript/captions from a YouTube video. Returns the text content which \
         you can then summarize. Use when user shares a YouTube link and wants a summary."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "YouTube video URL"
                },
                "lang": {
                    "type": "string",
                    "description": "Preferred caption language code (default: 'es', fallback: 'en')"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        let Some(video_url) = arg_str(&args, "url") else {
            return Ok(ToolResult::error("url is required"));
        };
        let lang = arg_str(&args, "lang").unwrap_or("es");

        let Some(video_id) = extract_video_id(video_url) else {
            return Ok(ToolResult::error("could not extract video ID from URL"));
        };

        match self.fetch_transcript(&video_id, lang).await {
            Ok(transcript) => {
                let transcript = truncate_transcript(transcript);
                Ok(ToolResult::silent(format!(
                    "Transcript for video {video_id}:\n\n{transcript}"
                )))
            }
            Err(error) => Ok(ToolResult::error(format!(
                "failed to get transcript: {error}"
            ))),
        }
    }
}
