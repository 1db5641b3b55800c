use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration value object, deserialized from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub sentinel: SentinelSection,
    #[serde(default)]
    pub cron: CronSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            llm: LlmConfig::default(),
            channels: ChannelsConfig::default(),
            sentinel: SentinelSection::default(),
            cron: CronSection::default(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspace")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            max_tool_iterations: default_max_tool_iterations(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_api_base() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "openrouter/auto".to_string()
}

fn default_max_tool_iterations() -> u32 {
    10
}

fn default_system_prompt() -> String {
    "You are a helpful personal assistant. You have tools for notes, tasks, reminders, \
     snippets, weather, translation, image generation, YouTube transcripts, and usage \
     telemetry. Use them when they help; answer directly when they don't."
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_path() -> String {
    "/webhook/inbound".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sentinel_interval")]
    pub interval_secs: u64,
}

impl Default for SentinelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sentinel_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sentinel_interval() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronSection {
    #[serde(default)]
    pub jobs: Vec<CronJobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub name: String,
    /// Interval between runs, e.g. "30m", "6h", "1d".
    pub every: String,
    pub prompt: String,
}

impl Config {
    /// Read the config file, writing a default one on first run.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            let rendered = toml::to_string_pretty(&config).context("render default config")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("create config directory")?;
            }
            std::fs::write(path, rendered)
                .with_context(|| format!("write default config to {}", path.display()))?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_init_writes_a_default_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.llm.max_tool_iterations, 10);
        assert!(config.sentinel.enabled);
        assert!(config.channels.telegram.is_none());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
workspace_dir = "/var/lib/famulus"

[channels.telegram]
bot_token = "TOKEN"
allowed_users = ["alice"]

[channels.webhook]
port = 8701
secret = "s3cr3t"

[[cron.jobs]]
name = "morning"
every = "1d"
prompt = "Summarize my pending tasks."
"#,
        )
        .unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.workspace_dir, PathBuf::from("/var/lib/famulus"));
        assert_eq!(config.channels.telegram.unwrap().allowed_users, ["alice"]);
        let webhook = config.channels.webhook.unwrap();
        assert_eq!(webhook.host, "127.0.0.1");
        assert_eq!(webhook.path, "/webhook/inbound");
        assert_eq!(webhook.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(config.cron.jobs.len(), 1);
        assert_eq!(config.sentinel.interval_secs, 120);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "workspace_dir = [1, 2]").unwrap();

        assert!(Config::load_or_init(&path).is_err());
    }
}
