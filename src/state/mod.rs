use crate::util::write_json_atomic;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProcessState {
    #[serde(default)]
    last_channel: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Small process-wide key/value state persisted under the workspace.
/// The one well-known key is `last_channel` (`"<platform>:<user_id>"`),
/// written by the agent whenever a user message arrives from an
/// external transport and read by the out-of-band producers that need
/// a human to reply to.
pub struct StateManager {
    path: PathBuf,
    state: RwLock<ProcessState>,
}

impl StateManager {
    pub fn load(workspace: &Path) -> Self {
        let path = workspace.join("state").join("state.json");
        let state = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|error| {
                tracing::warn!(%error, "failed to parse state file, starting fresh");
                ProcessState::default()
            }),
            Err(_) => ProcessState::default(),
        };
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn last_channel(&self) -> Option<String> {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.last_channel.is_empty() {
            None
        } else {
            Some(state.last_channel.clone())
        }
    }

    pub fn set_last_channel(&self, value: &str) -> Result<()> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.last_channel == value {
            return Ok(());
        }
        state.last_channel = value.to_string();
        write_json_atomic(&self.path, &*state)
    }
}

/// Split a `"<platform>:<user_id>"` value into its halves. Returns None
/// when either half is empty or the separator is missing.
pub fn parse_last_channel(value: &str) -> Option<(&str, &str)> {
    let (platform, user_id) = value.split_once(':')?;
    if platform.is_empty() || user_id.is_empty() {
        return None;
    }
    Some((platform, user_id))
}
