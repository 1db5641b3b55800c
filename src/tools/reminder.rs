use super::{Args, ContextualTool, Tool, ToolResult, arg_str};
use crate::bus::{MessageBus, OutboundMessage};
use crate::util::{parse_duration, write_json_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reminder {
    id: String,
    message: String,
    due_at: String,
    channel: String,
    chat_id: String,
    created_at: String,
    fired: bool,
}

struct ReminderInner {
    channel: String,
    chat_id: String,
    next_id: u64,
    timers: HashMap<String, JoinHandle<()>>,
}

/// Durable delayed firings. Construction does no I/O; `start_pending`
/// re-arms everything unfired at boot. Each non-fired reminder has at
/// most one live timer; firing publishes first and marks `fired` on
/// disk second, so a crash in between replays the reminder at most
/// once on the next boot.
pub struct ReminderTool {
    path: PathBuf,
    bus: Arc<MessageBus>,
    inner: Arc<Mutex<ReminderInner>>,
}

fn load_reminders(path: &Path) -> Result<Vec<Reminder>> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).context("corrupted reminders file"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(error) => Err(error).context("read reminders file"),
    }
}

async fn fire_reminder(
    bus: Arc<MessageBus>,
    path: PathBuf,
    inner: Arc<Mutex<ReminderInner>>,
    id: String,
    message: String,
    channel: String,
    chat_id: String,
) {
    if !channel.is_empty() && !chat_id.is_empty() {
        bus.publish_outbound(OutboundMessage::text(
            &channel,
            &chat_id,
            format!("Recordatorio: {message}"),
        ))
        .await;
    }

    let mut guard = inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.timers.remove(&id);

    match load_reminders(&path) {
        Ok(mut reminders) => {
            if let Some(r) = reminders.iter_mut().find(|r| r.id == id) {
                r.fired = true;
            }
            if let Err(error) = write_json_atomic(&path, &reminders) {
                tracing::error!(%error, %id, "failed to persist fired reminder");
            }
        }
        Err(error) => tracing::error!(%error, %id, "failed to load reminders after firing"),
    }
}

impl ReminderTool {
    pub fn new(workspace: &Path, bus: Arc<MessageBus>) -> Self {
        Self {
            path: workspace.join("reminders.json"),
            bus,
            inner: Arc::new(Mutex::new(ReminderInner {
                channel: String::new(),
                chat_id: String::new(),
                next_id: 1,
                timers: HashMap::new(),
            })),
        }
    }

    /// Reload unfired reminders and schedule them. Call once at startup.
    pub fn start_pending(&self) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let reminders = load_reminders(&self.path)?;

        let mut max_id = 0;
        for r in &reminders {
            if let Ok(id) = r.id.parse::<u64>() {
                max_id = max_id.max(id);
            }
            if r.fired {
                continue;
            }

            let Ok(due_at) = chrono::DateTime::parse_from_rfc3339(&r.due_at) else {
                tracing::warn!(id = %r.id, due_at = %r.due_at, "skipping reminder with bad due_at");
                continue;
            };
            let delay = (due_at.with_timezone(&Local) - Local::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            self.arm(&mut guard, r, delay);
        }

        guard.next_id = max_id + 1;
        Ok(())
    }

    /// Drop every live timer. Unfired reminders stay on disk for the
    /// next boot.
    pub fn shutdown(&self) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, handle) in guard.timers.drain() {
            handle.abort();
        }
    }

    fn arm(
        &self,
        guard: &mut ReminderInner,
        reminder: &Reminder,
        delay: std::time::Duration,
    ) {
        let bus = Arc::clone(&self.bus);
        let path = self.path.clone();
        let inner = Arc::clone(&self.inner);
        let (id, message, channel, chat_id) = (
            reminder.id.clone(),
            reminder.message.clone(),
            reminder.channel.clone(),
            reminder.chat_id.clone(),
        );

        let timer_id = reminder.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_reminder(bus, path, inner, id, message, channel, chat_id).await;
        });
        guard.timers.insert(timer_id, handle);
    }

    fn set(&self, args: &Args) -> Result<ToolResult> {
        let (Some(message), Some(duration_str)) =
            (arg_str(args, "message"), arg_str(args, "duration"))
        else {
            return Ok(ToolResult::error(
                "message and duration are required for set",
            ));
        };

        let duration = match parse_duration(duration_str) {
            Ok(d) => d,
            Err(error) => {
                return Ok(ToolResult::error(format!(
                    "invalid duration '{duration_str}': {error}"
                )));
            }
        };

        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let id = guard.next_id.to_string();
        guard.next_id += 1;

        let now = Local::now();
        let due_at = now + chrono::Duration::from_std(duration).context("duration out of range")?;
        let reminder = Reminder {
            id: id.clone(),
            message: message.to_string(),
            due_at: due_at.to_rfc3339(),
            channel: guard.channel.clone(),
            chat_id: guard.chat_id.clone(),
            created_at: now.to_rfc3339(),
            fired: false,
        };

        let mut reminders = load_reminders(&self.path)?;
        reminders.push(reminder.clone());
        write_json_atomic(&self.path, &reminders)?;

        self.arm(&mut guard, &reminder, duration);

        Ok(ToolResult::silent(format!(
            "Reminder #{id} set for {} ({duration_str} from now): {message}",
            due_at.format("%H:%M")
        )))
    }

    fn list(&self) -> Result<ToolResult> {
        let _guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let reminders = load_reminders(&self.path)?;

        let pending: Vec<String> = reminders
            .iter()
            .filter(|r| !r.fired)
            .map(|r| format!("- #{}: {} (due: {})", r.id, r.message, r.due_at))
            .collect();

        if pending.is_empty() {
            return Ok(ToolResult::silent("No pending reminders"));
        }
        Ok(ToolResult::silent(format!(
            "Pending reminders:\n{}",
            pending.join("\n")
        )))
    }

    fn cancel(&self, args: &Args) -> Result<ToolResult> {
        let Some(id) = arg_str(args, "id") else {
            return Ok(ToolResult::error("id is required for cancel"));
        };

        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = guard.timers.remove(id) {
            handle.abort();
        }

        let mut reminders = load_reminders(&self.path)?;
        let Some(reminder) = reminders.iter_mut().find(|r| r.id == id && !r.fired) else {
            return Ok(ToolResult::silent(format!(
                "Reminder #{id} not found or already fired"
            )));
        };
        reminder.fired = true;

        write_json_atomic(&self.path, &reminders)?;
        Ok(ToolResult::silent(format!("Reminder #{id} cancelled")))
    }
}

#[async_trait]
impl Tool for ReminderTool {
    fn name(&self) -> &str {
        "reminder"
    }

    fn description(&self) -> &str {
        "Set, list, or cancel reminders. The bot will send you a message when the reminder \
         is due. Use duration strings like '30m', '2h', '1d', '1h30m'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["set", "list", "cancel"],
                    "description": "Action to perform"
                },
                "message": {
                    "type": "string",
                    "description": "Reminder message (required for set)"
                },
                "duration": {
                    "type": "string",
                    "description": "Time until reminder fires: '30m', '2h', '1d', '1h30m', etc. (required for set)"
                },
                "id": {
                    "type": "string",
                    "description": "Reminder ID (required for cancel)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        match arg_str(&args, "action") {
            Some("set") => self.set(&args),
            Some("list") => self.list(),
            Some("cancel") => self.cancel(&args),
            other => Ok(ToolResult::error(format!(
                "unknown action: {}",
                other.unwrap_or_default()
            ))),
        }
    }
}

impl ContextualTool for ReminderTool {
    fn set_context(&self, channel: &str, chat_id: &str) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.channel = channel.to_string();
        guard.chat_id = chat_id.to_string();
    }
}
