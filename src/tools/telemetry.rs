use super::{Args, Tool, ToolResult, arg_str};
use crate::telemetry::{Tracker, format_day_bucket};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::sync::Arc;

/// Read-only view over the token ledger for the user.
pub struct TelemetryTool {
    tracker: Arc<Tracker>,
}

impl TelemetryTool {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Tool for TelemetryTool {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn description(&self) -> &str {
        "Check token usage statistics. Use when the user asks about token consumption, \
         costs, or usage stats."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["today", "day", "summary"],
                    "description": "Action: 'today' for today's usage, 'day' for a specific date, 'summary' for last 7 days"
                },
                "date": {
                    "type": "string",
                    "description": "Date in YYYY-MM-DD format (only for 'day' action)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        match arg_str(&args, "action") {
            Some("today") => Ok(ToolResult::silent(format_day_bucket(
                self.tracker.get_today().as_ref(),
            ))),
            Some("day") => {
                let Some(date) = arg_str(&args, "date") else {
                    return Ok(ToolResult::error(
                        "date is required for 'day' action (format: YYYY-MM-DD)",
                    ));
                };
                Ok(ToolResult::silent(format_day_bucket(
                    self.tracker.get_day(date).as_ref(),
                )))
            }
            Some("summary") => {
                let days = self.tracker.get_last_n_days(7);
                if days.is_empty() {
                    return Ok(ToolResult::silent("No telemetry data available yet."));
                }

                let mut out = format!("Token usage summary (last {} days):\n\n", days.len());
                let mut grand_total = 0;
                let mut grand_calls = 0;
                for d in &days {
                    let _ = writeln!(
                        out,
                        "{}: {} tokens in {} calls",
                        d.date, d.totals.total_tokens, d.totals.calls
                    );
                    grand_total += d.totals.total_tokens;
                    grand_calls += d.totals.calls;
                }
                let _ = write!(
                    out,
                    "\nGrand total: {grand_total} tokens in {grand_calls} calls over {} days\n",
                    days.len()
                );
                Ok(ToolResult::silent(out))
            }
            _ => Ok(ToolResult::error("invalid action, use: today, day, or summary")),
        }
    }
}
