use crate::util::write_json_atomic;
use chrono::{Duration, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Feature labels for tracking token usage by purpose.
pub const FEATURE_CHAT: &str = "chat";
pub const FEATURE_CRON: &str = "cron";

const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
const KEEP_DAYS: i64 = 30;

/// Token usage for a single feature.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBucket {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub calls: i64,
}

impl FeatureBucket {
    fn add(&mut self, prompt: i64, completion: i64, total: i64) {
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
        self.total_tokens += total;
        self.calls += 1;
    }
}

/// Token usage for a single day, broken down per feature.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DayBucket {
    pub date: String,
    pub features: BTreeMap<String, FeatureBucket>,
    pub totals: FeatureBucket,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TelemetryData {
    days: Vec<DayBucket>,
}

struct TrackerInner {
    data: TelemetryData,
    dirty: bool,
}

/// Per-day, per-feature token ledger. `record` is the hot path and only
/// touches memory; a background ticker (and `stop`) flushes dirty data
/// to `state/telemetry.json` with an atomic rename, pruning days older
/// than the 30-day window.
pub struct Tracker {
    path: PathBuf,
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    pub fn load(workspace: &Path) -> Self {
        let path = workspace.join("state").join("telemetry.json");
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                tracing::warn!(%error, "failed to parse telemetry data, starting fresh");
                TelemetryData::default()
            }),
            Err(_) => TelemetryData::default(),
        };
        Self {
            path,
            inner: Mutex::new(TrackerInner { data, dirty: false }),
        }
    }

    /// Begin periodic flushing until `cancel` fires, then flush once more.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => tracker.flush(),
                }
            }
            tracker.flush();
        })
    }

    /// Final flush. Call after the flush task has been cancelled.
    pub fn stop(&self) {
        self.flush();
    }

    /// Add token usage for `feature` under today's bucket. No I/O.
    pub fn record(&self, feature: &str, prompt: i64, completion: i64, total: i64) {
        if prompt == 0 && completion == 0 && total == 0 {
            return;
        }
        let today = Local::now().format("%Y-%m-%d").to_string();

        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = get_or_create_day(&mut inner.data.days, &today);
        bucket
            .features
            .entry(feature.to_string())
            .or_default()
            .add(prompt, completion, total);
        bucket.totals.add(prompt, completion, total);
        inner.dirty = true;
    }

    /// Deep copy of today's bucket, if any usage was recorded.
    pub fn get_today(&self) -> Option<DayBucket> {
        self.get_day(&Local::now().format("%Y-%m-%d").to_string())
    }

    /// Deep copy of the bucket for `date` (`YYYY-MM-DD`), if present.
    pub fn get_day(&self, date: &str) -> Option<DayBucket> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.data.days.iter().find(|d| d.date == date).cloned()
    }

    /// Deep copies of the most recent `n` buckets, newest first.
    pub fn get_last_n_days(&self, n: usize) -> Vec<DayBucket> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.data.days.iter().rev().take(n).cloned().collect()
    }

    /// Write to disk if dirty, pruning entries older than the window.
    pub fn flush(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !inner.dirty {
            return;
        }

        let cutoff = (Local::now() - Duration::days(KEEP_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        inner.data.days.retain(|d| d.date.as_str() >= cutoff.as_str());
        inner.dirty = false;

        if let Err(error) = write_json_atomic(&self.path, &inner.data) {
            tracing::error!(%error, "failed to flush telemetry");
        }
    }
}

fn get_or_create_day<'a>(days: &'a mut Vec<DayBucket>, date: &str) -> &'a mut DayBucket {
    // Days are stored oldest-first; today is appended at the end.
    if let Some(idx) = days.iter().position(|d| d.date == date) {
        return &mut days[idx];
    }
    days.push(DayBucket {
        date: date.to_string(),
        ..DayBucket::default()
    });
    days.last_mut().expect("just pushed")
}

/// Human-readable summary of a day bucket.
pub fn format_day_bucket(bucket: Option<&DayBucket>) -> String {
    let Some(b) = bucket else {
        return "No data available.".to_string();
    };

    let mut out = format!("Date: {}\n", b.date);
    let _ = writeln!(
        out,
        "Total: {} tokens ({} prompt + {} completion) in {} calls",
        b.totals.total_tokens, b.totals.prompt_tokens, b.totals.completion_tokens, b.totals.calls
    );

    if !b.features.is_empty() {
        out.push_str("\nBy feature:\n");
        for (name, fb) in &b.features {
            let _ = writeln!(
                out,
                "  {name}: {} tokens ({} prompt + {} completion) in {} calls",
                fb.total_tokens, fb.prompt_tokens, fb.completion_tokens, fb.calls
            );
        }
    }
    out
}
