use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::is_internal_channel;
use crate::state::{StateManager, parse_last_channel};
use crate::util::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_INTERVAL_SECS: u64 = 120;
const ALERT_COOLDOWN: Duration = Duration::from_secs(3600);

const CPU_TEMP_LIMIT_C: f64 = 80.0;
const RAM_USED_LIMIT_PCT: f64 = 90.0;
const DISK_USED_LIMIT_PCT: f64 = 95.0;

/// Snapshot persisted to `state/sentinel.json` on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelState {
    pub last_check: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub cpu_temp_c: f64,
    pub ram_total_mb: i64,
    pub ram_available_mb: i64,
    pub ram_used_percent: f64,
    pub disk_total_gb: f64,
    pub disk_free_gb: f64,
    pub disk_used_percent: f64,
    pub alerts: Vec<String>,
}

/// Host metric readers. Failures degrade to zero readings rather than
/// erroring; a sentinel that cannot read a gauge has nothing to alert on.
pub trait HostMetrics: Send + Sync {
    fn cpu_temp_c(&self) -> f64;

    /// (total MB, available MB, used %)
    fn ram(&self) -> (i64, i64, f64);

    /// (total GB, free GB, used %)
    fn disk(&self) -> (f64, f64, f64);
}

/// Readers for a Linux host: sysfs thermal zone, /proc/meminfo, and
/// `df` for the root filesystem.
pub struct ProcMetrics;

impl HostMetrics for ProcMetrics {
    fn cpu_temp_c(&self) -> f64 {
        let Ok(raw) = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp") else {
            return 0.0;
        };
        raw.trim().parse::<i64>().map_or(0.0, |milli_c| milli_c as f64 / 1000.0)
    }

    fn ram(&self) -> (i64, i64, f64) {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return (0, 0, 0.0);
        };

        let mut total_kb = 0i64;
        let mut available_kb = 0i64;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = parse_kb(rest);
            }
        }

        let total_mb = total_kb / 1024;
        let available_mb = available_kb / 1024;
        let used_pct = if total_mb > 0 {
            (total_mb - available_mb) as f64 / total_mb as f64 * 100.0
        } else {
            0.0
        };
        (total_mb, available_mb, used_pct)
    }

    fn disk(&self) -> (f64, f64, f64) {
        let Ok(output) = std::process::Command::new("df").args(["-Pk", "/"]).output() else {
            return (0.0, 0.0, 0.0);
        };
        let text = String::from_utf8_lossy(&output.stdout);
        let Some(line) = text.lines().nth(1) else {
            return (0.0, 0.0, 0.0);
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return (0.0, 0.0, 0.0);
        }
        let total_kb: f64 = fields[1].parse().unwrap_or(0.0);
        let free_kb: f64 = fields[3].parse().unwrap_or(0.0);

        let total_gb = total_kb / (1024.0 * 1024.0);
        let free_gb = free_kb / (1024.0 * 1024.0);
        let used_pct = if total_gb > 0.0 {
            (1.0 - free_gb / total_gb) * 100.0
        } else {
            0.0
        };
        (total_gb, free_gb, used_pct)
    }
}

fn parse_kb(rest: &str) -> i64 {
    rest.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

/// Periodic host-health poller. Persists a full snapshot every tick and
/// fans alert strings out through the bus to the last active external
/// channel, at most once per identical alert per hour.
pub struct Sentinel {
    config: SentinelConfig,
    state_path: PathBuf,
    bus: Arc<MessageBus>,
    state: Arc<StateManager>,
    metrics: Box<dyn HostMetrics>,
    started_at: Instant,
    last_alert_time: Mutex<HashMap<String, Instant>>,
}

impl Sentinel {
    pub fn new(
        config: SentinelConfig,
        workspace: &Path,
        bus: Arc<MessageBus>,
        state: Arc<StateManager>,
        metrics: Box<dyn HostMetrics>,
    ) -> Self {
        Self {
            config,
            state_path: workspace.join("state").join("sentinel.json"),
            bus,
            state,
            metrics,
            started_at: Instant::now(),
            last_alert_time: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("sentinel disabled");
            return None;
        }

        let interval_secs = self.config.interval_secs.max(1);
        let sentinel = self;
        Some(tokio::spawn(async move {
            tracing::info!(interval_secs, "sentinel started");
            // Take the first reading immediately.
            sentinel.collect().await;
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => sentinel.collect().await,
                }
            }
            tracing::info!("sentinel stopped");
        }))
    }

    pub async fn collect(&self) {
        let (ram_total_mb, ram_available_mb, ram_used_percent) = self.metrics.ram();
        let (disk_total_gb, disk_free_gb, disk_used_percent) = self.metrics.disk();
        let cpu_temp_c = self.metrics.cpu_temp_c();

        let mut alerts = Vec::new();
        if cpu_temp_c > CPU_TEMP_LIMIT_C {
            alerts.push(format!("CPU temperatura alta: {cpu_temp_c:.1}°C"));
        }
        if ram_used_percent > RAM_USED_LIMIT_PCT {
            alerts.push(format!("RAM crítica: {ram_used_percent:.1}% usada"));
        }
        if disk_used_percent > DISK_USED_LIMIT_PCT {
            alerts.push(format!("Disco casi lleno: {disk_used_percent:.1}% usado"));
        }

        let snapshot = SentinelState {
            last_check: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
            cpu_temp_c,
            ram_total_mb,
            ram_available_mb,
            ram_used_percent,
            disk_total_gb,
            disk_free_gb,
            disk_used_percent,
            alerts: alerts.clone(),
        };

        if let Err(error) = write_json_atomic(&self.state_path, &snapshot) {
            tracing::error!(%error, "failed to persist sentinel state");
        }

        for alert in alerts {
            self.send_alert(alert).await;
        }

        tracing::debug!(
            cpu_temp = snapshot.cpu_temp_c,
            ram_pct = snapshot.ram_used_percent,
            disk_pct = snapshot.disk_used_percent,
            "sentinel collected metrics"
        );
    }

    async fn send_alert(&self, alert: String) {
        {
            let mut last = self
                .last_alert_time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(at) = last.get(&alert) {
                if at.elapsed() < ALERT_COOLDOWN {
                    return;
                }
            }
            last.insert(alert.clone(), Instant::now());
        }

        let Some(last_channel) = self.state.last_channel() else {
            return;
        };
        let Some((platform, user_id)) = parse_last_channel(&last_channel) else {
            return;
        };
        if is_internal_channel(platform) {
            return;
        }

        self.bus
            .publish_outbound(OutboundMessage::text(
                platform,
                user_id,
                format!("⚠️ {alert}"),
            ))
            .await;
        tracing::info!(%alert, to = platform, "sentinel alert sent");
    }
}
