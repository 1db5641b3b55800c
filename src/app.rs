use crate::agent::Agent;
use crate::bus::MessageBus;
use crate::channels::{Channel, TelegramChannel, WebhookChannel};
use crate::config::Config;
use crate::cron::CronService;
use crate::providers::OpenAiCompatProvider;
use crate::sentinel::{ProcMetrics, Sentinel, SentinelConfig};
use crate::state::StateManager;
use crate::telemetry::Tracker;
use crate::tools::{
    ImageGenTool, NotesTool, ReminderTool, SnippetTool, TasksTool, TelemetryTool, ToolRegistry,
    TranslateTool, WeatherTool, YouTubeTool,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ADAPTER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build every component, start them, and block until shutdown.
///
/// Construction order resolves the reminder↔bus cycle by injection:
/// bus first, then tools (with a bus handle), then the agent (with the
/// registry), then the adapters (with the bus).
pub async fn run(config: Config) -> Result<()> {
    let workspace = config.workspace_dir.clone();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;

    let cancel = CancellationToken::new();
    let bus = Arc::new(MessageBus::new());
    let state = Arc::new(StateManager::load(&workspace));
    let tracker = Arc::new(Tracker::load(&workspace));

    let reminder = Arc::new(ReminderTool::new(&workspace, Arc::clone(&bus)));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(NotesTool::new(&workspace)));
    registry.register(Arc::new(SnippetTool::new(&workspace)));
    registry.register(Arc::new(TasksTool::new(&workspace)));
    registry.register(Arc::new(WeatherTool::new()));
    registry.register(Arc::new(TranslateTool::new()));
    registry.register(Arc::new(ImageGenTool::new()));
    registry.register(Arc::new(YouTubeTool::new()));
    registry.register(Arc::new(TelemetryTool::new(Arc::clone(&tracker))));
    registry.register_contextual(Arc::clone(&reminder));
    let registry = Arc::new(registry);

    let provider = Arc::new(OpenAiCompatProvider::new(
        &config.llm.api_base,
        &config.llm.api_key,
        &config.llm.model,
    ));

    let agent = Arc::new(Agent::new(
        provider,
        Arc::clone(&registry),
        Arc::clone(&bus),
        Arc::clone(&state),
        Arc::clone(&tracker),
        config.llm.model.clone(),
        config.llm.system_prompt.clone(),
        config.llm.max_tool_iterations,
    ));

    // Adapters register themselves as outbound handlers on the bus.
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    if let Some(telegram) = config.channels.telegram.clone() {
        let channel = Arc::new(TelegramChannel::new(telegram, Arc::clone(&bus)));
        bus.register_handler(channel.name().to_string(), channel.clone());
        channels.push(channel);
    }
    if let Some(webhook) = config.channels.webhook.clone() {
        let channel = Arc::new(WebhookChannel::new(webhook, Arc::clone(&bus)));
        bus.register_handler(channel.name().to_string(), channel.clone());
        channels.push(channel);
    }

    for channel in &channels {
        channel
            .start(cancel.clone())
            .await
            .with_context(|| format!("start channel {}", channel.name()))?;
    }

    if let Err(error) = reminder.start_pending() {
        tracing::error!(%error, "failed to schedule pending reminders");
    }

    let flush_task = Arc::clone(&tracker).start(cancel.clone());

    let sentinel = Arc::new(Sentinel::new(
        SentinelConfig {
            enabled: config.sentinel.enabled,
            interval_secs: config.sentinel.interval_secs,
        },
        &workspace,
        Arc::clone(&bus),
        Arc::clone(&state),
        Box::new(ProcMetrics),
    ));
    let sentinel_task = sentinel.start(cancel.clone());

    let cron = CronService::new(config.cron.jobs.clone(), Arc::clone(&bus));
    let cron_tasks = cron.start(&cancel);

    let agent_task = tokio::spawn(Arc::clone(&agent).run(cancel.clone()));
    let pump_task = tokio::spawn(run_outbound_pump(Arc::clone(&bus), cancel.clone()));

    tracing::info!(
        workspace = %workspace.display(),
        channels = channels.len(),
        cron_jobs = cron_tasks.len(),
        "famulus is running"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutdown requested");

    // Shutdown order: cancel the root, stop adapters, drain the bus,
    // flush telemetry, then drop reminder timers. Unfired reminders
    // stay on disk for the next boot.
    cancel.cancel();

    for channel in &channels {
        match tokio::time::timeout(ADAPTER_STOP_TIMEOUT, channel.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(channel = channel.name(), %error, "channel stop failed");
            }
            Err(_) => {
                tracing::warn!(channel = channel.name(), "channel stop timed out");
            }
        }
    }

    let _ = agent_task.await;
    let _ = pump_task.await;
    bus.close().await;

    let _ = flush_task.await;
    tracker.stop();

    if let Some(task) = sentinel_task {
        let _ = task.await;
    }
    for task in cron_tasks {
        let _ = task.await;
    }
    reminder.shutdown();

    tracing::info!("shutdown complete");
    Ok(())
}

/// Dispatch outbound messages to the adapter registered for their
/// channel. Errors are logged and swallowed; a missing handler is not
/// fatal either.
async fn run_outbound_pump(bus: Arc<MessageBus>, cancel: CancellationToken) {
    while let Some(msg) = bus.consume_outbound(&cancel).await {
        match bus.handler(&msg.channel) {
            Some(channel) => {
                if let Err(error) = channel.send(&msg).await {
                    tracing::error!(channel = %msg.channel, %error, "outbound send failed");
                }
            }
            None => {
                tracing::warn!(channel = %msg.channel, "no handler for outbound message");
            }
        }
    }
}
