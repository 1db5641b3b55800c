use crate::bus::{InboundMessage, MessageBus};
use crate::config::CronJobConfig;
use crate::util::parse_duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval jobs that feed prompts to the agent on the internal `cron`
/// channel. Replies are routed to the user's last active transport by
/// the agent, the same way sentinel alerts are.
pub struct CronService {
    jobs: Vec<CronJobConfig>,
    bus: Arc<MessageBus>,
}

impl CronService {
    pub fn new(jobs: Vec<CronJobConfig>, bus: Arc<MessageBus>) -> Self {
        Self { jobs, bus }
    }

    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for job in &self.jobs {
            let every = match parse_duration(&job.every) {
                Ok(every) if !every.is_zero() => every,
                Ok(_) => {
                    tracing::error!(job = %job.name, "skipping cron job with zero interval");
                    continue;
                }
                Err(error) => {
                    tracing::error!(job = %job.name, %error, "skipping cron job with bad interval");
                    continue;
                }
            };

            let bus = Arc::clone(&self.bus);
            let cancel = cancel.clone();
            let job = job.clone();
            tracing::info!(job = %job.name, every = %job.every, "cron job scheduled");
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                // The first tick fires immediately; cron jobs wait a full period.
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            bus.publish_inbound(InboundMessage {
                                channel: "cron".to_string(),
                                sender_id: format!("cron:{}", job.name),
                                chat_id: format!("cron:{}", job.name),
                                content: job.prompt.clone(),
                                attachments: Vec::new(),
                                metadata: HashMap::from([
                                    ("platform".to_string(), "cron".to_string()),
                                    ("job".to_string(), job.name.clone()),
                                ]),
                            })
                            .await;
                        }
                    }
                }
            }));
        }
        handles
    }
}
