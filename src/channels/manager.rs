//! Channel Manager (`spec.md` §4.5): owns one task per `(bot, channel)`
//! adapter, restarting crashed adapters with exponential backoff up to a
//! 30s ceiling, and fans inbound events into the bounded per-bot queue that
//! the Inbound Processor drains.

use super::queue::InboundQueue;
use super::traits::{ChannelAdapter, HealthStatus};
use crate::error::Result;
use crate::{BotId, ChannelType, Envelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

const BACKOFF_CEILING: Duration = Duration::from_secs(30);

struct RunningAdapter {
    adapter: Arc<dyn ChannelAdapter>,
    task: JoinHandle<()>,
}

pub struct ChannelManager {
    adapters: RwLock<HashMap<(BotId, ChannelType), RunningAdapter>>,
    pub queue: Arc<InboundQueue>,
}

impl ChannelManager {
    pub fn new(inbound_queue_capacity: usize) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            queue: Arc::new(InboundQueue::new(inbound_queue_capacity)),
        }
    }

    /// Starts `adapter` for `bot_id`, restarting it with exponential backoff
    /// (capped at 30s) whenever `ChannelAdapter::start` returns an error.
    pub async fn start_adapter(&self, bot_id: BotId, adapter: Arc<dyn ChannelAdapter>) {
        let channel_type = adapter.channel_type();
        let key = (bot_id, channel_type);

        if let Some(existing) = self.adapters.write().await.remove(&key) {
            existing.task.abort();
        }

        let (tx, mut rx) = mpsc::channel(256);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                queue.push(bot_id, event).await;
            }
        });

        let task_adapter = adapter.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match task_adapter.start(tx.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(
                            bot_id = %bot_id,
                            channel = %channel_type,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "channel adapter stopped, restarting"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CEILING);
                    }
                }
            }
        });

        self.adapters.write().await.insert(key, RunningAdapter { adapter, task });
    }

    pub async fn stop_adapter(&self, bot_id: BotId, channel_type: ChannelType) -> Result<()> {
        if let Some(running) = self.adapters.write().await.remove(&(bot_id, channel_type)) {
            running.task.abort();
            running.adapter.stop().await?;
        }
        Ok(())
    }

    pub async fn send(&self, bot_id: BotId, channel_type: ChannelType, envelope: &Envelope) -> Result<()> {
        let adapters = self.adapters.read().await;
        let Some(running) = adapters.get(&(bot_id, channel_type)) else {
            return Err(crate::error::NotFoundError::ChannelConfig {
                bot_id: bot_id.to_string(),
                channel_type: channel_type.to_string(),
            }
            .into());
        };
        running.adapter.send(envelope).await
    }

    pub async fn health(&self, bot_id: BotId, channel_type: ChannelType) -> Result<HealthStatus> {
        let adapters = self.adapters.read().await;
        let Some(running) = adapters.get(&(bot_id, channel_type)) else {
            return Ok(HealthStatus::Down);
        };
        running.adapter.health().await
    }
}
