//! Per-bot bounded inbound queue (`spec.md` §5 backpressure): capacity 1000
//! events/bot; on overflow the oldest *non-active* event is dropped first so
//! a burst of passive channel chatter can't starve a directly-addressed
//! message still waiting to be processed.
//!
//! "Active" here is the cheap push-time heuristic (direct reply to a known
//! bot message), not the Inbound Processor's authoritative activity check
//! (`spec.md` §4.1 step 7) — this queue only needs to triage what to drop,
//! not decide what to persist.

use crate::InboundEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

fn is_likely_active(event: &InboundEvent) -> bool {
    event.reply_to_external_id.is_some()
}

struct BotQueue {
    items: Mutex<VecDeque<InboundEvent>>,
    notify: Notify,
}

pub struct InboundQueue {
    capacity: usize,
    queues: Mutex<HashMap<crate::BotId, Arc<BotQueue>>>,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    async fn queue_for(&self, bot_id: crate::BotId) -> Arc<BotQueue> {
        let mut guard = self.queues.lock().await;
        guard
            .entry(bot_id)
            .or_insert_with(|| {
                Arc::new(BotQueue {
                    items: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    pub async fn push(&self, bot_id: crate::BotId, event: InboundEvent) {
        let queue = self.queue_for(bot_id).await;
        let mut items = queue.items.lock().await;

        if items.len() >= self.capacity {
            if let Some(pos) = items.iter().position(|e| !is_likely_active(e)) {
                items.remove(pos);
                tracing::warn!(bot_id = %bot_id, "inbound queue full, dropped oldest non-active event");
            } else {
                items.pop_front();
                tracing::warn!(bot_id = %bot_id, "inbound queue full and all events active, dropped oldest event");
            }
        }

        items.push_back(event);
        drop(items);
        queue.notify.notify_one();
    }

    /// Pops the next event for `bot_id`, waiting if the queue is empty.
    pub async fn pop(&self, bot_id: crate::BotId) -> InboundEvent {
        let queue = self.queue_for(bot_id).await;
        loop {
            {
                let mut items = queue.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return event;
                }
            }
            queue.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessagePart, Role};

    fn event(reply_to: Option<&str>) -> InboundEvent {
        InboundEvent {
            channel_type: crate::ChannelType::Telegram,
            external_conversation_id: "c1".into(),
            thread_id: None,
            sender_subject: "s1".into(),
            sender_display_name: None,
            self_subject: "self".into(),
            role: Role::User,
            parts: vec![MessagePart::Text { text: "hi".into() }],
            reply_to_external_id: reply_to.map(str::to_string),
            external_message_id: None,
            reaction: None,
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_active_first() {
        let queue = InboundQueue::new(2);
        let bot = crate::BotId::new();

        queue.push(bot, event(Some("active-1"))).await;
        queue.push(bot, event(None)).await;
        queue.push(bot, event(None)).await;

        let first = queue.pop(bot).await;
        assert_eq!(first.reply_to_external_id.as_deref(), Some("active-1"));
    }
}
