//! Event Hub (`spec.md` §2, §5): fan-out of `MessageCreated` and resolver
//! stream action frames to observers, via bounded per-subscriber queues.
//! Slow consumers are dropped with a `lag` frame marker rather than
//! blocking the producer (§5 backpressure).

use crate::{AgentAction, BotId, RouteId};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum HubEvent {
    MessageCreated {
        bot_id: BotId,
        route_id: Option<RouteId>,
        message_id: uuid::Uuid,
    },
    Action {
        bot_id: BotId,
        route_id: RouteId,
        action: ActionFrame,
    },
}

/// `AgentAction` is not `Clone`-free of large payloads in every variant but
/// is cheap enough to clone per subscriber; wrapped in `Arc` to make the
/// broadcast channel's per-clone cost O(1) regardless.
#[derive(Debug, Clone)]
pub struct ActionFrame(pub std::sync::Arc<AgentAction>);

pub struct EventHub {
    tx: broadcast::Sender<HubEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A full subscriber queue causes that subscriber to
    /// miss frames and later observe a `RecvError::Lagged`, which callers
    /// translate into an explicit `AgentAction::Lag` marker (§5, §9).
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_message_created(&self, bot_id: BotId, route_id: Option<RouteId>, message_id: uuid::Uuid) {
        self.publish(HubEvent::MessageCreated { bot_id, route_id, message_id });
    }

    pub fn publish_action(&self, bot_id: BotId, route_id: RouteId, action: AgentAction) {
        self.publish(HubEvent::Action {
            bot_id,
            route_id,
            action: ActionFrame(std::sync::Arc::new(action)),
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();
        let bot_id = BotId::new();
        hub.publish_message_created(bot_id, None, uuid::Uuid::new_v4());

        let event = rx.recv().await.unwrap();
        match event {
            HubEvent::MessageCreated { bot_id: b, .. } => assert_eq!(b, bot_id),
            _ => panic!("wrong event"),
        }
    }
}
