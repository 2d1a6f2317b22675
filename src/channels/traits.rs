//! The channel adapter contract (`spec.md` §4.5, §6): each adapter owns a
//! connection to one external messaging vendor and both emits normalized
//! `InboundEvent`s and accepts `Envelope`s to send. Object-safe directly
//! (via `async_trait`) rather than the teacher's native-async-fn-in-trait +
//! blanket `*Dyn` split, matching the idiom this crate already uses for
//! `ChatProvider`/`ContainerRuntime`.

use crate::error::Result;
use crate::{ChannelType, Envelope, InboundEvent};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Connects to the vendor and begins forwarding normalized inbound
    /// events into `tx` until `stop` is called or the task is dropped.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn send(&self, envelope: &Envelope) -> Result<()>;

    async fn health(&self) -> Result<HealthStatus>;
}
