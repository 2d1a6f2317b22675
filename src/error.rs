//! Top-level error taxonomy for the meshbot runtime.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
///
/// This is a taxonomy, not a type hierarchy: callers match on the wrapped
/// variant to decide retry/surface/drop behavior per §7 of the runtime spec.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Transient(#[from] RuntimeTransient),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error should be retried with backoff rather than
    /// surfaced or dropped immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether this error should be dropped silently (logged, no reply).
    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Authorization(_))
    }

    /// Whether this error is fatal to the current run (aborts, never retried
    /// locally): integrity violations and database-level failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Sqlx(_))
    }
}

/// Bad input: missing bot id, invalid cron expression, malformed event.
/// Surfaced to the caller; never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("malformed inbound event: {0}")]
    MalformedEvent(String),

    #[error("attachment exceeds size limit of {limit_bytes} bytes: {actual_bytes}")]
    AttachmentTooLarge { limit_bytes: u64, actual_bytes: u64 },

    #[error("invalid bind code")]
    InvalidBindCode,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Sender cannot access the target bot. Dropped silently (logged), no reply.
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("channel identity {0} is not linked to a user and guest access is disallowed")]
    GuestDisallowed(String),

    #[error("user {user_id} is not a member of bot {bot_id}")]
    NotAMember { user_id: String, bot_id: String },

    #[error("bot {bot_id} does not accept messages in status {status}")]
    BotNotAcceptingMessages { bot_id: String, status: String },

    #[error("channel {channel_type} is disabled for bot {bot_id}")]
    ChannelDisabled { bot_id: String, channel_type: String },
}

/// Unknown bot/route/memory id. Surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    #[error("bot not found: {0}")]
    Bot(String),

    #[error("route not found: {0}")]
    Route(String),

    #[error("memory not found: {0}")]
    Memory(String),

    #[error("channel config not found: bot={bot_id} channel={channel_type}")]
    ChannelConfig { bot_id: String, channel_type: String },

    #[error("schedule job not found: {0}")]
    ScheduleJob(String),

    #[error("tool not found: {0}")]
    Tool(String),
}

/// LLM 429/5xx, network timeouts, channel-vendor throttling. Retried with
/// jitter; surfaced after 3 failed attempts as a single user-visible apology.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeTransient {
    #[error("chat provider request failed: {0}")]
    ChatProvider(String),

    #[error("chat provider rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network timeout: {0}")]
    Timeout(String),

    #[error("channel vendor throttled: {0}")]
    ChannelThrottled(String),

    #[error(transparent)]
    Io(#[from] Arc<std::io::Error>),
}

/// Tool invocation failure. Captured as the tool's result text; never aborts
/// a run — the LLM sees the error string and may retry.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool {name} failed: {message}")]
    Failed { name: String, message: String },

    #[error("tool {name} timed out after {timeout_secs}s")]
    TimedOut { name: String, timeout_secs: u64 },

    #[error("tool {name} received invalid input: {message}")]
    InvalidInput { name: String, message: String },

    #[error("unknown tool: {0}")]
    Unknown(String),
}

/// Database constraint violation, corrupt manifest. Fatal; the run aborts
/// and the error is recorded for offline inspection.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("corrupt memory manifest at {path}: {reason}")]
    CorruptManifest { path: String, reason: String },

    #[error("route {route_id} belongs to bot {route_bot_id}, not {expected_bot_id}")]
    RouteBotMismatch {
        route_id: String,
        route_bot_id: String,
        expected_bot_id: String,
    },

    #[error("current_calls ({current}) exceeds max_calls ({max}) for job {job_id}")]
    ScheduleCapExceeded {
        job_id: String,
        current: i64,
        max: i64,
    },
}
