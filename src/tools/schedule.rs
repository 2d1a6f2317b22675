//! `schedule` tool (`spec.md` §4.6): lets a bot register a cron job against
//! one of its own routes, firing a synthetic `Schedule`-role inbound event.

use crate::chat_provider::ToolSpec;
use crate::error::{Result, ToolError};
use crate::mcp::ToolExecutor;
use crate::routes::RouteStore;
use crate::scheduler::ScheduleStore;
use crate::BotId;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, JsonSchema)]
struct Args {
    /// Route id from `get_contacts` the job will fire against.
    target: String,
    /// Standard 5-field cron expression (minute hour day-of-month month
    /// day-of-week), evaluated in UTC. No seconds field.
    cron: String,
    /// Instruction text delivered to this bot as the fired event's body.
    command: String,
    /// Caps how many times the job may fire before auto-disabling.
    #[serde(default = "default_max_calls")]
    max_calls: i64,
}

fn default_max_calls() -> i64 {
    i64::MAX
}

pub struct ScheduleTool {
    schedules: Arc<ScheduleStore>,
    routes: Arc<RouteStore>,
}

impl ScheduleTool {
    pub fn new(schedules: Arc<ScheduleStore>, routes: Arc<RouteStore>) -> Self {
        Self { schedules, routes }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ScheduleTool {
    fn name(&self) -> &str {
        "schedule"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Schedule a recurring or one-off cron job that delivers an instruction back to this bot on a route from get_contacts.".into(),
            parameters: serde_json::to_value(schemars::schema_for!(Args)).unwrap_or(serde_json::Value::Null),
        }
    }

    async fn invoke(&self, bot_id: BotId, input: serde_json::Value) -> Result<serde_json::Value> {
        let args: Args = serde_json::from_value(input).map_err(|e| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;

        if args.max_calls < 1 {
            return Err(ToolError::InvalidInput {
                name: self.name().to_string(),
                message: "max_calls must be at least 1".into(),
            }
            .into());
        }

        let route_id = args.target.parse().map_err(|_| ToolError::InvalidInput {
            name: self.name().to_string(),
            message: format!("not a valid route id: {}", args.target),
        })?;
        let route = self.routes.get(route_id).await?;
        if route.bot_id != bot_id {
            return Err(ToolError::InvalidInput {
                name: self.name().to_string(),
                message: "route does not belong to this bot".into(),
            }
            .into());
        }

        let job = self
            .schedules
            .create_job(bot_id, route.id, route.channel_type, &args.cron, &args.command, args.max_calls)
            .await?;

        Ok(serde_json::json!({
            "job_id": job.id.to_string(),
            "next_run_at": job.next_run_at.to_rfc3339(),
        }))
    }
}
