//! Built-in MCP tool executors (`spec.md` §4.4): `send`, `react`,
//! `get_contacts`, `search_memory`, `search_inbox`, `compact_memory`,
//! `schedule`, `list`/`read`/`write`/`edit`/`exec`, `web_search`,
//! `email_send`. Each is
//! a thin [`crate::mcp::ToolExecutor`] wrapping one of the core stores;
//! federated tools are merged in separately by the gateway itself.

mod contacts;
mod email;
mod filesystem;
mod memory_tools;
mod react;
mod schedule;
mod send;
mod web_search;

use std::path::{Path, PathBuf};

use crate::error::{Result, ToolError};

/// Joins `relative` onto `root`, rejecting any path that would escape it
/// (`..` segments, absolute paths). Every filesystem tool goes through this
/// so a bot's `exec`/`read`/`write` calls can't reach outside its own
/// container workspace.
pub(crate) fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(ToolError::InvalidInput {
            name: "filesystem".into(),
            message: format!("path must be relative to the workspace: {relative}"),
        }
        .into());
    }
    if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(ToolError::InvalidInput {
            name: "filesystem".into(),
            message: format!("path escapes the workspace: {relative}"),
        }
        .into());
    }
    Ok(root.join(candidate))
}

/// Registers every built-in tool against `gateway`, wiring each to the
/// shared service handles in `deps`. Called once from `main.rs` after the
/// gateway is constructed and before any channel adapter starts.
pub fn register_builtins(gateway: &mut crate::mcp::McpGateway, deps: &crate::Deps) {
    let routes = std::sync::Arc::new(crate::routes::RouteStore::new(deps.pool.clone()));
    let inbox = std::sync::Arc::new(crate::inbox::InboxStore::new(deps.pool.clone()));
    let schedules = std::sync::Arc::new(crate::scheduler::ScheduleStore::new(deps.pool.clone()));

    gateway.register(std::sync::Arc::new(send::SendTool::new(
        deps.channels.clone(),
        routes.clone(),
    )));
    gateway.register(std::sync::Arc::new(react::ReactTool::new(
        deps.channels.clone(),
        routes.clone(),
    )));
    gateway.register(std::sync::Arc::new(contacts::GetContactsTool::new(routes.clone())));
    gateway.register(std::sync::Arc::new(memory_tools::SearchMemoryTool::new(deps.memory.clone())));
    gateway.register(std::sync::Arc::new(memory_tools::SearchInboxTool::new(inbox.clone())));
    gateway.register(std::sync::Arc::new(memory_tools::CompactMemoryTool::new(deps.memory.clone())));
    gateway.register(std::sync::Arc::new(schedule::ScheduleTool::new(schedules, routes)));

    gateway.register(std::sync::Arc::new(filesystem::ListTool::new(deps.container.clone())));
    gateway.register(std::sync::Arc::new(filesystem::ReadTool::new(deps.container.clone())));
    gateway.register(std::sync::Arc::new(filesystem::WriteTool::new(deps.container.clone())));
    gateway.register(std::sync::Arc::new(filesystem::EditTool::new(deps.container.clone())));
    gateway.register(std::sync::Arc::new(filesystem::ExecTool::new(deps.container.clone())));

    gateway.register(std::sync::Arc::new(web_search::WebSearchTool::new(deps.config.clone())));
    gateway.register(std::sync::Arc::new(email::EmailSendTool::new(deps.channels.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_escape() {
        let root = Path::new("/data/bots/b1");
        assert!(safe_join(root, "../../etc/passwd").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert_eq!(safe_join(root, "notes/today.md").unwrap(), root.join("notes/today.md"));
    }
}
