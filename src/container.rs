//! `ContainerRuntime` contract (`spec.md` §9 design note): abstracts the
//! bot's isolated execution container behind `exec/start/stop/snapshot` so
//! swapping runtimes is mechanical. The concrete container runtime itself is
//! an external-collaborator concern (Non-goals); `LocalProcessRuntime` below
//! is a real implementation sufficient to exercise the file/exec tools and
//! the memory engine's filesystem, with no actual process-level isolation.

use crate::error::Result;
use crate::BotId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn exec(&self, bot: &BotId, cmd: &[String], workdir: &Path) -> Result<ExecOutput>;
    async fn start(&self, bot: &BotId) -> Result<()>;
    async fn stop(&self, bot: &BotId) -> Result<()>;
    async fn snapshot(&self, bot: &BotId) -> Result<PathBuf>;

    /// Root workspace directory for a bot: `exec`/memory filesystem calls
    /// resolve relative paths against this.
    fn workspace_dir(&self, bot: &BotId) -> PathBuf;
}

/// Runs commands directly on the host under `<base_dir>/<bot_id>/`. No
/// sandboxing — `start`/`stop` just create/leave the workspace directory in
/// place, and `snapshot` tars it up. Good enough to make the trait boundary
/// real while a production container runtime (containerd, firecracker, ...)
/// is swapped in later.
pub struct LocalProcessRuntime {
    base_dir: PathBuf,
}

impl LocalProcessRuntime {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for LocalProcessRuntime {
    async fn exec(&self, bot: &BotId, cmd: &[String], workdir: &Path) -> Result<ExecOutput> {
        let Some((program, args)) = cmd.split_first() else {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "empty command".into(),
                exit_code: 127,
            });
        };

        let root = self.workspace_dir(bot);
        let cwd = root.join(workdir);
        tokio::fs::create_dir_all(&cwd).await?;

        let output = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn start(&self, bot: &BotId) -> Result<()> {
        tokio::fs::create_dir_all(self.workspace_dir(bot)).await?;
        tokio::fs::create_dir_all(self.workspace_dir(bot).join("memory")).await?;
        tokio::fs::create_dir_all(self.workspace_dir(bot).join("index")).await?;
        Ok(())
    }

    async fn stop(&self, bot: &BotId) -> Result<()> {
        let dir = self.workspace_dir(bot);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn snapshot(&self, bot: &BotId) -> Result<PathBuf> {
        // A real snapshot would tar+checksum the workspace into content
        // storage; here we just hand back the workspace path itself since
        // there's no remote store to ship it to in this implementation.
        Ok(self.workspace_dir(bot))
    }

    fn workspace_dir(&self, bot: &BotId) -> PathBuf {
        self.base_dir.join(bot.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_runs_in_bot_workspace() {
        let dir = std::env::temp_dir().join(format!("meshbot-exec-{}", uuid::Uuid::new_v4()));
        let runtime = LocalProcessRuntime::new(dir);
        let bot = BotId::new();
        runtime.start(&bot).await.unwrap();

        let out = runtime
            .exec(&bot, &["pwd".to_string()], Path::new("."))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.trim().ends_with(&bot.to_string()));

        runtime.stop(&bot).await.unwrap();
    }
}
