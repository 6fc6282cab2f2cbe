use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::types::{Task, TaskId};

pub const TASK_ID_ENV: &str = "DROVER_TASK_ID";
pub const AGENT_ID_ENV: &str = "DROVER_AGENT_ID";

/// How a supervised executor ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub error: Option<String>,
}

impl ExitOutcome {
    pub fn reason(&self) -> String {
        match (&self.error, self.code) {
            (Some(error), _) => format!("executor wait failed: {}", error),
            (None, Some(code)) => format!("executor exited with status {}", code),
            (None, None) => "executor terminated by signal".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct DispatchHandle {
    pub task_id: TaskId,
    pub pid: Option<u32>,
    /// Resolves when the executor exits, for dispatchers that supervise one.
    pub completion: Option<oneshot::Receiver<ExitOutcome>>,
}

/// Hands a persisted task to whatever executes it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<DispatchHandle>;
}

/// Runs each task as `<program> <args...> <taskId> <agentId>`.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    program: String,
    args: Vec<String>,
}

impl ProcessDispatcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Dispatcher for ProcessDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<DispatchHandle> {
        let task_id = task.id.to_string();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&task_id)
            .arg(&task.agent_id)
            .env(TASK_ID_ENV, &task_id)
            .env(AGENT_ID_ENV, &task.agent_id)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("Failed to spawn executor {}", self.program))?;

        let pid = child.id();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome {
                    success: status.success(),
                    code: status.code(),
                    error: None,
                },
                Err(e) => ExitOutcome {
                    success: false,
                    code: None,
                    error: Some(e.to_string()),
                },
            };
            // Nobody listening is fine.
            let _ = tx.send(outcome);
        });

        log::info!(
            "Dispatched task {} for {} to {} (pid {:?})",
            task.id,
            task.agent_id,
            self.program,
            pid
        );

        Ok(DispatchHandle {
            task_id: task.id,
            pid,
            completion: Some(rx),
        })
    }
}
