//! Agent seam
//!
//! The engine asks an `Agent` for one action at a time and feeds back
//! what happened. Every action passes through the Enforcer before it
//! reaches the container.

use crate::task::Task;
use async_trait::async_trait;
use bastion_foundation::Result;
use serde::{Deserialize, Serialize};

/// Something the agent wants done inside the task's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    Exec { command: String },
    ReadFile { path: String },
    WriteFile { path: String, content: String },
}

impl AgentAction {
    pub fn exec(command: impl Into<String>) -> Self {
        Self::Exec {
            command: command.into(),
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::ReadFile { path: path.into() }
    }

    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Result of one action, as seen by the agent
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: AgentAction,
    /// Exit code for `Exec`, `None` for file actions
    pub exit_code: Option<i64>,
    /// Command output or file content
    pub output: String,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Actions known ahead of time, used for on-miss approval pre-checks
    fn plan(&self) -> Vec<AgentAction> {
        Vec::new()
    }

    /// Next action, or `None` when the task is done
    async fn next_action(&self, task: &Task, history: &[ActionOutcome])
        -> Result<Option<AgentAction>>;
}

/// Replays a fixed list of actions
#[derive(Debug, Clone, Default)]
pub struct PlannedAgent {
    actions: Vec<AgentAction>,
}

impl PlannedAgent {
    pub fn new(actions: Vec<AgentAction>) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl Agent for PlannedAgent {
    fn plan(&self) -> Vec<AgentAction> {
        self.actions.clone()
    }

    async fn next_action(
        &self,
        _task: &Task,
        history: &[ActionOutcome],
    ) -> Result<Option<AgentAction>> {
        Ok(self.actions.get(history.len()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRequest;

    #[tokio::test]
    async fn test_planned_agent_replays_in_order() {
        let agent = PlannedAgent::new(vec![AgentAction::exec("ls"), AgentAction::read("a.txt")]);
        let task = Task::new(&TaskRequest::new("t", "p"), chrono::Utc::now());

        let first = agent.next_action(&task, &[]).await.unwrap();
        assert_eq!(first, Some(AgentAction::exec("ls")));

        let history = vec![ActionOutcome {
            action: AgentAction::exec("ls"),
            exit_code: Some(0),
            output: String::new(),
        }];
        let second = agent.next_action(&task, &history).await.unwrap();
        assert_eq!(second, Some(AgentAction::read("a.txt")));

        let mut done = history.clone();
        done.push(ActionOutcome {
            action: AgentAction::read("a.txt"),
            exit_code: None,
            output: "hi".into(),
        });
        assert_eq!(agent.next_action(&task, &done).await.unwrap(), None);
    }
}
