//! Task definition and types

use crate::agent::{Agent, AgentAction};
use crate::container::ContainerId;
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Full hyphenated form, used as the audit correlation key
    pub fn full(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl FromStr for TaskId {
    type Err = bastion_foundation::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| bastion_foundation::Error::TaskNotFound(s.to_string()))
    }
}

/// A unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Free-text instruction
    pub description: String,

    /// Logical workspace selector
    pub project: String,

    /// Submitting user (used for per-user container quotas)
    pub user: Option<String>,

    /// Current status
    pub status: TaskStatus,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the task started executing
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Container assigned for execution
    pub container_id: Option<ContainerId>,

    /// Outcome, set once terminal
    pub result: Option<TaskResult>,

    /// Whether human approval was requested
    pub approval_required: bool,

    /// Why approval was requested
    pub approval_reason: Option<String>,

    /// Who approved the task
    pub approved_by: Option<String>,
}

impl Task {
    pub(crate) fn new(request: &TaskRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            description: request.description.clone(),
            project: request.project.clone(),
            user: request.user.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            container_id: None,
            result: None,
            approval_required: false,
            approval_reason: None,
            approved_by: None,
        }
    }

    /// Check if task is still active (not terminal)
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Get execution duration if task has started
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some((end - start).to_std().unwrap_or_default())
    }
}

/// Result of task execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,

    /// Captured output text
    pub output: String,

    /// Files changed inside the container's working tree
    pub modified_files: Vec<String>,

    /// Commands that actually ran, in order
    pub executed_commands: Vec<String>,

    /// Wall-clock execution time
    pub duration: Duration,

    /// Error message on failure
    pub error: Option<String>,
}

impl TaskResult {
    /// Create a failure result with no execution history
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// TaskRequest
// ============================================================================

/// Submission payload
///
/// ```ignore
/// let request = TaskRequest::new("run the tests", "web")
///     .with_user("alice")
///     .with_commands(["cargo test"]);
/// let task = engine.submit_request(request).await?;
/// ```
#[derive(Clone)]
pub struct TaskRequest {
    pub description: String,
    pub project: String,
    pub user: Option<String>,
    /// Actions replayed by the default planned agent
    pub plan: Vec<AgentAction>,
    /// Custom agent; overrides `plan`
    pub agent: Option<Arc<dyn Agent>>,
    /// Stay in `pending` until `start`/`approve`
    pub hold: bool,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            project: project.into(),
            user: None,
            plan: Vec::new(),
            agent: None,
            hold: false,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_action(mut self, action: AgentAction) -> Self {
        self.plan.push(action);
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan
            .extend(commands.into_iter().map(|c| AgentAction::Exec { command: c.into() }));
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn hold(mut self) -> Self {
        self.hold = true;
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("description", &self.description)
            .field("project", &self.project)
            .field("user", &self.user)
            .field("plan", &self.plan)
            .field("custom_agent", &self.agent.is_some())
            .field("hold", &self.hold)
            .finish()
    }
}
