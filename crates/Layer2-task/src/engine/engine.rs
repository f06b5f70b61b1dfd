//! Task Engine
//!
//! Top-level coordinator: intake, approval gating, container acquisition,
//! execution and audit emission. Every failure during execution ends in a
//! `failed` TaskResult; callers only see typed errors for invalid requests.

use crate::agent::{Agent, AgentAction, PlannedAgent};
use crate::container::{LeaseTable, LifecycleManager};
use crate::gc::GarbageCollector;
use crate::runtime::{RuntimeAdapter, RuntimeKind};
use crate::state::TaskStatus;
use crate::store::{TaskIndex, TaskSlot};
use crate::task::{Task, TaskId, TaskRequest, TaskResult};
use bastion_foundation::audit::{AuditStore, Redactor};
use bastion_foundation::{
    best_effort, elapsed_between, ApprovalMode, AuditAction, AuditEvent, AuditLog, BastionConfig,
    ConfiguredProjects, ContainerSpec, Enforcer, Error, GcPolicy, ProjectAllowlist, Result,
    SecurityPolicy, SharedClock, SystemClock,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Actor recorded when the auto-approve timer fires
pub const AUTO_APPROVE_ACTOR: &str = "auto-approve-timeout";

/// Log tail result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTail {
    Output(String),
    /// The task never reached execution
    NoContainer,
}

/// Engine health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub ready: bool,
    pub runtime: RuntimeKind,
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub tracked_containers: usize,
    /// Containers currently leased to a launching or running task
    pub leased_containers: usize,
    pub audit_dropped: u64,
}

pub(crate) struct EngineInner {
    pub tasks: TaskIndex,
    pub enforcer: Arc<Enforcer>,
    pub projects: Arc<dyn ProjectAllowlist>,
    pub lifecycle: Arc<LifecycleManager>,
    pub leases: Arc<LeaseTable>,
    pub audit: AuditLog,
    pub clock: SharedClock,
    pub container_spec: ContainerSpec,
    pub gc_policy: Arc<RwLock<GcPolicy>>,
}

/// Task Engine handle (clone 가능, 내부 상태 공유)
#[derive(Clone)]
pub struct TaskEngine {
    pub(crate) inner: Arc<EngineInner>,
}

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder {
    runtime: Arc<dyn RuntimeAdapter>,
    enforcer: Option<Arc<Enforcer>>,
    projects: Option<Arc<dyn ProjectAllowlist>>,
    audit: Option<AuditLog>,
    clock: Option<SharedClock>,
    container_spec: ContainerSpec,
    gc_policy: GcPolicy,
}

impl EngineBuilder {
    pub fn with_enforcer(mut self, enforcer: Arc<Enforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    pub fn with_security_policy(self, policy: SecurityPolicy) -> Result<Self> {
        Ok(self.with_enforcer(Arc::new(Enforcer::new(policy)?)))
    }

    pub fn with_projects(mut self, projects: Arc<dyn ProjectAllowlist>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_container_spec(mut self, spec: ContainerSpec) -> Self {
        self.container_spec = spec;
        self
    }

    pub fn with_gc_policy(mut self, policy: GcPolicy) -> Self {
        self.gc_policy = policy;
        self
    }

    /// Must run inside a tokio runtime (the default audit log spawns its writer)
    pub fn build(self) -> Result<TaskEngine> {
        self.container_spec.validate()?;
        self.gc_policy.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let enforcer = match self.enforcer {
            Some(enforcer) => enforcer,
            None => Arc::new(Enforcer::new(SecurityPolicy::default())?),
        };
        enforcer
            .policy()
            .ensure_path_base(&self.container_spec.working_dir)?;
        let audit = match self.audit {
            Some(audit) => audit,
            None => AuditLog::in_memory(Arc::clone(&clock))?,
        };
        let projects = self
            .projects
            .unwrap_or_else(|| Arc::new(ConfiguredProjects::allow_all()));

        let lifecycle = Arc::new(LifecycleManager::new(self.runtime, Arc::clone(&clock)));

        Ok(TaskEngine {
            inner: Arc::new(EngineInner {
                tasks: TaskIndex::default(),
                enforcer,
                projects,
                lifecycle,
                leases: Arc::new(LeaseTable::new()),
                audit,
                clock,
                container_spec: self.container_spec,
                gc_policy: Arc::new(RwLock::new(self.gc_policy)),
            }),
        })
    }
}

// ============================================================================
// Construction / accessors
// ============================================================================

impl TaskEngine {
    pub fn builder(runtime: Arc<dyn RuntimeAdapter>) -> EngineBuilder {
        EngineBuilder {
            runtime,
            enforcer: None,
            projects: None,
            audit: None,
            clock: None,
            container_spec: ContainerSpec::default(),
            gc_policy: GcPolicy::default(),
        }
    }

    /// Wire an engine from validated configuration, with an on-disk audit store
    pub fn from_config(config: &BastionConfig, runtime: Arc<dyn RuntimeAdapter>) -> Result<Self> {
        config.validate()?;

        let clock: SharedClock = Arc::new(SystemClock);
        let store = Arc::new(AuditStore::open(config.audit.resolved_db_path())?);
        let audit = AuditLog::start(
            store,
            Redactor::new(&config.audit.redacted_keys),
            Arc::clone(&clock),
            config.audit.queue_capacity,
        );

        Self::builder(runtime)
            .with_security_policy(config.security.clone())?
            .with_projects(Arc::new(ConfiguredProjects::new(&config.projects)?))
            .with_audit(audit)
            .with_clock(clock)
            .with_container_spec(config.container.clone())
            .with_gc_policy(config.gc.clone())
            .build()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.inner.enforcer
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.inner.lifecycle
    }

    /// Collector sharing this engine's lease table and GC policy
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            Arc::clone(&self.inner.lifecycle),
            Arc::clone(&self.inner.leases),
            Arc::clone(&self.inner.gc_policy),
            Arc::clone(&self.inner.clock),
        )
    }

    /// Atomically swap the security policy
    pub fn reload_policy(&self, policy: SecurityPolicy) -> Result<()> {
        policy.ensure_path_base(&self.inner.container_spec.working_dir)?;
        self.inner.enforcer.reload(policy)?;
        info!("Security policy reloaded");
        Ok(())
    }

    pub(crate) fn slot(&self, id: &TaskId) -> Result<Arc<TaskSlot>> {
        self.inner
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.full()))
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.clock.now()
    }
}

// ============================================================================
// Submission / approval
// ============================================================================

impl TaskEngine {
    /// Submit with no plan (the task completes as soon as it runs)
    pub async fn submit(
        &self,
        description: impl Into<String>,
        project: impl Into<String>,
    ) -> Result<Task> {
        self.submit_request(TaskRequest::new(description, project)).await
    }

    pub async fn submit_request(&self, request: TaskRequest) -> Result<Task> {
        if !self.inner.projects.is_project_allowed(&request.project) {
            warn!(project = %request.project, "Project not allowed");
            return Err(Error::ProjectNotAllowed(request.project));
        }

        let task = Task::new(&request, self.now());
        let agent: Arc<dyn Agent> = match &request.agent {
            Some(agent) => Arc::clone(agent),
            None => Arc::new(PlannedAgent::new(request.plan.clone())),
        };
        let slot = Arc::new(TaskSlot::new(task.clone(), agent));
        self.inner.tasks.insert(Arc::clone(&slot));

        let mut created = AuditEvent::new(AuditAction::TaskCreated, task.id.full())
            .with_detail("description", task.description.clone())
            .with_detail("project", task.project.clone());
        if let Some(user) = &task.user {
            created = created.with_actor(user.clone());
        }
        self.inner.audit.record(created);
        info!(task_id = %task.id, project = %task.project, "Task submitted");

        if request.hold {
            return Ok(task);
        }

        match self.approval_reason(&slot) {
            None => {
                self.claim_launch(&slot)?;
                Ok(self.launch(&slot).await)
            }
            Some(reason) => {
                self.request_approval(&slot, reason)?;
                Ok(slot.snapshot())
            }
        }
    }

    /// Grant approval and start execution
    pub async fn approve(&self, id: &TaskId, actor: impl Into<String>) -> Result<Task> {
        let actor = actor.into();
        let slot = self.slot(id)?;

        {
            let mut task = slot.task.lock();
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::NeedsApproval)
                || slot.launching.swap(true, Ordering::SeqCst)
            {
                return Err(Error::invalid_transition(id, task.status, TaskStatus::Running));
            }
            task.approved_by = Some(actor.clone());
            self.inner.audit.record(
                AuditEvent::new(AuditAction::ApprovalGranted, id.full()).with_actor(actor.clone()),
            );
        }

        info!(task_id = %id, actor = %actor, "Task approved");
        Ok(self.launch(&slot).await)
    }

    /// Start a held `pending` task without human sign-off
    pub async fn start(&self, id: &TaskId) -> Result<Task> {
        let slot = self.slot(id)?;

        let status = slot.task.lock().status;
        match status {
            TaskStatus::Pending => {}
            TaskStatus::NeedsApproval => {
                let reason = slot.task.lock().approval_reason.clone().unwrap_or_default();
                return Err(Error::ApprovalRequired(reason));
            }
            other => return Err(Error::invalid_transition(id, other, TaskStatus::Running)),
        }

        if let Some(reason) = self.approval_reason(&slot) {
            return Err(Error::ApprovalRequired(reason));
        }

        self.claim_launch(&slot)?;
        Ok(self.launch(&slot).await)
    }

    /// Why this task needs a human, if it does
    fn approval_reason(&self, slot: &TaskSlot) -> Option<String> {
        let enforcer = &self.inner.enforcer;
        let plan = slot.agent.plan();
        let commands: Vec<String> = plan
            .iter()
            .filter_map(|a| match a {
                AgentAction::Exec { command } => Some(command.clone()),
                _ => None,
            })
            .collect();

        if let Some(reason) = enforcer.approval_reason(&commands) {
            return Some(reason);
        }
        if enforcer.resolve_approval_mode() != ApprovalMode::OnMiss {
            return None;
        }
        plan.iter().find_map(|a| match a {
            AgentAction::ReadFile { path } | AgentAction::WriteFile { path, .. }
                if !enforcer.is_path_allowed(path) =>
            {
                Some(format!("path '{}' fails the path rules", path))
            }
            _ => None,
        })
    }

    fn request_approval(&self, slot: &Arc<TaskSlot>, reason: String) -> Result<()> {
        let mode = self.inner.enforcer.resolve_approval_mode();
        let task = self.transition(
            slot,
            TaskStatus::NeedsApproval,
            |t| {
                t.approval_required = true;
                t.approval_reason = Some(reason.clone());
            },
            |_, t| {
                vec![AuditEvent::new(AuditAction::ApprovalRequested, t.id.full())
                    .with_detail("reason", reason.clone())
                    .with_detail("mode", mode.as_str())]
            },
        )?;
        slot.notify();
        info!(task_id = %task.id, reason = %reason, "Approval requested");

        if mode == ApprovalMode::OnMiss {
            if let Some(after) = self.inner.enforcer.policy().auto_approve_timeout() {
                self.spawn_auto_approve(task.id, after);
            }
        }
        Ok(())
    }

    fn spawn_auto_approve(&self, id: TaskId, after: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let waiting = engine
                .slot(&id)
                .map(|s| s.task.lock().status == TaskStatus::NeedsApproval)
                .unwrap_or(false);
            if waiting {
                if let Err(e) = engine.approve(&id, AUTO_APPROVE_ACTOR).await {
                    debug!(task_id = %id, error = %e, "Auto-approve skipped");
                }
            }
        });
    }

    /// Claim the single launch of a task
    fn claim_launch(&self, slot: &TaskSlot) -> Result<()> {
        let task = slot.task.lock();
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::NeedsApproval)
            || slot.launching.swap(true, Ordering::SeqCst)
        {
            return Err(Error::invalid_transition(task.id, task.status, TaskStatus::Running));
        }
        Ok(())
    }

    /// Compare-and-set transition under the slot lock
    ///
    /// `events` are recorded while the lock is held, which keeps a task's
    /// audit trail in causal order even when cancel races execution.
    pub(crate) fn transition(
        &self,
        slot: &TaskSlot,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
        events: impl FnOnce(TaskStatus, &Task) -> Vec<AuditEvent>,
    ) -> Result<Task> {
        let mut task = slot.task.lock();
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(Error::invalid_transition(task.id, from, to));
        }
        task.status = to;
        mutate(&mut task);
        for event in events(from, &task) {
            self.inner.audit.record(event);
        }
        Ok(task.clone())
    }

    /// Record `event` only while the task is not terminal
    pub(crate) fn record_if_active(&self, slot: &TaskSlot, event: AuditEvent) -> bool {
        let task = slot.task.lock();
        if task.status.is_terminal() {
            return false;
        }
        self.inner.audit.record(event);
        true
    }
}

// ============================================================================
// Cancellation
// ============================================================================

impl TaskEngine {
    /// Cancel from any non-terminal state
    pub async fn cancel(&self, id: &TaskId) -> Result<Task> {
        let slot = self.slot(id)?;
        let now = self.now();

        let task = self.transition(
            &slot,
            TaskStatus::Cancelled,
            |t| {
                let mut result = TaskResult::failure("cancelled");
                if let Some(started) = t.started_at {
                    result.duration = elapsed_between(started, now);
                }
                t.completed_at = Some(now);
                t.result = Some(result);
            },
            |from, t| {
                let mut events = Vec::new();
                if from == TaskStatus::NeedsApproval {
                    events.push(
                        AuditEvent::new(AuditAction::ApprovalDenied, t.id.full())
                            .with_detail("reason", "cancelled while awaiting approval"),
                    );
                }
                events.push(
                    AuditEvent::new(AuditAction::TaskFailed, t.id.full())
                        .with_detail("status", TaskStatus::Cancelled.as_str())
                        .with_detail("from", from.as_str())
                        .with_detail("error", "cancelled"),
                );
                events
            },
        );

        let task = match task {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id = %id, error = %e, "Cancel rejected");
                return Err(e);
            }
        };
        slot.cancel.send_replace(true);

        if let Some(container_id) = &task.container_id {
            best_effort(
                "container teardown",
                self.inner.lifecycle.destroy_container(container_id, true).await,
            );
        }

        info!(task_id = %id, "Task cancelled");
        slot.notify();
        Ok(slot.snapshot())
    }
}

// ============================================================================
// Queries
// ============================================================================

impl TaskEngine {
    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        Ok(self.slot(id)?.snapshot())
    }

    /// All tasks, newest first
    pub fn list_tasks(&self) -> Vec<Task> {
        self.inner
            .tasks
            .newest_first()
            .iter()
            .map(|s| s.snapshot())
            .collect()
    }

    /// Non-terminal tasks, newest first
    pub fn list_active_tasks(&self) -> Vec<Task> {
        self.list_tasks().into_iter().filter(|t| t.is_active()).collect()
    }

    /// Wait until the task is terminal
    pub async fn wait(&self, id: &TaskId, timeout: Duration) -> Result<Task> {
        let slot = self.slot(id)?;
        let mut rx = slot.status.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_terminal()).await.is_ok()
        })
        .await;

        match reached {
            Ok(true) => Ok(slot.snapshot()),
            Ok(false) => Err(Error::Internal(format!("task {} status channel closed", id))),
            Err(_) => Err(Error::Timeout(format!(
                "task {} not finished after {:?}",
                id, timeout
            ))),
        }
    }

    /// Last `tail` lines of the task's output
    pub async fn get_logs(&self, id: &TaskId, tail: usize) -> Result<LogTail> {
        let task = self.get_task(id)?;
        let Some(container_id) = &task.container_id else {
            return Ok(LogTail::NoContainer);
        };

        match self.inner.lifecycle.get_container_logs(container_id, tail).await {
            Ok(text) => Ok(LogTail::Output(text)),
            Err(Error::ContainerNotFound(_)) => match &task.result {
                Some(result) => Ok(LogTail::Output(tail_lines(&result.output, tail))),
                None => Ok(LogTail::NoContainer),
            },
            Err(e) => Err(e),
        }
    }

    /// Newest-first audit page
    pub fn query_audit(&self, limit: usize, offset: usize) -> Result<Vec<AuditEvent>> {
        self.inner.audit.query(limit, offset)
    }

    pub async fn status(&self) -> EngineStatus {
        let tasks = self.inner.tasks.newest_first();
        let active = tasks.iter().filter(|s| s.snapshot().is_active()).count();
        EngineStatus {
            ready: self.inner.lifecycle.ping().await.is_ok(),
            runtime: self.inner.lifecycle.runtime_kind(),
            active_tasks: active,
            total_tasks: tasks.len(),
            tracked_containers: self.inner.lifecycle.tracked_count(),
            leased_containers: self.inner.leases.busy_count(),
            audit_dropped: self.inner.audit.dropped(),
        }
    }
}

fn tail_lines(text: &str, tail: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(tail);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 10), "a");
        assert_eq!(tail_lines("", 3), "");
    }
}
