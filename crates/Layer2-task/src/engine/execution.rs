//! Task execution
//!
//! `launch` acquires a container under a lease and moves the task to
//! `running`; `run` drives the agent inside it and always ends with the
//! guaranteed-cleanup step (retain or destroy, then release the lease).

use super::{TaskEngine, AUTO_APPROVE_ACTOR};
use crate::agent::{ActionOutcome, AgentAction};
use crate::container::{Container, ContainerOwner, ContainerRequest, Retention};
use crate::runtime::ExecOptions;
use crate::state::TaskStatus;
use crate::store::TaskSlot;
use crate::task::{Task, TaskResult};
use bastion_foundation::policy::normalize_path;
use bastion_foundation::{best_effort, elapsed_between, ApprovalMode, AuditAction, AuditEvent};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What the agent loop produced
#[derive(Debug, Default)]
struct Outcome {
    success: bool,
    output: String,
    executed: Vec<String>,
    written: Vec<String>,
    error: Option<String>,
}

impl Outcome {
    fn fail(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl TaskEngine {
    /// Acquire a container and start the run loop
    ///
    /// The caller must have claimed the launch. Returns the task as of
    /// the `running` transition (or its failure).
    pub(crate) async fn launch(&self, slot: &Arc<TaskSlot>) -> Task {
        let inner = &self.inner;
        let task = slot.snapshot();
        let container_id = inner.lifecycle.generate_container_id();

        if !inner.leases.lease(&container_id, task.id) {
            self.fail_launch(slot, "container id already leased".to_string());
            return slot.snapshot();
        }

        let request = ContainerRequest {
            id: container_id.clone(),
            owner: ContainerOwner {
                task_id: task.id,
                project: task.project.clone(),
                user: task.user.clone(),
            },
            spec: inner.container_spec.clone(),
        };

        let container = match inner.lifecycle.create_container(request).await {
            Ok(container) => container,
            Err(e) => {
                inner.leases.release(&container_id);
                error!(task_id = %task.id, error = %e, "Container acquisition failed");
                self.fail_launch(slot, format!("container acquisition failed: {}", e));
                return slot.snapshot();
            }
        };

        let now = self.now();
        let runtime = container.runtime;
        let started = self.transition(
            slot,
            TaskStatus::Running,
            |t| {
                t.started_at = Some(now);
                t.container_id = Some(container_id.clone());
            },
            |_, t| {
                vec![AuditEvent::new(AuditAction::TaskStarted, t.id.full())
                    .with_detail("container_id", container_id.to_string())
                    .with_detail("runtime", runtime.as_str())]
            },
        );

        let running = match started {
            Ok(task) => task,
            Err(e) => {
                // cancelled while the container was being created
                debug!(task_id = %task.id, error = %e, "Launch lost to a terminal transition");
                best_effort(
                    "container teardown",
                    inner.lifecycle.destroy_container(&container_id, true).await,
                );
                inner.leases.release(&container_id);
                return slot.snapshot();
            }
        };

        info!(task_id = %task.id, container_id = %container_id, "Task running");
        slot.notify();

        let engine = self.clone();
        let slot = Arc::clone(slot);
        tokio::spawn(async move { engine.run(slot, container).await });
        running
    }

    fn fail_launch(&self, slot: &TaskSlot, error: String) {
        let now = self.now();
        let result = self.transition(
            slot,
            TaskStatus::Failed,
            |t| {
                t.completed_at = Some(now);
                t.result = Some(TaskResult::failure(error.clone()));
            },
            |_, t| {
                vec![AuditEvent::new(AuditAction::TaskFailed, t.id.full())
                    .with_detail("status", TaskStatus::Failed.as_str())
                    .with_detail("error", error.clone())]
            },
        );
        if result.is_ok() {
            slot.notify();
        }
        slot.launching.store(false, Ordering::SeqCst);
    }

    async fn run(self, slot: Arc<TaskSlot>, container: Container) {
        let mut cancel = slot.cancel.subscribe();
        let task_id = slot.id();

        let outcome = tokio::select! {
            outcome = AssertUnwindSafe(self.drive(&slot, &container)).catch_unwind() => {
                Some(outcome.unwrap_or_else(|panic| {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(task_id = %task_id, panic = %msg, "Agent loop panicked");
                    Outcome::default().fail(format!("internal error: {}", msg))
                }))
            }
            _ = async { let _ = cancel.wait_for(|c| *c).await; } => None,
        };

        let now = self.now();
        let mut terminal = None;

        if let Some(outcome) = outcome {
            let status = if outcome.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            let won = self.transition(
                &slot,
                status,
                |t| {
                    let duration = t
                        .started_at
                        .map(|s| elapsed_between(s, now))
                        .unwrap_or_default();
                    t.completed_at = Some(now);
                    t.result = Some(TaskResult {
                        success: outcome.success,
                        output: outcome.output.clone(),
                        modified_files: outcome.written.clone(),
                        executed_commands: outcome.executed.clone(),
                        duration,
                        error: outcome.error.clone(),
                    });
                },
                |_, _| Vec::new(),
            );
            if let Ok(task) = won {
                terminal = Some(task);
            }
        }

        // guaranteed cleanup
        let final_status = slot.snapshot().status;
        let policy = self.inner.gc_policy.read().clone();
        let retention = match final_status {
            TaskStatus::Completed if !policy.preserve_completed().is_zero() => {
                Some(Retention::Completed { at: now })
            }
            TaskStatus::Failed if !policy.preserve_failed().is_zero() => {
                Some(Retention::Failed { at: now })
            }
            _ => None,
        };
        match retention {
            Some(retention) => {
                debug!(container_id = %container.id, "Container retained after task");
                self.inner.lifecycle.mark_retained(&container.id, retention);
            }
            None => {
                best_effort(
                    "container teardown",
                    self.inner.lifecycle.destroy_container(&container.id, true).await,
                );
            }
        }
        self.inner.leases.release(&container.id);

        if let Some(task) = terminal {
            let result = task.result.clone().unwrap_or_default();
            let mut event = AuditEvent::new(
                if result.success {
                    AuditAction::TaskCompleted
                } else {
                    AuditAction::TaskFailed
                },
                task.id.full(),
            )
            .with_detail("status", task.status.as_str())
            .with_detail("commands", result.executed_commands.len() as u64)
            .with_detail("modified_files", result.modified_files.clone())
            .with_detail(
                "duration_ms",
                u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            );
            if let Some(error) = &result.error {
                event = event.with_detail("error", error.clone());
            }
            self.inner.audit.record(event);

            if result.success {
                info!(task_id = %task.id, "Task completed");
            } else {
                warn!(task_id = %task.id, error = ?result.error, "Task failed");
            }
        }

        slot.notify();
    }

    /// Agent loop; every action is authorized right before it runs
    async fn drive(&self, slot: &TaskSlot, container: &Container) -> Outcome {
        let inner = &self.inner;
        let agent = Arc::clone(&slot.agent);
        let tolerate_misses = self.tolerates_allowlist_misses(slot);
        let budget = container.spec.limits.timeout();
        let started = Instant::now();
        let working_dir = container.spec.working_dir.clone();

        let mut outcome = Outcome::default();
        let mut history: Vec<ActionOutcome> = Vec::new();

        loop {
            let snapshot = slot.snapshot();
            let action = match agent.next_action(&snapshot, &history).await {
                Ok(Some(action)) => action,
                Ok(None) => break,
                Err(e) => return outcome.fail(format!("agent error: {}", e)),
            };

            match &action {
                AgentAction::Exec { command } => {
                    if let Err(e) = inner.enforcer.authorize_command(command, tolerate_misses) {
                        return outcome.fail(format!("policy denied: {}", e));
                    }

                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return outcome.fail(exhausted(budget, command));
                    }

                    let options = ExecOptions::default().with_timeout(remaining);
                    let result = match inner
                        .lifecycle
                        .exec_in_container(&container.id, command, options)
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => return outcome.fail(format!("exec failed: {}", e)),
                    };

                    outcome.executed.push(command.clone());
                    let combined = result.combined();
                    outcome.output.push_str(&combined);

                    self.record_if_active(
                        slot,
                        AuditEvent::new(AuditAction::CommandExecuted, snapshot.id.full())
                            .with_detail("command", command.clone())
                            .with_detail("exit_code", result.exit_code)
                            .with_detail("timed_out", result.timed_out)
                            .with_detail(
                                "duration_ms",
                                u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                            ),
                    );

                    if result.timed_out {
                        return outcome.fail(format!(
                            "command '{}' killed after {}s timeout",
                            command,
                            remaining.as_secs().max(1)
                        ));
                    }
                    if result.exit_code != 0 {
                        return outcome.fail(format!(
                            "command '{}' exited with code {}",
                            command, result.exit_code
                        ));
                    }

                    history.push(ActionOutcome {
                        action: action.clone(),
                        exit_code: Some(result.exit_code),
                        output: combined,
                    });
                }

                AgentAction::ReadFile { path } => {
                    if let Err(e) = inner.enforcer.authorize_path(path) {
                        return outcome.fail(format!("policy denied: {}", e));
                    }
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return outcome.fail(exhausted(budget, &format!("read {}", path)));
                    }
                    let options = ExecOptions::default().with_timeout(remaining);
                    let content = match inner
                        .lifecycle
                        .read_file(&container.id, path, options)
                        .await
                    {
                        Ok(content) => content,
                        Err(e) => return outcome.fail(format!("read failed: {}", e)),
                    };

                    self.record_if_active(
                        slot,
                        AuditEvent::new(AuditAction::FileRead, snapshot.id.full())
                            .with_detail("path", normalize_path(path, &working_dir))
                            .with_detail("bytes", content.len() as u64),
                    );
                    history.push(ActionOutcome {
                        action: action.clone(),
                        exit_code: None,
                        output: content,
                    });
                }

                AgentAction::WriteFile { path, content } => {
                    if let Err(e) = inner.enforcer.authorize_path(path) {
                        return outcome.fail(format!("policy denied: {}", e));
                    }
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return outcome.fail(exhausted(budget, &format!("write {}", path)));
                    }
                    let options = ExecOptions::default().with_timeout(remaining);
                    if let Err(e) = inner
                        .lifecycle
                        .write_file(&container.id, path, content, options)
                        .await
                    {
                        return outcome.fail(format!("write failed: {}", e));
                    }

                    let resolved = normalize_path(path, &working_dir);
                    self.record_if_active(
                        slot,
                        AuditEvent::new(AuditAction::FileWritten, snapshot.id.full())
                            .with_detail("path", resolved.clone())
                            .with_detail("bytes", content.len() as u64),
                    );
                    outcome.written.push(resolved);
                    history.push(ActionOutcome {
                        action: action.clone(),
                        exit_code: None,
                        output: String::new(),
                    });
                }
            }
        }

        // diff against the working tree
        if let Some(changed) = best_effort(
            "modified file scan",
            inner.lifecycle.changed_files(&container.id).await,
        ) {
            outcome.written.extend(changed);
        }
        outcome.written.sort();
        outcome.written.dedup();
        outcome.success = true;
        outcome
    }

    /// Allowlist misses pass only for on-miss tasks a human signed off on
    ///
    /// Under `always` every task is approved, so approval says nothing
    /// about the commands; the timer approves without anyone looking.
    fn tolerates_allowlist_misses(&self, slot: &TaskSlot) -> bool {
        if self.inner.enforcer.resolve_approval_mode() != ApprovalMode::OnMiss {
            return false;
        }
        slot.task
            .lock()
            .approved_by
            .as_deref()
            .is_some_and(|actor| actor != AUTO_APPROVE_ACTOR)
    }
}

fn exhausted(budget: Duration, what: &str) -> String {
    format!(
        "task timeout of {}s exhausted before '{}'",
        budget.as_secs(),
        what
    )
}
