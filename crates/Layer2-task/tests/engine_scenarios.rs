//! Engine 통합 테스트 - 메모리 런타임 + 수동 시계
//!
//! `cargo test -p bastion-task --test engine_scenarios`

use bastion_foundation::{
    ApprovalMode, AuditAction, AuditEvent, ConfiguredProjects, Error, GcPolicy, ManualClock,
    ProjectPolicy, SecurityPolicy,
};
use bastion_foundation::{ContainerSpec, RuleList};
use bastion_task::{
    AgentAction, ContainerOwner, ContainerRequest, InMemoryRuntime, LogTail, ScriptedExec,
    TaskEngine, TaskId, TaskRequest, TaskStatus, AUTO_APPROVE_ACTOR,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    runtime: Arc<InMemoryRuntime>,
    clock: ManualClock,
    engine: TaskEngine,
}

fn fixture(policy: SecurityPolicy, gc: GcPolicy) -> Fixture {
    let clock = ManualClock::starting_now();
    let runtime = Arc::new(InMemoryRuntime::new().with_clock(Arc::new(clock.clone())));
    let engine = TaskEngine::builder(runtime.clone())
        .with_security_policy(policy)
        .expect("valid policy")
        .with_clock(Arc::new(clock.clone()))
        .with_gc_policy(gc)
        .build()
        .expect("engine builds");
    Fixture {
        runtime,
        clock,
        engine,
    }
}

fn auto_policy() -> SecurityPolicy {
    SecurityPolicy::default().with_approval_mode(ApprovalMode::Auto)
}

async fn trail(engine: &TaskEngine, id: &TaskId) -> Vec<AuditEvent> {
    engine.audit().flush().await;
    engine.audit().query_task(&id.full()).expect("audit query")
}

fn actions(events: &[AuditEvent]) -> Vec<AuditAction> {
    events.iter().map(|e| e.action).collect()
}

fn position(events: &[AuditEvent], action: AuditAction) -> usize {
    events
        .iter()
        .position(|e| e.action == action)
        .unwrap_or_else(|| panic!("missing {} in {:?}", action, actions(events)))
}

// ============================================================================
// Approval modes
// ============================================================================

#[tokio::test]
async fn test_auto_mode_runs_to_completion() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.script("cargo test", ScriptedExec::ok("test result: ok\n"));

    let request = TaskRequest::new("run the tests", "web")
        .with_user("alice")
        .with_commands(["echo hello", "cargo test"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::Running);
    assert!(submitted.container_id.is_some());

    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let result = done.result.expect("result");
    assert!(result.success);
    assert_eq!(result.executed_commands, vec!["echo hello", "cargo test"]);
    assert!(result.output.contains("hello"));
    assert!(result.output.contains("test result: ok"));

    let events = trail(&fx.engine, &done.id).await;
    assert_eq!(
        actions(&events),
        vec![
            AuditAction::TaskCreated,
            AuditAction::TaskStarted,
            AuditAction::CommandExecuted,
            AuditAction::CommandExecuted,
            AuditAction::TaskCompleted,
        ]
    );
    assert_eq!(events[0].actor.as_deref(), Some("alice"));

    // completed containers are destroyed unless preserve_completed is set
    assert_eq!(fx.runtime.live_count(), 0);
    assert_eq!(fx.engine.lifecycle().tracked_count(), 0);
}

#[tokio::test]
async fn test_always_mode_waits_for_approval() {
    let fx = fixture(
        SecurityPolicy::default().with_approval_mode(ApprovalMode::Always),
        GcPolicy::default(),
    );

    let request = TaskRequest::new("list files", "web").with_commands(["ls -la"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::NeedsApproval);
    assert!(submitted.approval_required);
    assert!(submitted.container_id.is_none());
    assert_eq!(fx.runtime.live_count(), 0);

    // start does not bypass the gate
    match fx.engine.start(&submitted.id).await {
        Err(Error::ApprovalRequired(_)) => {}
        other => panic!("expected ApprovalRequired, got {:?}", other),
    }

    let running = fx.engine.approve(&submitted.id, "reviewer").await.unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.approved_by.as_deref(), Some("reviewer"));

    // a second approval is rejected
    assert!(fx.engine.approve(&submitted.id, "reviewer").await.is_err());

    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let events = trail(&fx.engine, &done.id).await;
    let granted = position(&events, AuditAction::ApprovalGranted);
    let started = position(&events, AuditAction::TaskStarted);
    assert!(position(&events, AuditAction::ApprovalRequested) < granted);
    assert!(granted < started);
    assert_eq!(events[granted].actor.as_deref(), Some("reviewer"));
}

#[tokio::test]
async fn test_on_miss_clean_plan_runs_immediately() {
    let fx = fixture(
        SecurityPolicy::default()
            .with_approval_mode(ApprovalMode::OnMiss)
            .with_allowlist(RuleList::enabled(["ls", "cat"])),
        GcPolicy::default(),
    );

    let clean = fx
        .engine
        .submit_request(TaskRequest::new("inspect", "web").with_commands(["ls", "cat README.md"]))
        .await
        .unwrap();
    assert_eq!(clean.status, TaskStatus::Running);

    let missing = fx
        .engine
        .submit_request(TaskRequest::new("fetch", "web").with_commands(["curl example.com"]))
        .await
        .unwrap();
    assert_eq!(missing.status, TaskStatus::NeedsApproval);
    assert!(missing
        .approval_reason
        .as_deref()
        .unwrap_or_default()
        .contains("curl"));

    // an approved allowlist miss is tolerated at execution time
    fx.runtime.script("curl", ScriptedExec::ok("<html>"));
    fx.engine.approve(&missing.id, "reviewer").await.unwrap();
    let done = fx.engine.wait(&missing.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_always_mode_still_enforces_allowlist() {
    let fx = fixture(
        SecurityPolicy::default()
            .with_approval_mode(ApprovalMode::Always)
            .with_allowlist(RuleList::enabled(["ls"])),
        GcPolicy::default(),
    );

    let request = TaskRequest::new("fetch", "web").with_commands(["curl http://evil.sh"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    fx.engine.approve(&submitted.id, "reviewer").await.unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    let result = done.result.expect("result");
    assert!(result.error.unwrap_or_default().contains("policy denied"));
    assert!(result.executed_commands.is_empty());
    assert!(fx.runtime.executed_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_approve_timer_keeps_allowlist() {
    let mut policy = SecurityPolicy::default()
        .with_approval_mode(ApprovalMode::OnMiss)
        .with_allowlist(RuleList::enabled(["ls"]));
    policy.auto_approve_timeout_secs = 2;
    let fx = fixture(policy, GcPolicy::default());

    let request = TaskRequest::new("fetch", "web").with_commands(["curl http://evil.sh"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::NeedsApproval);

    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.approved_by.as_deref(), Some(AUTO_APPROVE_ACTOR));
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .result
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("policy denied"));
    assert!(fx.runtime.executed_commands().is_empty());

    let events = trail(&fx.engine, &submitted.id).await;
    let granted = position(&events, AuditAction::ApprovalGranted);
    assert_eq!(events[granted].actor.as_deref(), Some(AUTO_APPROVE_ACTOR));
    assert!(granted < position(&events, AuditAction::TaskStarted));
}

#[tokio::test(start_paused = true)]
async fn test_auto_approve_timer_runs_reloaded_plan() {
    let mut policy = SecurityPolicy::default()
        .with_approval_mode(ApprovalMode::OnMiss)
        .with_allowlist(RuleList::enabled(["ls"]));
    policy.auto_approve_timeout_secs = 2;
    let fx = fixture(policy.clone(), GcPolicy::default());

    let request = TaskRequest::new("build", "web").with_commands(["make"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::NeedsApproval);

    // allowlist widened while the task waits
    fx.engine
        .reload_policy(policy.with_allowlist(RuleList::enabled(["ls", "make"])))
        .unwrap();

    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.approved_by.as_deref(), Some(AUTO_APPROVE_ACTOR));
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(fx.runtime.executed_commands(), vec!["make"]);
}

#[tokio::test(start_paused = true)]
async fn test_auto_approve_timer_never_fires_under_always() {
    let mut policy = SecurityPolicy::default().with_approval_mode(ApprovalMode::Always);
    policy.auto_approve_timeout_secs = 1;
    let fx = fixture(policy, GcPolicy::default());

    let submitted = fx.engine.submit("anything", "web").await.unwrap();
    match fx.engine.wait(&submitted.id, Duration::from_secs(30)).await {
        Err(Error::Timeout(_)) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }

    let task = fx.engine.get_task(&submitted.id).unwrap();
    assert_eq!(task.status, TaskStatus::NeedsApproval);
    assert!(task.approved_by.is_none());
    assert_eq!(fx.runtime.live_count(), 0);
}

// ============================================================================
// Policy enforcement
// ============================================================================

#[tokio::test]
async fn test_blocklisted_command_fails_without_executing() {
    let fx = fixture(auto_policy(), GcPolicy::default());

    let request = TaskRequest::new("clean up", "web").with_commands(["sudo rm -rf /"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    let result = done.result.expect("result");
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("policy denied"));
    assert!(result.executed_commands.is_empty());
    assert!(fx.runtime.executed_commands().is_empty());

    let events = trail(&fx.engine, &done.id).await;
    assert!(!actions(&events).contains(&AuditAction::CommandExecuted));
    assert_eq!(events.last().map(|e| e.action), Some(AuditAction::TaskFailed));
}

#[tokio::test]
async fn test_blocked_path_write_fails() {
    let fx = fixture(auto_policy(), GcPolicy::default());

    let request = TaskRequest::new("edit shadow", "web")
        .with_action(AgentAction::write("/etc/shadow", "root::0:0"));
    let submitted = fx.engine.submit_request(request).await.unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .result
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("policy denied"));
}

#[tokio::test]
async fn test_path_base_must_match_working_dir() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let built = TaskEngine::builder(runtime.clone())
        .with_security_policy(auto_policy().with_path_whitelist(vec!["/workspace".into()]))
        .unwrap()
        .with_container_spec(ContainerSpec::default().with_working_dir("/etc"))
        .build();
    assert!(matches!(built, Err(Error::Config(_))));

    let fx = fixture(auto_policy(), GcPolicy::default());
    let mut moved = auto_policy();
    moved.path_base = "/etc".to_string();
    assert!(matches!(fx.engine.reload_policy(moved), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_relative_path_checked_where_it_is_written() {
    let mut policy = auto_policy().with_path_whitelist(vec!["/workspace".into()]);
    policy.path_base = "/etc".to_string();
    let runtime = Arc::new(InMemoryRuntime::new());
    let engine = TaskEngine::builder(runtime.clone())
        .with_security_policy(policy)
        .unwrap()
        .with_container_spec(ContainerSpec::default().with_working_dir("/etc"))
        .with_gc_policy(GcPolicy::default().with_preserve_failed(Duration::from_secs(3600)))
        .build()
        .unwrap();

    let request = TaskRequest::new("overwrite", "web")
        .with_action(AgentAction::write("passwd", "pwned"));
    let submitted = engine.submit_request(request).await.unwrap();
    let done = engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .result
        .clone()
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("policy denied"));
    let container = engine
        .lifecycle()
        .get_container(&done.container_id.expect("container"))
        .expect("retained");
    assert_eq!(runtime.file(&container.runtime_id, "/etc/passwd"), None);
}

#[tokio::test]
async fn test_file_actions_are_audited() {
    let fx = fixture(
        auto_policy(),
        GcPolicy::default().with_preserve_completed(Duration::from_secs(3600)),
    );

    let request = TaskRequest::new("write notes", "web")
        .with_action(AgentAction::write("notes.txt", "hello"))
        .with_action(AgentAction::read("notes.txt"));
    let submitted = fx.engine.submit_request(request).await.unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    let result = done.result.clone().expect("result");
    assert_eq!(result.modified_files, vec!["/workspace/notes.txt"]);

    // retained container still holds the file
    let container_id = done.container_id.clone().expect("container");
    let container = fx
        .engine
        .lifecycle()
        .get_container(&container_id)
        .expect("retained");
    assert_eq!(
        fx.runtime.file(&container.runtime_id, "/workspace/notes.txt"),
        Some("hello".to_string())
    );

    let events = trail(&fx.engine, &done.id).await;
    let written = position(&events, AuditAction::FileWritten);
    let read = position(&events, AuditAction::FileRead);
    assert!(written < read);
    assert_eq!(
        events[written].detail.get("path").and_then(|v| v.as_str()),
        Some("/workspace/notes.txt")
    );
}

#[tokio::test]
async fn test_disallowed_project_is_rejected() {
    let clock = ManualClock::starting_now();
    let runtime = Arc::new(InMemoryRuntime::new());
    let projects = ConfiguredProjects::new(&ProjectPolicy::allow(["web", "api-*"])).unwrap();
    let engine = TaskEngine::builder(runtime.clone())
        .with_clock(Arc::new(clock))
        .with_projects(Arc::new(projects))
        .build()
        .unwrap();

    match engine.submit("hack", "billing").await {
        Err(Error::ProjectNotAllowed(project)) => assert_eq!(project, "billing"),
        other => panic!("expected ProjectNotAllowed, got {:?}", other),
    }
    assert!(engine.list_tasks().is_empty());
    assert_eq!(runtime.live_count(), 0);

    engine.audit().flush().await;
    assert_eq!(engine.audit().count().unwrap(), 0);
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_nonzero_exit_fails_task() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.script("make", ScriptedExec::fail(2, "make: *** [all] Error 2"));

    let request = TaskRequest::new("build", "web").with_commands(["make", "echo unreachable"]);
    let submitted = fx.engine.submit_request(request).await.unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    let result = done.result.expect("result");
    assert_eq!(result.executed_commands, vec!["make"]);
    assert!(result.error.unwrap_or_default().contains("code 2"));
    assert_eq!(fx.runtime.executed_commands(), vec!["make"]);
}

#[tokio::test]
async fn test_command_timeout_fails_task() {
    let clock = ManualClock::starting_now();
    let runtime = Arc::new(InMemoryRuntime::new());
    let mut spec = ContainerSpec::default();
    spec.limits.timeout_secs = 1;
    let engine = TaskEngine::builder(runtime.clone())
        .with_security_policy(auto_policy())
        .unwrap()
        .with_clock(Arc::new(clock))
        .with_container_spec(spec)
        .build()
        .unwrap();
    runtime.script(
        "sleep",
        ScriptedExec::ok("").with_delay(Duration::from_secs(30)),
    );

    let submitted = engine
        .submit_request(TaskRequest::new("hang", "web").with_commands(["sleep 30"]))
        .await
        .unwrap();
    let done = engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .result
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("timeout"));
}

#[tokio::test]
async fn test_container_acquisition_failure() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.fail_next_create("image pull failed");

    let task = fx.engine.submit("build", "web").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .result
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("container acquisition failed"));
    assert_eq!(fx.runtime.live_count(), 0);

    assert!(task.container_id.is_none());
    assert_eq!(
        fx.engine.get_logs(&task.id, 10).await.unwrap(),
        LogTail::NoContainer
    );

    let events = trail(&fx.engine, &task.id).await;
    assert_eq!(
        actions(&events),
        vec![AuditAction::TaskCreated, AuditAction::TaskFailed]
    );
}

#[tokio::test]
async fn test_cancel_during_container_creation() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.set_create_delay(Duration::from_millis(200));

    let engine = fx.engine.clone();
    let submit =
        tokio::spawn(async move { engine.submit_request(TaskRequest::new("slow", "web")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = fx.engine.list_tasks()[0].id;
    let cancelled = fx.engine.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.container_id.is_none());

    // the launch loses to the cancel and tears its container down
    let launched = submit.await.unwrap().unwrap();
    assert_eq!(launched.status, TaskStatus::Cancelled);
    assert!(launched.container_id.is_none());
    assert!(launched.started_at.is_none());
    assert_eq!(fx.runtime.live_count(), 0);
    assert_eq!(fx.engine.status().await.leased_containers, 0);

    let events = trail(&fx.engine, &id).await;
    assert!(!actions(&events).contains(&AuditAction::TaskStarted));
    assert_eq!(events.iter().filter(|e| e.action.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_slow_file_read_hits_task_timeout() {
    let clock = ManualClock::starting_now();
    let runtime = Arc::new(InMemoryRuntime::new());
    let mut spec = ContainerSpec::default();
    spec.limits.timeout_secs = 1;
    let engine = TaskEngine::builder(runtime.clone())
        .with_security_policy(auto_policy())
        .unwrap()
        .with_clock(Arc::new(clock))
        .with_container_spec(spec)
        .build()
        .unwrap();
    runtime.set_file_delay(Duration::from_secs(60));

    let request = TaskRequest::new("read fifo", "web").with_action(AgentAction::read("pipe"));
    let submitted = engine.submit_request(request).await.unwrap();
    let done = engine.wait(&submitted.id, WAIT).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .result
        .and_then(|r| r.error)
        .unwrap_or_default()
        .contains("timed out"));
    assert_eq!(engine.status().await.leased_containers, 0);
}

// ============================================================================
// Garbage collection
// ============================================================================

#[tokio::test]
async fn test_idle_container_is_evicted() {
    let fx = fixture(
        auto_policy(),
        GcPolicy::default().with_max_idle(Duration::from_millis(60_000)),
    );
    let lifecycle = fx.engine.lifecycle();
    let container = lifecycle
        .create_container(ContainerRequest {
            id: lifecycle.generate_container_id(),
            owner: ContainerOwner {
                task_id: TaskId::new(),
                project: "web".to_string(),
                user: Some("alice".to_string()),
            },
            spec: Default::default(),
        })
        .await
        .unwrap();

    let gc = fx.engine.garbage_collector();
    assert!(gc.sweep().await.evicted.is_empty());

    fx.clock.advance(Duration::from_secs(61));
    let report = gc.sweep().await;
    assert_eq!(report.evicted_ids(), vec![container.id.clone()]);
    assert!(lifecycle.list_containers().is_empty());
    assert!(!fx.runtime.contains(&container.runtime_id));

    // nothing left for a second sweep
    let again = gc.sweep().await;
    assert!(again.evicted.is_empty());
}

#[tokio::test]
async fn test_failed_container_preserved_then_evicted() {
    let fx = fixture(
        auto_policy(),
        GcPolicy::default().with_preserve_failed(Duration::from_secs(24 * 3600)),
    );
    fx.runtime.script("make", ScriptedExec::fail(1, "boom"));

    let submitted = fx
        .engine
        .submit_request(TaskRequest::new("build", "web").with_commands(["make"]))
        .await
        .unwrap();
    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    let container_id = done.container_id.expect("container");

    let gc = fx.engine.garbage_collector();
    fx.clock.advance(Duration::from_secs(1));
    let report = gc.sweep().await;
    assert!(report.evicted.is_empty());
    assert_eq!(report.preserved, 1);
    assert!(fx.engine.lifecycle().get_container(&container_id).is_some());

    // logs are still served from the retained container
    match fx.engine.get_logs(&done.id, 10).await.unwrap() {
        LogTail::Output(text) => assert!(text.contains("boom")),
        LogTail::NoContainer => panic!("expected output"),
    }

    fx.clock.advance(Duration::from_secs(25 * 3600));
    let report = gc.sweep().await;
    assert_eq!(report.evicted_ids(), vec![container_id.clone()]);
    assert!(fx.engine.lifecycle().get_container(&container_id).is_none());

    // output survives eviction
    match fx.engine.get_logs(&done.id, 10).await.unwrap() {
        LogTail::Output(text) => assert!(text.contains("boom")),
        LogTail::NoContainer => panic!("expected output"),
    }
}

#[tokio::test]
async fn test_sweep_never_touches_running_task() {
    let fx = fixture(
        auto_policy(),
        GcPolicy::default().with_max_idle(Duration::from_secs(1)),
    );
    fx.runtime.script(
        "sleep",
        ScriptedExec::ok("").with_delay(Duration::from_millis(300)),
    );

    let submitted = fx
        .engine
        .submit_request(TaskRequest::new("slow", "web").with_commands(["sleep 1"]))
        .await
        .unwrap();
    assert_eq!(submitted.status, TaskStatus::Running);

    fx.clock.advance(Duration::from_secs(3600));
    let report = fx.engine.garbage_collector().sweep().await;
    assert!(report.evicted.is_empty());
    assert_eq!(report.skipped_busy, 1);
    assert_eq!(fx.engine.status().await.leased_containers, 1);

    let done = fx.engine.wait(&submitted.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_pending_approval() {
    let fx = fixture(
        SecurityPolicy::default().with_approval_mode(ApprovalMode::Always),
        GcPolicy::default(),
    );
    let task = fx.engine.submit("anything", "web").await.unwrap();
    assert_eq!(task.status, TaskStatus::NeedsApproval);

    let cancelled = fx.engine.cancel(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(
        fx.engine.get_logs(&task.id, 10).await.unwrap(),
        LogTail::NoContainer
    );

    // terminal states are final
    assert!(fx.engine.cancel(&task.id).await.is_err());
    assert!(fx.engine.approve(&task.id, "late").await.is_err());

    let events = trail(&fx.engine, &task.id).await;
    assert_eq!(
        actions(&events),
        vec![
            AuditAction::TaskCreated,
            AuditAction::ApprovalRequested,
            AuditAction::ApprovalDenied,
            AuditAction::TaskFailed,
        ]
    );
}

#[tokio::test]
async fn test_cancel_running_task() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.script(
        "sleep",
        ScriptedExec::ok("").with_delay(Duration::from_secs(30)),
    );

    let task = fx
        .engine
        .submit_request(TaskRequest::new("long", "web").with_commands(["sleep 30"]))
        .await
        .unwrap();
    let cancelled = fx.engine.cancel(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let done = fx.engine.wait(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert_eq!(fx.runtime.live_count(), 0);
    assert!(fx.engine.list_active_tasks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_completion_has_one_outcome() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    fx.runtime.script(
        "sleep",
        ScriptedExec::ok("done").with_delay(Duration::from_millis(20)),
    );

    for round in 0..20u64 {
        let task = fx
            .engine
            .submit_request(TaskRequest::new("race", "web").with_commands(["sleep 0.02"]))
            .await
            .unwrap();

        let engine = fx.engine.clone();
        let id = task.id;
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15 + round % 10)).await;
            engine.cancel(&id).await
        });
        let _ = canceller.await.unwrap();

        let done = fx.engine.wait(&task.id, WAIT).await.unwrap();
        assert!(matches!(
            done.status,
            TaskStatus::Completed | TaskStatus::Cancelled
        ));

        let events = trail(&fx.engine, &task.id).await;
        let terminal: Vec<&AuditEvent> = events.iter().filter(|e| e.action.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "round {}: {:?}", round, actions(&events));
        assert_eq!(
            terminal[0].detail.get("status").and_then(|v| v.as_str()),
            Some(done.status.as_str())
        );
        assert!(terminal[0].timestamp >= events[position(&events, AuditAction::TaskStarted)].timestamp);

        // teardown already ran; repeated destroys are no-ops
        let container_id = done.container_id.expect("container");
        fx.engine
            .lifecycle()
            .destroy_container(&container_id, true)
            .await
            .unwrap();
        fx.engine
            .lifecycle()
            .destroy_container(&container_id, true)
            .await
            .unwrap();
    }
    assert_eq!(fx.runtime.live_count(), 0);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_held_task_and_listing_order() {
    let fx = fixture(auto_policy(), GcPolicy::default());

    let first = fx
        .engine
        .submit_request(TaskRequest::new("first", "web").hold())
        .await
        .unwrap();
    fx.clock.advance(Duration::from_secs(1));
    let second = fx
        .engine
        .submit_request(TaskRequest::new("second", "web").hold())
        .await
        .unwrap();
    assert_eq!(first.status, TaskStatus::Pending);

    let ids: Vec<TaskId> = fx.engine.list_tasks().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(fx.engine.list_active_tasks().len(), 2);

    let started = fx.engine.start(&first.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::Running);
    assert!(fx.engine.start(&first.id).await.is_err());
    fx.engine.wait(&first.id, WAIT).await.unwrap();

    let status = fx.engine.status().await;
    assert!(status.ready);
    assert_eq!(status.total_tasks, 2);
    assert_eq!(status.active_tasks, 1);

    match fx.engine.get_task(&TaskId::new()) {
        Err(Error::TaskNotFound(_)) => {}
        other => panic!("expected TaskNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_times_out_on_held_task() {
    let fx = fixture(auto_policy(), GcPolicy::default());
    let task = fx
        .engine
        .submit_request(TaskRequest::new("held", "web").hold())
        .await
        .unwrap();
    match fx.engine.wait(&task.id, Duration::from_millis(50)).await {
        Err(Error::Timeout(_)) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }
}
