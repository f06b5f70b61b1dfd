//! Task 상태 기계 속성 테스트
//!
//! 임의의 start/approve/cancel 순서를 적용해도 관찰되는 상태는 항상
//! 합법적인 전이로만 이동하고, 종료 이벤트는 정확히 한 번 기록됩니다.

use bastion_foundation::{ApprovalMode, AuditAction, ManualClock, SecurityPolicy};
use bastion_task::{InMemoryRuntime, TaskEngine, TaskRequest, TaskStatus};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Approve,
    Cancel,
    Settle,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::Approve),
        Just(Op::Cancel),
        Just(Op::Settle),
    ]
}

fn arb_mode() -> impl Strategy<Value = ApprovalMode> {
    prop_oneof![
        Just(ApprovalMode::Auto),
        Just(ApprovalMode::Always),
        Just(ApprovalMode::OnMiss),
    ]
}

/// States reachable from `from` through legal transitions (including itself)
fn reachable(from: TaskStatus) -> HashSet<TaskStatus> {
    let mut seen = HashSet::from([from]);
    let mut frontier = vec![from];
    while let Some(current) = frontier.pop() {
        for next in TaskStatus::ALL {
            if current.can_transition_to(next) && seen.insert(next) {
                frontier.push(next);
            }
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_operations_follow_legal_transitions(
        mode in arb_mode(),
        hold in any::<bool>(),
        ops in prop::collection::vec(arb_op(), 1..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let clock = ManualClock::starting_now();
            let engine = TaskEngine::builder(Arc::new(InMemoryRuntime::new()))
                .with_security_policy(SecurityPolicy::default().with_approval_mode(mode))
                .unwrap()
                .with_clock(Arc::new(clock))
                .build()
                .unwrap();

            let mut request = TaskRequest::new("prop", "web").with_commands(["echo one", "echo two"]);
            if hold {
                request = request.hold();
            }
            let task = engine.submit_request(request).await.unwrap();
            let mut last = task.status;

            for op in ops {
                let outcome = match op {
                    Op::Start => engine.start(&task.id).await.map(|t| t.status),
                    Op::Approve => engine.approve(&task.id, "prop").await.map(|t| t.status),
                    Op::Cancel => engine.cancel(&task.id).await.map(|t| t.status),
                    Op::Settle => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok(engine.get_task(&task.id).unwrap().status)
                    }
                };

                let observed = engine.get_task(&task.id).unwrap().status;
                assert!(
                    reachable(last).contains(&observed),
                    "{} -> {} after {:?}",
                    last,
                    observed,
                    op
                );
                if last.is_terminal() {
                    assert_eq!(observed, last, "terminal state changed after {:?}", op);
                    assert!(matches!(op, Op::Settle) || outcome.is_err());
                }
                last = observed;
            }

            if !last.is_terminal() {
                let _ = engine.cancel(&task.id).await;
            }
            let done = engine.wait(&task.id, Duration::from_secs(5)).await.unwrap();
            assert!(done.status.is_terminal());

            engine.audit().flush().await;
            let events = engine.audit().query_task(&task.id.full()).unwrap();
            let terminal = events.iter().filter(|e| e.action.is_terminal()).count();
            assert_eq!(terminal, 1, "{:?}", events.iter().map(|e| e.action).collect::<Vec<_>>());
            assert_eq!(events.first().map(|e| e.action), Some(AuditAction::TaskCreated));
        });
    }
}
