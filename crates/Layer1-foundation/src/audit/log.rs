//! Audit Log - 비동기 기록기
//!
//! `record`는 I/O를 기다리지 않습니다. 이벤트는 bounded 큐에 들어가고
//! 백그라운드 writer가 `AuditStore`에 씁니다. 큐가 가득 찼거나 쓰기가
//! 실패한 이벤트는 `dropped` 카운터와 `warn!` 로그로 남습니다.
//!
//! ```text
//! record(event) ──► redact ──► try_send ──► [queue] ──► writer ──► SQLite
//!                                  │
//!                                  └─ full/closed ──► dropped += 1, warn!
//! ```

use super::logger::AuditStore;
use super::redact::Redactor;
use super::types::AuditEvent;
use crate::clock::SharedClock;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 기본 큐 크기
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

enum Command {
    Record(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// 감사 로그 핸들 (clone 가능)
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<Command>,
    store: Arc<AuditStore>,
    redactor: Redactor,
    clock: SharedClock,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// writer 태스크를 띄우고 핸들을 반환 (tokio 런타임 안에서 호출)
    pub fn start(
        store: Arc<AuditStore>,
        redactor: Redactor,
        clock: SharedClock,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(writer_loop(rx, Arc::clone(&store), Arc::clone(&dropped)));

        Self {
            inner: Arc::new(Inner {
                tx,
                store,
                redactor,
                clock,
                dropped,
            }),
        }
    }

    /// 인메모리 저장소 + 기본 redaction (테스트용)
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        let store = Arc::new(AuditStore::in_memory()?);
        Ok(Self::start(
            store,
            Redactor::default(),
            clock,
            DEFAULT_QUEUE_CAPACITY,
        ))
    }

    /// 이벤트 기록 (블로킹 없음)
    pub fn record(&self, mut event: AuditEvent) {
        event.timestamp = self.inner.clock.now();
        self.inner.redactor.redact_map(&mut event.detail);

        if let Err(err) = self.inner.tx.try_send(Command::Record(event)) {
            let reason = match &err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            if let Command::Record(event) = err.into_inner() {
                self.note_dropped(&event, reason);
            }
        }
    }

    fn note_dropped(&self, event: &AuditEvent, reason: &str) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            task_id = %event.task_id,
            action = event.action.as_str(),
            reason = reason,
            "Audit event dropped"
        );
    }

    /// 지금까지 큐에 들어간 이벤트가 모두 저장될 때까지 대기
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// 최신순 페이지 조회
    pub fn query(&self, limit: usize, offset: usize) -> Result<Vec<AuditEvent>> {
        self.inner.store.query(limit, offset)
    }

    /// 한 Task의 이벤트 (인과 순서)
    pub fn query_task(&self, task_id: &str) -> Result<Vec<AuditEvent>> {
        self.inner.store.query_task(task_id)
    }

    pub fn count(&self) -> Result<u64> {
        self.inner.store.count()
    }

    /// 유실된 이벤트 수
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// 보관 기간이 지난 이벤트 한 번 정리
    pub fn prune(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| crate::Error::Config(format!("Retention out of range: {}", e)))?;
        let cutoff = self.inner.clock.now() - retention;
        self.inner.store.prune_older_than(cutoff)
    }

    /// 주기적 정리 태스크 (기록 경로와 독립)
    pub fn spawn_pruner(&self, every: Duration, retention: Duration) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = log.prune(retention) {
                    warn!(error = %e, "Audit prune failed");
                }
            }
        })
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Command>,
    store: Arc<AuditStore>,
    dropped: Arc<AtomicU64>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Record(event) => {
                if let Err(e) = store.append(&event) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %event.task_id,
                        action = event.action.as_str(),
                        error = %e,
                        "Audit write failed, event dropped"
                    );
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::redact::REDACTION_MARKER;
    use crate::audit::types::AuditAction;
    use crate::clock::{Clock, ManualClock};

    fn log_with(clock: &ManualClock) -> AuditLog {
        AuditLog::in_memory(Arc::new(clock.clone())).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_redacts_before_persisting() {
        let clock = ManualClock::starting_now();
        let log = log_with(&clock);

        log.record(
            AuditEvent::new(AuditAction::CommandExecuted, "t1")
                .with_detail("command", "deploy")
                .with_detail("apiKey", "sk-live-123"),
        );
        log.flush().await;

        let events = log.query(10, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail["command"], "deploy");
        assert_eq!(events[0].detail["apiKey"], REDACTION_MARKER);
        assert_eq!(events[0].timestamp, clock.now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prune_uses_clock() {
        let clock = ManualClock::starting_now();
        let log = log_with(&clock);

        log.record(AuditEvent::new(AuditAction::TaskCreated, "old"));
        log.flush().await;
        clock.advance(Duration::from_secs(10 * 86_400));
        log.record(AuditEvent::new(AuditAction::TaskCreated, "new"));
        log.flush().await;

        let pruned = log.prune(Duration::from_secs(7 * 86_400)).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(log.count().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_counts_drops() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(AuditStore::in_memory().unwrap());

        // writer is never spawned, so the queue holds exactly `capacity` events
        let (tx, _rx) = mpsc::channel(2);
        let log = AuditLog {
            inner: Arc::new(Inner {
                tx,
                store,
                redactor: Redactor::default(),
                clock: Arc::new(clock),
                dropped: Arc::new(AtomicU64::new(0)),
            }),
        };

        for i in 0..5 {
            log.record(AuditEvent::new(AuditAction::CommandExecuted, format!("t{}", i)));
        }
        assert_eq!(log.dropped(), 3);
    }
}
