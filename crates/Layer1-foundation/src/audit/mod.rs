//! Audit Log - 감사 로깅 시스템
//!
//! Task 생명주기와 보안 관련 행위를 append-only로 기록합니다.
//!
//! ## 아키텍처
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        AuditLog                          │
//! │  record(event) ──► Redactor ──► mpsc queue ──► writer    │
//! │                                                  │       │
//! │  query(limit, offset) ◄──────────── AuditStore (SQLite)  │
//! │                                                  ▲       │
//! │  spawn_pruner(every, retention) ─────────────────┘       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 사용법
//!
//! ```ignore
//! use bastion_foundation::audit::{AuditAction, AuditEvent, AuditLog};
//!
//! let log = AuditLog::in_memory(clock)?;
//! log.record(AuditEvent::new(AuditAction::TaskCreated, task_id).with_detail("project", "web"));
//! log.flush().await;
//!
//! let newest = log.query(50, 0)?;
//! ```

pub mod log;
pub mod logger;
pub mod redact;
pub mod types;

// Re-exports
pub use log::{AuditLog, DEFAULT_QUEUE_CAPACITY};
pub use logger::AuditStore;
pub use redact::{Redactor, DEFAULT_SENSITIVE_KEYS, REDACTION_MARKER};
pub use types::{AuditAction, AuditEvent, AuditId};
