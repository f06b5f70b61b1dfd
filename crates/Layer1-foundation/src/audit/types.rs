//! Audit Log Types - 감사 이벤트 타입 정의
//!
//! Task 생명주기와 보안 관련 행위를 기록하는 불변 레코드입니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Audit Event ID
// ============================================================================

/// 감사 이벤트 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditId(pub String);

impl AuditId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Audit Action
// ============================================================================

/// 감사 대상 액션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    // Task 생명주기
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,

    // 실행
    CommandExecuted,

    // 승인
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,

    // 파일
    FileRead,
    FileWritten,
}

impl AuditAction {
    pub const ALL: [AuditAction; 10] = [
        Self::TaskCreated,
        Self::TaskStarted,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::CommandExecuted,
        Self::ApprovalRequested,
        Self::ApprovalGranted,
        Self::ApprovalDenied,
        Self::FileRead,
        Self::FileWritten,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task-created",
            Self::TaskStarted => "task-started",
            Self::TaskCompleted => "task-completed",
            Self::TaskFailed => "task-failed",
            Self::CommandExecuted => "command-executed",
            Self::ApprovalRequested => "approval-requested",
            Self::ApprovalGranted => "approval-granted",
            Self::ApprovalDenied => "approval-denied",
            Self::FileRead => "file-read",
            Self::FileWritten => "file-written",
        }
    }

    /// 종료 이벤트 여부
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted | Self::TaskFailed)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| crate::Error::Storage(format!("Unknown audit action '{}'", s)))
    }
}

// ============================================================================
// Audit Event
// ============================================================================

/// 감사 이벤트
///
/// `timestamp`는 `AuditLog::record` 시점에 로그의 Clock으로 다시 찍힙니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditId,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub action: AuditAction,
    /// 민감 키는 저장 전에 마스킹됨
    pub detail: Map<String, Value>,
    pub actor: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, task_id: impl Into<String>) -> Self {
        Self {
            id: AuditId::new(),
            timestamp: Utc::now(),
            task_id: task_id.into(),
            action,
            detail: Map::new(),
            actor: None,
        }
    }

    /// 상세 항목 추가
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    /// JSON 객체의 모든 항목을 상세에 병합 (객체가 아니면 무시)
    pub fn with_details(mut self, details: Value) -> Self {
        if let Value::Object(map) = details {
            self.detail.extend(map);
        }
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}
