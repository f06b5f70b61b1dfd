//! Error types for Bastion
//!
//! 모든 에러를 중앙에서 관리

use std::fmt::Display;
use thiserror::Error;
use tracing::warn;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Bastion 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 정책 위반 (호출자 요청이 잘못된 경우)
    // ========================================================================
    #[error("Project not allowed: {0}")]
    ProjectNotAllowed(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Command denied: {command} ({reason})")]
    CommandDenied { command: String, reason: String },

    #[error("Path denied: {path} ({reason})")]
    PathDenied { path: String, reason: String },

    #[error("Approval required: {0}")]
    ApprovalRequired(String),

    // ========================================================================
    // 컨테이너 런타임 관련
    // ========================================================================
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    // ========================================================================
    // Task 관련
    // ========================================================================
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 호출자의 요청 자체가 정책상 잘못된 경우 (Task 실패와 구분)
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Error::ProjectNotAllowed(_)
                | Error::InvalidTransition { .. }
                | Error::CommandDenied { .. }
                | Error::PathDenied { .. }
                | Error::ApprovalRequired(_)
        )
    }

    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::RuntimeUnavailable(_))
    }

    /// InvalidTransition 생성 헬퍼
    pub fn invalid_transition(
        task: impl Display,
        from: impl Display,
        to: impl Display,
    ) -> Self {
        Error::InvalidTransition {
            task: task.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// CommandDenied 생성 헬퍼
    pub fn command_denied(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CommandDenied {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// PathDenied 생성 헬퍼
    pub fn path_denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PathDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Best-effort 정리 헬퍼
// ============================================================================

/// Runs a cleanup result through the best-effort policy: failures are
/// logged with `what` as context and swallowed.
///
/// The returned `Option` lets callers inspect the outcome when they care;
/// ignoring it is the normal case.
pub fn best_effort<T, E: Display>(what: &str, result: std::result::Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "best-effort {} failed", what);
            None
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
