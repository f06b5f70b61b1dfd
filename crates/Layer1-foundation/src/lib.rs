//! # bastion-foundation
//!
//! Foundation layer for Bastion:
//! - Error: 에러 분류 (`Error`, `Result`, `best_effort`)
//! - Clock: 시간 소스 추상화 (`SystemClock`, `ManualClock`)
//! - Config: 통합 설정 (BastionConfig, ContainerSpec, GcPolicy 등)
//! - Policy: 보안 정책 집행 (명령어/경로 규칙, 승인 모드, 프로젝트 허용)
//! - Audit: 감사 로그 (redaction + SQLite)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  BastionConfig (TOML, 로드 시 검증)                       │
//! │   ├── SecurityPolicy ──► Enforcer (Arc swap 핫 리로드)   │
//! │   ├── ProjectPolicy  ──► ConfiguredProjects              │
//! │   ├── ContainerSpec / GcPolicy ──► bastion-task          │
//! │   └── AuditConfig    ──► AuditLog ──► AuditStore (SQLite)│
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;

// ============================================================================
// Error
// ============================================================================
pub use error::{best_effort, Error, Result};

// ============================================================================
// Clock
// ============================================================================
pub use clock::{elapsed_between, Clock, ManualClock, SharedClock, SystemClock};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AuditConfig, BastionConfig, ContainerSpec, GcPolicy, NetworkMode, ResourceLimits,
    RuntimeConfig, RuntimeSelection, SecurityProfile, VolumeMount, CONFIG_FILE,
};

// ============================================================================
// Policy (보안 정책)
// ============================================================================
pub use policy::{
    ApprovalMode, CommandDecision, ConfiguredProjects, Enforcer, PathDecision, ProjectAllowlist,
    ProjectPolicy, RuleList, SecurityPolicy,
};

// ============================================================================
// Audit (감사 로깅)
// ============================================================================
pub use audit::{AuditAction, AuditEvent, AuditId, AuditLog, AuditStore, Redactor};
