//! Security Policy - 명령어/경로 규칙과 승인 모드
//!
//! - `types`: 설정 파일 형태의 정책 (`SecurityPolicy`, `RuleList`, `ApprovalMode`)
//! - `pattern`: 컴파일된 규칙 패턴
//! - `command`: 셸 명령어 분해 (segment, base command, 경로 인자)
//! - `enforcer`: 허용/거부 결정과 핫 리로드
//! - `project`: 허용 프로젝트 판정

pub mod command;
pub mod enforcer;
pub mod pattern;
pub mod project;
pub mod types;

pub use command::{base_command, normalize_path, parse_segments, CommandSegment};
pub use enforcer::{CommandDecision, Enforcer, PathDecision};
pub use project::{ConfiguredProjects, ProjectAllowlist};
pub use types::{ApprovalMode, ProjectPolicy, RuleList, SecurityPolicy};
