//! Security Policy Enforcer - 명령어/경로 허용 여부 결정
//!
//! 순수 결정 함수의 집합입니다. 정책은 `Arc`로 통째로 교체되므로
//! 핫 리로드 중에도 일부만 적용된 정책을 보는 일은 없습니다.
//!
//! ## 평가 순서
//!
//! ```text
//! command ──► blocklist (항상 우선) ──► allowlist ──► path args
//!                 │                        │              │
//!                 ▼                        ▼              ▼
//!              Blocked               NotAllowlisted    PathDenied
//! ```

use super::command::{normalize_path, parse_segments, path_arguments, CommandSegment};
use super::pattern::{AllowPattern, BlockPattern, PathPattern};
use super::types::{ApprovalMode, SecurityPolicy};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Decisions
// ============================================================================

/// 명령어 규칙 검사 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    Allow,
    /// 차단 목록 패턴에 걸림
    Blocked { pattern: String },
    /// 허용 목록이 활성인데 base command가 없음
    NotAllowlisted { base: String },
}

impl CommandDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// 경로 규칙 검사 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allow,
    Blacklisted { pattern: String },
    NotWhitelisted,
}

impl PathDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ============================================================================
// Compiled policy
// ============================================================================

#[derive(Debug)]
struct CompiledPolicy {
    source: SecurityPolicy,
    allow: Option<Vec<AllowPattern>>,
    block: Vec<BlockPattern>,
    path_allow: Vec<PathPattern>,
    path_block: Vec<PathPattern>,
}

impl CompiledPolicy {
    fn compile(policy: SecurityPolicy) -> Result<Self> {
        let allow = if policy.command_allowlist.is_active() {
            Some(
                policy
                    .command_allowlist
                    .patterns
                    .iter()
                    .map(|p| AllowPattern::compile(p))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };

        let block = if policy.command_blocklist.enabled {
            policy
                .command_blocklist
                .patterns
                .iter()
                .map(|p| BlockPattern::compile(p))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let path_allow = policy
            .path_whitelist
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let path_block = policy
            .path_blacklist
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;

        if !policy.path_base.starts_with('/') {
            return Err(Error::Config(format!(
                "path_base must be absolute, got '{}'",
                policy.path_base
            )));
        }

        Ok(Self {
            source: policy,
            allow,
            block,
            path_allow,
            path_block,
        })
    }

    fn check_command(&self, command: &str, segments: &[CommandSegment]) -> CommandDecision {
        if let Some(hit) = self.block.iter().find(|p| p.matches(command, segments)) {
            return CommandDecision::Blocked {
                pattern: hit.source().to_string(),
            };
        }

        if let Some(allow) = &self.allow {
            for segment in segments {
                if !allow.iter().any(|p| p.matches(segment)) {
                    return CommandDecision::NotAllowlisted {
                        base: segment.base.clone(),
                    };
                }
            }
        }

        CommandDecision::Allow
    }

    fn check_path(&self, path: &str) -> PathDecision {
        let normalized = normalize_path(path, &self.source.path_base);

        if let Some(hit) = self.path_block.iter().find(|p| p.matches(&normalized)) {
            return PathDecision::Blacklisted {
                pattern: hit.source().to_string(),
            };
        }

        if !self.path_allow.is_empty() && !self.path_allow.iter().any(|p| p.matches(&normalized))
        {
            return PathDecision::NotWhitelisted;
        }

        PathDecision::Allow
    }
}

// ============================================================================
// Enforcer
// ============================================================================

/// 보안 정책 집행기
///
/// ```ignore
/// let enforcer = Enforcer::new(SecurityPolicy::default())?;
///
/// assert!(!enforcer.is_command_allowed("sudo rm -rf /"));
/// enforcer.authorize_command("cargo test", false)?;
/// ```
#[derive(Debug)]
pub struct Enforcer {
    policy: RwLock<Arc<CompiledPolicy>>,
}

impl Enforcer {
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        let compiled = CompiledPolicy::compile(policy)?;
        Ok(Self {
            policy: RwLock::new(Arc::new(compiled)),
        })
    }

    /// 정책 전체를 검증한 뒤 원자적으로 교체
    pub fn reload(&self, policy: SecurityPolicy) -> Result<()> {
        let compiled = CompiledPolicy::compile(policy)?;
        let mode = compiled.source.approval_mode;
        *self.policy.write() = Arc::new(compiled);
        info!(approval_mode = %mode, "Security policy reloaded");
        Ok(())
    }

    /// 현재 정책 스냅샷
    pub fn policy(&self) -> SecurityPolicy {
        self.current().source.clone()
    }

    fn current(&self) -> Arc<CompiledPolicy> {
        Arc::clone(&*self.policy.read())
    }

    // ========================================================================
    // Command rules
    // ========================================================================

    /// Blocklist first, then allowlist. An empty allowlist restricts nothing.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.check_command(command).is_allowed()
    }

    pub fn check_command(&self, command: &str) -> CommandDecision {
        let segments = parse_segments(command);
        self.current().check_command(command, &segments)
    }

    // ========================================================================
    // Path rules
    // ========================================================================

    /// Blacklist first, then whitelist. An empty whitelist restricts nothing.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        self.check_path(path).is_allowed()
    }

    pub fn check_path(&self, path: &str) -> PathDecision {
        self.current().check_path(path)
    }

    // ========================================================================
    // Approval
    // ========================================================================

    pub fn resolve_approval_mode(&self) -> ApprovalMode {
        self.current().source.approval_mode
    }

    /// 승인 요청 사유 (None이면 승인 없이 실행 가능)
    ///
    /// `always`는 항상 사유를 돌려주고, `auto`는 절대 돌려주지 않습니다.
    /// `on-miss`는 계획된 명령어 중 명령어/경로 규칙 검사에 걸리는 것이
    /// 있을 때 사유를 돌려줍니다.
    pub fn approval_reason(&self, planned: &[String]) -> Option<String> {
        let policy = self.current();
        match policy.source.approval_mode {
            ApprovalMode::Always => Some("approval mode is 'always'".to_string()),
            ApprovalMode::Auto => None,
            ApprovalMode::OnMiss => planned
                .iter()
                .find_map(|command| Self::rule_miss(&policy, command)),
        }
    }

    fn rule_miss(policy: &CompiledPolicy, command: &str) -> Option<String> {
        let segments = parse_segments(command);
        match policy.check_command(command, &segments) {
            CommandDecision::Allow => {}
            CommandDecision::Blocked { pattern } => {
                return Some(format!(
                    "command '{}' matches blocklist pattern '{}'",
                    command, pattern
                ))
            }
            CommandDecision::NotAllowlisted { base } => {
                return Some(format!("command '{}' is not in the allowlist", base))
            }
        }

        segments
            .iter()
            .flat_map(path_arguments)
            .find(|path| !policy.check_path(path).is_allowed())
            .map(|path| format!("path '{}' fails the path rules", path))
    }

    // ========================================================================
    // Execution-time authorization
    // ========================================================================

    /// 실행 직전 명령어 인가
    ///
    /// `tolerate_misses`는 사람이 승인한 Task에서 허용 목록 누락을 봐줄지
    /// 여부입니다. 차단 목록과 경로 규칙은 항상 적용됩니다.
    pub fn authorize_command(&self, command: &str, tolerate_misses: bool) -> Result<()> {
        let policy = self.current();
        let segments = parse_segments(command);

        match policy.check_command(command, &segments) {
            CommandDecision::Allow => {}
            CommandDecision::Blocked { pattern } => {
                warn!(
                    command = %command,
                    pattern = %pattern,
                    "Command blocked by policy"
                );
                return Err(Error::command_denied(
                    command,
                    format!("matches blocklist pattern '{}'", pattern),
                ));
            }
            CommandDecision::NotAllowlisted { base } => {
                if !tolerate_misses {
                    warn!(command = %command, base = %base, "Command not in allowlist");
                    return Err(Error::command_denied(
                        command,
                        format!("'{}' is not in the allowlist", base),
                    ));
                }
                debug!(base = %base, "Allowlist miss tolerated for approved task");
            }
        }

        for segment in &segments {
            for path in path_arguments(segment) {
                self.authorize_path_with(&policy, &path)?;
            }
        }

        Ok(())
    }

    /// 파일 읽기/쓰기 직전 경로 인가
    pub fn authorize_path(&self, path: &str) -> Result<()> {
        let policy = self.current();
        self.authorize_path_with(&policy, path)
    }

    fn authorize_path_with(&self, policy: &CompiledPolicy, path: &str) -> Result<()> {
        match policy.check_path(path) {
            PathDecision::Allow => Ok(()),
            PathDecision::Blacklisted { pattern } => {
                warn!(path = %path, pattern = %pattern, "Path blocked by policy");
                Err(Error::path_denied(
                    path,
                    format!("matches blacklist pattern '{}'", pattern),
                ))
            }
            PathDecision::NotWhitelisted => {
                warn!(path = %path, "Path outside whitelist");
                Err(Error::path_denied(path, "outside the path whitelist"))
            }
        }
    }
}
