//! Policy Types - 보안 정책 설정 타입
//!
//! 설정 파일에서 로드되는 원본 형태입니다. 검증과 컴파일은
//! `Enforcer`가 담당합니다.

use super::command::normalize_path;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Approval Mode
// ============================================================================

/// 승인 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// 모든 Task에 사람의 승인 필요
    Always,
    /// 규칙 검사에 걸릴 때만 승인 필요
    OnMiss,
    /// 승인 없이 실행 (명령어/경로 차단은 유지)
    Auto,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::OnMiss
    }
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnMiss => "on-miss",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "on-miss" => Ok(Self::OnMiss),
            "auto" => Ok(Self::Auto),
            other => Err(crate::Error::Config(format!(
                "Unknown approval mode '{}' (expected always, on-miss or auto)",
                other
            ))),
        }
    }
}

// ============================================================================
// Rule List
// ============================================================================

/// 활성화 플래그가 있는 명령어 패턴 목록
///
/// 패턴은 기본적으로 부분 문자열이며, `regex:` 접두사가 붙으면 정규식입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleList {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub patterns: Vec<String>,
}

impl RuleList {
    pub fn enabled(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            enabled: true,
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// 실제로 적용되는 규칙이 있는지 (비활성 또는 빈 목록이면 제한 없음)
    pub fn is_active(&self) -> bool {
        self.enabled && !self.patterns.is_empty()
    }
}

// ============================================================================
// Security Policy
// ============================================================================

/// 보안 정책 집합
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// 명령어 허용 목록 (base command 기준)
    pub command_allowlist: RuleList,

    /// 명령어 차단 목록 (항상 허용 목록보다 우선)
    pub command_blocklist: RuleList,

    /// 허용 경로 (glob 또는 디렉토리 prefix, 비어 있으면 제한 없음)
    pub path_whitelist: Vec<String>,

    /// 차단 경로 (항상 허용 경로보다 우선)
    pub path_blacklist: Vec<String>,

    /// 승인 모드
    pub approval_mode: ApprovalMode,

    /// 승인 대기 Task 자동 승인까지의 시간 (초, on-miss 전용, 0이면 비활성)
    pub auto_approve_timeout_secs: u64,

    /// 상대 경로를 해석할 기준 디렉토리 (컨테이너 작업 디렉토리)
    pub path_base: String,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            command_allowlist: RuleList::disabled(),
            command_blocklist: RuleList::enabled(default_blocked_commands()),
            path_whitelist: Vec::new(),
            path_blacklist: default_blocked_paths(),
            approval_mode: ApprovalMode::default(),
            auto_approve_timeout_secs: 0,
            path_base: "/workspace".to_string(),
        }
    }
}

impl SecurityPolicy {
    /// 제한이 전혀 없는 정책 (테스트 및 신뢰 환경용)
    pub fn permissive() -> Self {
        Self {
            command_allowlist: RuleList::disabled(),
            command_blocklist: RuleList::disabled(),
            path_whitelist: Vec::new(),
            path_blacklist: Vec::new(),
            approval_mode: ApprovalMode::Auto,
            auto_approve_timeout_secs: 0,
            path_base: "/workspace".to_string(),
        }
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_allowlist(mut self, list: RuleList) -> Self {
        self.command_allowlist = list;
        self
    }

    pub fn with_blocklist(mut self, list: RuleList) -> Self {
        self.command_blocklist = list;
        self
    }

    pub fn with_path_whitelist(mut self, paths: Vec<String>) -> Self {
        self.path_whitelist = paths;
        self
    }

    pub fn with_path_blacklist(mut self, paths: Vec<String>) -> Self {
        self.path_blacklist = paths;
        self
    }

    pub fn auto_approve_timeout(&self) -> Option<Duration> {
        (self.auto_approve_timeout_secs > 0)
            .then(|| Duration::from_secs(self.auto_approve_timeout_secs))
    }

    /// 상대 경로 기준이 컨테이너 작업 디렉토리와 같은지 확인
    ///
    /// 두 값이 다르면 규칙은 한 파일을 검사하고 컨테이너는 다른 파일을
    /// 만지게 됩니다.
    pub fn ensure_path_base(&self, working_dir: &str) -> crate::Result<()> {
        let base = normalize_path(&self.path_base, "/");
        let dir = normalize_path(working_dir, "/");
        if base != dir {
            return Err(crate::Error::Config(format!(
                "security.path_base '{}' must match container.working_dir '{}'",
                self.path_base, working_dir
            )));
        }
        Ok(())
    }
}

/// 기본 차단 명령어
fn default_blocked_commands() -> Vec<String> {
    [
        // 시스템 파괴
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:",
        "mkfs",
        "dd if=/dev/zero",
        // 권한 상승
        "sudo",
        "su root",
        // 시스템 제어
        "shutdown",
        "reboot",
        "poweroff",
        // 네트워크 악용
        "regex:bash\\s+-i\\s+>&\\s*/dev/tcp",
        "nc -e",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 기본 차단 경로
fn default_blocked_paths() -> Vec<String> {
    [
        "/etc/shadow",
        "/etc/sudoers",
        "/proc/kcore",
        "/var/run/docker.sock",
        ".ssh",
        ".gnupg",
        ".aws",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ============================================================================
// Project Policy
// ============================================================================

/// 허용 프로젝트 정책
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectPolicy {
    /// 허용 프로젝트 (glob 패턴 가능, 비어 있으면 전체 허용)
    pub allowed: Vec<String>,
}

impl ProjectPolicy {
    pub fn allow(projects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: projects.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_mode_parse() {
        assert_eq!("always".parse::<ApprovalMode>().unwrap(), ApprovalMode::Always);
        assert_eq!("on-miss".parse::<ApprovalMode>().unwrap(), ApprovalMode::OnMiss);
        assert_eq!("auto".parse::<ApprovalMode>().unwrap(), ApprovalMode::Auto);
        assert!("sometimes".parse::<ApprovalMode>().is_err());
    }

    #[test]
    fn test_approval_mode_serde_kebab() {
        let json = serde_json::to_string(&ApprovalMode::OnMiss).unwrap();
        assert_eq!(json, "\"on-miss\"");
    }

    #[test]
    fn test_rule_list_activity() {
        assert!(!RuleList::disabled().is_active());
        assert!(!RuleList::enabled(Vec::<String>::new()).is_active());
        assert!(RuleList::enabled(["ls"]).is_active());
    }

    #[test]
    fn test_path_base_must_match_working_dir() {
        let policy = SecurityPolicy::default();
        policy.ensure_path_base("/workspace").unwrap();
        policy.ensure_path_base("/workspace/").unwrap();
        assert!(matches!(
            policy.ensure_path_base("/etc"),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_default_policy_blocks_sudo() {
        let policy = SecurityPolicy::default();
        assert!(policy.command_blocklist.patterns.contains(&"sudo".to_string()));
        assert!(policy.auto_approve_timeout().is_none());
    }
}
