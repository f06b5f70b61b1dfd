//! Bastion Config - 통합 설정
//!
//! 컴포넌트별 강타입 섹션을 하나의 TOML 파일로 묶습니다.
//! 로드 시점에 전체를 검증하므로 잘못된 설정은 Task 실행 전에 드러납니다.
//!
//! ```toml
//! [runtime]
//! kind = "auto"
//!
//! [container]
//! image = "rust:1.75"
//!
//! [security]
//! approval_mode = "on-miss"
//!
//! [gc]
//! max_idle_ms = 600000
//!
//! [audit]
//! retention_days = 30
//!
//! [projects]
//! allowed = ["web", "infra-*"]
//! ```

use super::container::ContainerSpec;
use super::gc::GcPolicy;
use crate::audit::DEFAULT_SENSITIVE_KEYS;
use crate::policy::{ConfiguredProjects, Enforcer, ProjectPolicy, SecurityPolicy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 설정 파일명
pub const CONFIG_FILE: &str = "config.toml";

// ============================================================================
// Runtime
// ============================================================================

/// 사용할 컨테이너 런타임
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSelection {
    /// Docker → rootless Podman → rootful Podman 순서로 탐지
    #[default]
    Auto,
    Docker,
    Podman,
    /// 인메모리 (dry-run)
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeSelection,
    /// 소켓 경로 직접 지정 (`unix:///...` 또는 파일 경로)
    pub socket: Option<String>,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite 경로 (없으면 data_local_dir/bastion/audit.db)
    pub db_path: Option<PathBuf>,
    pub retention_days: u32,
    pub prune_interval_secs: u64,
    pub queue_capacity: usize,
    pub redacted_keys: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            retention_days: 90,
            prune_interval_secs: 3600,
            queue_capacity: crate::audit::DEFAULT_QUEUE_CAPACITY,
            redacted_keys: DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl AuditConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bastion")
                .join("audit.db")
        })
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(Error::Validation("audit.retention_days must be non-zero".to_string()));
        }
        if self.prune_interval_secs == 0 {
            return Err(Error::Validation(
                "audit.prune_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Validation("audit.queue_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// BastionConfig
// ============================================================================

/// Bastion 통합 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionConfig {
    pub runtime: RuntimeConfig,
    pub container: ContainerSpec,
    pub security: SecurityPolicy,
    pub gc: GcPolicy,
    pub audit: AuditConfig,
    pub projects: ProjectPolicy,
}

impl BastionConfig {
    /// 기본 설정 파일 경로 (`~/.config/bastion/config.toml`)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bastion")
            .join(CONFIG_FILE)
    }

    /// 파일에서 로드 후 검증 (파일이 없으면 기본값)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let config = Self::from_toml(&raw)?;
            info!(path = %path.display(), "Loaded configuration");
            config
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            let config = Self::default();
            config.validate()?;
            config
        };
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// TOML 문자열 파싱 후 검증
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 모든 섹션 검증 (정책 패턴 컴파일 포함)
    pub fn validate(&self) -> Result<()> {
        self.container.validate()?;
        self.gc.validate()?;
        self.audit.validate()?;
        Enforcer::new(self.security.clone())?;
        self.security.ensure_path_base(&self.container.working_dir)?;
        ConfiguredProjects::new(&self.projects)?;
        Ok(())
    }
}
