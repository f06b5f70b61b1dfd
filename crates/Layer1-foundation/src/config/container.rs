//! Container Config - 컨테이너 실행 설정
//!
//! Task마다 생성되는 컨테이너의 이미지, 마운트, 리소스 제한,
//! 네트워크, 보안 프로필을 정의합니다.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resource limits for a task container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU limit (number of cores, e.g., 1.5)
    pub cpus: Option<f64>,
    /// Memory limit (e.g., "512m", "2g")
    pub memory: Option<String>,
    /// PIDs limit
    pub pids_limit: Option<i64>,
    /// Wall-clock budget for the whole task, in seconds
    pub timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: Some(2.0),
            memory: Some("2g".to_string()),
            pids_limit: Some(256),
            timeout_secs: 300,
        }
    }
}

impl ResourceLimits {
    /// Create minimal limits for quick tasks
    pub fn minimal() -> Self {
        Self {
            cpus: Some(0.5),
            memory: Some("256m".to_string()),
            pids_limit: Some(64),
            timeout_secs: 60,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> Result<Option<u64>> {
        self.memory.as_deref().map(parse_size).transpose()
    }

    /// Nano-CPUs as the Docker Engine API expects them
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpus.map(|c| (c * 1_000_000_000.0) as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(cpus) = self.cpus {
            if !cpus.is_finite() || cpus <= 0.0 {
                return Err(Error::Validation(format!("cpus must be positive, got {}", cpus)));
            }
        }
        if let Some(pids) = self.pids_limit {
            if pids <= 0 {
                return Err(Error::Validation(format!("pids_limit must be positive, got {}", pids)));
            }
        }
        if let Some(0) = self.memory_bytes()? {
            return Err(Error::Validation("memory limit must be non-zero".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Validation("timeout_secs must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// "512m" / "2g" / "1024" → bytes
pub fn parse_size(raw: &str) -> Result<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::Validation(format!("Invalid size '{}'", raw)))
}

/// Network mode for container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access
    #[default]
    None,
    /// Bridge network
    Bridge,
    /// Host network (full access)
    Host,
    /// Custom network
    Custom(String),
}

impl NetworkMode {
    /// Value for the runtime's `NetworkMode` host config field
    pub fn as_runtime_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::Custom(name) => name,
        }
    }
}

/// Volume mount configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// `host:container[:ro]` bind string
    pub fn bind_spec(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.to_string_lossy(),
            self.container_path.to_string_lossy(),
            ro
        )
    }
}

/// Security profile for container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    /// Read-only root filesystem
    pub read_only_rootfs: bool,
    /// Drop all capabilities except specified
    pub drop_caps: Vec<String>,
    /// Add specific capabilities
    pub add_caps: Vec<String>,
    /// Seccomp profile name or path
    pub seccomp_profile: Option<String>,
    /// Run as non-root user
    pub user: Option<String>,
    /// No new privileges
    pub no_new_privileges: bool,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            read_only_rootfs: false,
            drop_caps: vec!["ALL".to_string()],
            add_caps: vec![],
            seccomp_profile: None,
            user: Some("1000:1000".to_string()),
            no_new_privileges: true,
        }
    }
}

impl SecurityProfile {
    /// Create a strict profile (for untrusted code)
    pub fn strict() -> Self {
        Self {
            read_only_rootfs: true,
            drop_caps: vec!["ALL".to_string()],
            add_caps: vec![],
            seccomp_profile: Some("default".to_string()),
            user: Some("65534:65534".to_string()), // nobody
            no_new_privileges: true,
        }
    }

    /// `security_opt` entries for the runtime
    pub fn security_opts(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.no_new_privileges {
            opts.push("no-new-privileges:true".to_string());
        }
        if let Some(seccomp) = &self.seccomp_profile {
            // "default" means the runtime's built-in profile
            if seccomp != "default" {
                opts.push(format!("seccomp={}", seccomp));
            }
        }
        opts
    }
}

/// Container configuration for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Container image
    pub image: String,
    /// Working directory in container
    pub working_dir: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Volume mounts
    pub mounts: Vec<VolumeMount>,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    pub security: SecurityProfile,
    /// Extra labels (management labels are added by the lifecycle manager)
    pub labels: BTreeMap<String, String>,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            working_dir: "/workspace".to_string(),
            env: BTreeMap::new(),
            mounts: vec![],
            limits: ResourceLimits::default(),
            network: NetworkMode::default(),
            security: SecurityProfile::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, mount: VolumeMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_security(mut self, security: SecurityProfile) -> Self {
        self.security = security;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// `KEY=value` list
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::Validation("container image must not be empty".to_string()));
        }
        if !self.working_dir.starts_with('/') {
            return Err(Error::Validation(format!(
                "working_dir must be absolute, got '{}'",
                self.working_dir
            )));
        }
        for mount in &self.mounts {
            if !mount.container_path.is_absolute() {
                return Err(Error::Validation(format!(
                    "mount target must be absolute, got '{}'",
                    mount.container_path.display()
                )));
            }
        }
        self.limits.validate()
    }
}
