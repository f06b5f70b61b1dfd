//! GC Policy - 컨테이너 풀 정리 정책

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Garbage collector policy
///
/// Durations are stored as milliseconds. `None` limits are unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    /// Idle time before eviction
    pub max_idle_ms: u64,
    pub max_containers_per_user: Option<usize>,
    pub max_containers_per_project: Option<usize>,
    /// Aggregate disk ceiling across tracked containers
    pub max_disk_bytes: Option<u64>,
    /// Aggregate memory ceiling across tracked containers
    pub max_memory_bytes: Option<u64>,
    /// Keep failed-task containers this long after failure
    pub preserve_failed_ms: u64,
    /// Keep completed-task containers this long after completion
    pub preserve_completed_ms: u64,
    /// Snapshot to the storage backend before destroying
    pub backup_before_delete: bool,
    /// Sweep period
    pub sweep_interval_ms: u64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            max_idle_ms: 30 * 60 * 1000,
            max_containers_per_user: None,
            max_containers_per_project: None,
            max_disk_bytes: None,
            max_memory_bytes: None,
            preserve_failed_ms: 24 * 60 * 60 * 1000,
            preserve_completed_ms: 0,
            backup_before_delete: false,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl GcPolicy {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn preserve_failed(&self) -> Duration {
        Duration::from_millis(self.preserve_failed_ms)
    }

    pub fn preserve_completed(&self) -> Duration {
        Duration::from_millis(self.preserve_completed_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle_ms = duration_ms(idle);
        self
    }

    pub fn with_preserve_failed(mut self, window: Duration) -> Self {
        self.preserve_failed_ms = duration_ms(window);
        self
    }

    pub fn with_preserve_completed(mut self, window: Duration) -> Self {
        self.preserve_completed_ms = duration_ms(window);
        self
    }

    pub fn with_user_quota(mut self, max: usize) -> Self {
        self.max_containers_per_user = Some(max);
        self
    }

    pub fn with_project_quota(mut self, max: usize) -> Self {
        self.max_containers_per_project = Some(max);
        self
    }

    pub fn with_memory_ceiling(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    pub fn with_disk_ceiling(mut self, bytes: u64) -> Self {
        self.max_disk_bytes = Some(bytes);
        self
    }

    pub fn with_backup(mut self, enabled: bool) -> Self {
        self.backup_before_delete = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_idle_ms == 0 {
            return Err(Error::Validation("gc.max_idle_ms must be non-zero".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Validation("gc.sweep_interval_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
