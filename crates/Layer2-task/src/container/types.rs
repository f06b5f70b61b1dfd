//! Tracked container types

use crate::runtime::RuntimeKind;
use crate::task::TaskId;
use bastion_foundation::ContainerSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bastion-side container identifier (distinct from the runtime's id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn generate() -> Self {
        Self(format!("bst-{}", Uuid::new_v4().simple()))
    }

    /// Name given to the container on the runtime side
    pub fn runtime_name(&self) -> String {
        format!("bastion-{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who a container was created for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOwner {
    pub task_id: TaskId,
    pub project: String,
    pub user: Option<String>,
}

/// Why a container is still around after its task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Retention {
    /// Owning task not finished yet
    Active,
    Completed { at: DateTime<Utc> },
    Failed { at: DateTime<Utc> },
}

/// A container this system created and still tracks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub runtime_id: String,
    pub runtime: RuntimeKind,
    pub owner: ContainerOwner,
    pub spec: ContainerSpec,
    pub created_at: DateTime<Utc>,
    /// Last exec or file operation
    pub last_activity: DateTime<Utc>,
    pub retention: Retention,
}

/// Input to `create_container`
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Pre-generated so the caller can lease it before creation
    pub id: ContainerId,
    pub owner: ContainerOwner,
    pub spec: ContainerSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_format() {
        let id = ContainerId::generate();
        assert!(id.as_str().starts_with("bst-"));
        assert_eq!(id.as_str().len(), 4 + 32);
        assert_eq!(id.runtime_name(), format!("bastion-{}", id));
        assert_ne!(id, ContainerId::generate());
    }
}
