//! Project allowlist
//!
//! `submit` consults a `ProjectAllowlist` before creating a task.

use super::types::ProjectPolicy;
use crate::{Error, Result};

/// Predicate deciding whether tasks may target a project
pub trait ProjectAllowlist: Send + Sync {
    fn is_project_allowed(&self, project: &str) -> bool;
}

/// Allowlist compiled from `ProjectPolicy` (glob patterns, empty = all)
#[derive(Debug, Clone)]
pub struct ConfiguredProjects {
    patterns: Vec<glob::Pattern>,
}

impl ConfiguredProjects {
    pub fn new(policy: &ProjectPolicy) -> Result<Self> {
        let patterns = policy
            .allowed
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Config(format!("Invalid project pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn allow_all() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }
}

impl ProjectAllowlist for ConfiguredProjects {
    fn is_project_allowed(&self, project: &str) -> bool {
        if project.trim().is_empty() {
            return false;
        }
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(project))
    }
}
