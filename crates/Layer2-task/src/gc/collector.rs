//! Garbage Collector
//!
//! One `sweep()` pass:
//!
//! 1. drop leased containers (a task is executing in them)
//! 2. drop containers still inside their failed/completed preserve window
//! 3. select idle containers (`now - last_activity > max_idle`)
//! 4. select per-user / per-project excess, oldest activity first
//! 5. select for disk / memory ceilings, largest first
//! 6. for each selection: claim → backup (best effort) → destroy
//! 7. remove untracked managed runtime containers older than `max_idle`

use crate::container::{Container, ContainerId, LeaseTable, LifecycleManager, Retention};
use crate::gc::SnapshotStore;
use crate::runtime::{ResourceUsage, CONTAINER_LABEL};
use bastion_foundation::{best_effort, elapsed_between, GcPolicy, Result, SharedClock};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a container was selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum EvictionReason {
    Idle { idle_ms: u64 },
    UserQuota { user: String },
    ProjectQuota { project: String },
    DiskCeiling,
    MemoryCeiling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub container_id: ContainerId,
    pub reason: EvictionReason,
    pub backed_up: bool,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<Eviction>,
    /// Containers skipped because a task holds them
    pub skipped_busy: usize,
    /// Containers kept by a preserve window
    pub preserved: usize,
    pub backup_failures: usize,
    /// Selected but the runtime refused to remove them
    pub destroy_failures: usize,
    pub orphans_removed: usize,
}

impl EvictionReport {
    pub fn evicted_ids(&self) -> Vec<ContainerId> {
        self.evicted.iter().map(|e| e.container_id.clone()).collect()
    }
}

struct Candidate {
    container: Container,
    usage: ResourceUsage,
}

pub struct GarbageCollector {
    manager: Arc<LifecycleManager>,
    leases: Arc<LeaseTable>,
    policy: Arc<RwLock<GcPolicy>>,
    backup: Option<Arc<dyn SnapshotStore>>,
    clock: SharedClock,
}

impl GarbageCollector {
    pub fn new(
        manager: Arc<LifecycleManager>,
        leases: Arc<LeaseTable>,
        policy: Arc<RwLock<GcPolicy>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            manager,
            leases,
            policy,
            backup: None,
            clock,
        }
    }

    /// Snapshot destination used when `backup_before_delete` is set
    pub fn with_backup(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.backup = Some(store);
        self
    }

    pub fn policy(&self) -> GcPolicy {
        self.policy.read().clone()
    }

    /// Replace the policy after validating it
    pub fn set_policy(&self, policy: GcPolicy) -> Result<()> {
        policy.validate()?;
        *self.policy.write() = policy;
        Ok(())
    }

    /// Sweep on the policy's interval until the handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let every = self.policy.read().sweep_interval();
                tokio::time::sleep(every).await;
                let report = self.sweep().await;
                if !report.evicted.is_empty() || report.orphans_removed > 0 {
                    info!(
                        evicted = report.evicted.len(),
                        orphans = report.orphans_removed,
                        skipped_busy = report.skipped_busy,
                        "GC sweep finished"
                    );
                }
            }
        })
    }

    pub async fn sweep(&self) -> EvictionReport {
        let policy = self.policy();
        let now = self.clock.now();
        let mut report = EvictionReport::default();

        let all = self.manager.list_containers();

        let mut usage = HashMap::new();
        if policy.max_disk_bytes.is_some() || policy.max_memory_bytes.is_some() {
            for container in &all {
                let measured = self.manager.usage(&container.id).await.unwrap_or_else(|e| {
                    debug!(container_id = %container.id, error = %e, "Usage unavailable");
                    ResourceUsage::default()
                });
                usage.insert(container.id.clone(), measured);
            }
        }

        let mut candidates = Vec::new();
        for container in &all {
            if self.leases.is_busy(&container.id) {
                report.skipped_busy += 1;
                continue;
            }
            if self.preserved(container, &policy, now) {
                report.preserved += 1;
                continue;
            }
            candidates.push(Candidate {
                container: container.clone(),
                usage: usage.get(&container.id).copied().unwrap_or_default(),
            });
        }

        let selected = select(&policy, now, &all, &usage, &candidates);

        for (id, reason) in selected {
            if !self.leases.claim_for_eviction(&id) {
                // leased between selection and now
                report.skipped_busy += 1;
                continue;
            }

            let mut backed_up = false;
            if policy.backup_before_delete {
                match self.backup(&id, now).await {
                    Ok(()) => backed_up = true,
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "Backup failed, evicting anyway");
                        report.backup_failures += 1;
                    }
                }
            }

            let destroyed = best_effort(
                "container eviction",
                self.manager.destroy_container(&id, true).await,
            );
            self.leases.finish_eviction(&id);

            match destroyed {
                Some(()) => {
                    info!(container_id = %id, reason = ?reason, "Container evicted");
                    report.evicted.push(Eviction {
                        container_id: id,
                        reason,
                        backed_up,
                    });
                }
                None => report.destroy_failures += 1,
            }
        }

        report.orphans_removed = self.sweep_orphans(&policy, now).await;
        report
    }

    fn preserved(&self, container: &Container, policy: &GcPolicy, now: DateTime<Utc>) -> bool {
        match container.retention {
            Retention::Active => false,
            Retention::Failed { at } => elapsed_between(at, now) < policy.preserve_failed(),
            Retention::Completed { at } => elapsed_between(at, now) < policy.preserve_completed(),
        }
    }

    async fn backup(&self, id: &ContainerId, now: DateTime<Utc>) -> Result<()> {
        let Some(store) = &self.backup else {
            return Err(bastion_foundation::Error::Storage(
                "no snapshot store configured".to_string(),
            ));
        };
        let bytes = self.manager.snapshot(id).await?;
        let key = format!("{}-{}.tar", id, now.format("%Y%m%dT%H%M%SZ"));
        store.upload(&key, bytes).await?;
        debug!(container_id = %id, key = %key, "Snapshot uploaded");
        Ok(())
    }

    async fn sweep_orphans(&self, policy: &GcPolicy, now: DateTime<Utc>) -> usize {
        let listed = match self.manager.list_runtime_managed().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Orphan scan skipped");
                return 0;
            }
        };

        let tracked = self.manager.tracked_runtime_ids();
        let mut removed = 0;

        for orphan in listed {
            if tracked.contains(&orphan.runtime_id) {
                continue;
            }
            // created by a task whose manager has not registered it yet
            let holder = orphan
                .labels
                .get(CONTAINER_LABEL)
                .and_then(|id| self.leases.holder(&ContainerId(id.clone())));
            if let Some(task_id) = holder {
                debug!(
                    runtime_id = %orphan.runtime_id,
                    task_id = %task_id,
                    "Leased container not yet tracked, skipped"
                );
                continue;
            }
            if elapsed_between(orphan.created_at, now) <= policy.max_idle() {
                continue;
            }
            if best_effort("orphan removal", self.manager.remove_runtime(&orphan.runtime_id).await)
                .is_some()
            {
                info!(runtime_id = %orphan.runtime_id, "Orphan container removed");
                removed += 1;
            }
        }
        removed
    }
}

/// Pick evictions from `candidates`; `all` includes busy/preserved
/// containers, which still count toward quotas and ceilings
fn select(
    policy: &GcPolicy,
    now: DateTime<Utc>,
    all: &[Container],
    usage: &HashMap<ContainerId, ResourceUsage>,
    candidates: &[Candidate],
) -> Vec<(ContainerId, EvictionReason)> {
    let mut chosen: Vec<(ContainerId, EvictionReason)> = Vec::new();
    let mut taken: HashSet<ContainerId> = HashSet::new();

    // oldest activity first
    let mut by_age: Vec<&Candidate> = candidates.iter().collect();
    by_age.sort_by(|a, b| {
        a.container
            .last_activity
            .cmp(&b.container.last_activity)
            .then_with(|| a.container.id.cmp(&b.container.id))
    });

    let max_idle = policy.max_idle();
    for c in &by_age {
        let idle = elapsed_between(c.container.last_activity, now);
        if idle > max_idle {
            taken.insert(c.container.id.clone());
            chosen.push((
                c.container.id.clone(),
                EvictionReason::Idle {
                    idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                },
            ));
        }
    }

    if let Some(max) = policy.max_containers_per_user {
        quota_pass(
            max,
            all,
            &by_age,
            &mut taken,
            &mut chosen,
            |c| c.owner.user.clone(),
            |user| EvictionReason::UserQuota { user },
        );
    }

    if let Some(max) = policy.max_containers_per_project {
        quota_pass(
            max,
            all,
            &by_age,
            &mut taken,
            &mut chosen,
            |c| Some(c.owner.project.clone()),
            |project| EvictionReason::ProjectQuota { project },
        );
    }

    if let Some(ceiling) = policy.max_disk_bytes {
        ceiling_pass(
            ceiling,
            all,
            usage,
            &by_age,
            &mut taken,
            &mut chosen,
            |u| u.disk_bytes,
            EvictionReason::DiskCeiling,
        );
    }

    if let Some(ceiling) = policy.max_memory_bytes {
        ceiling_pass(
            ceiling,
            all,
            usage,
            &by_age,
            &mut taken,
            &mut chosen,
            |u| u.memory_bytes,
            EvictionReason::MemoryCeiling,
        );
    }

    chosen
}

fn quota_pass(
    max: usize,
    all: &[Container],
    by_age: &[&Candidate],
    taken: &mut HashSet<ContainerId>,
    chosen: &mut Vec<(ContainerId, EvictionReason)>,
    key: impl Fn(&Container) -> Option<String>,
    reason: impl Fn(String) -> EvictionReason,
) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for c in all.iter().filter(|c| !taken.contains(&c.id)) {
        if let Some(k) = key(c) {
            *counts.entry(k).or_default() += 1;
        }
    }

    for candidate in by_age {
        let c = &candidate.container;
        if taken.contains(&c.id) {
            continue;
        }
        let Some(k) = key(c) else { continue };
        let Some(count) = counts.get_mut(&k) else { continue };
        if *count > max {
            *count -= 1;
            taken.insert(c.id.clone());
            chosen.push((c.id.clone(), reason(k)));
        }
    }
}

fn ceiling_pass(
    ceiling: u64,
    all: &[Container],
    usage: &HashMap<ContainerId, ResourceUsage>,
    by_age: &[&Candidate],
    taken: &mut HashSet<ContainerId>,
    chosen: &mut Vec<(ContainerId, EvictionReason)>,
    metric: impl Fn(&ResourceUsage) -> u64,
    reason: EvictionReason,
) {
    let mut total: u64 = all
        .iter()
        .filter(|c| !taken.contains(&c.id))
        .filter_map(|c| usage.get(&c.id))
        .map(&metric)
        .sum();
    if total <= ceiling {
        return;
    }

    // largest first; stable sort keeps the oldest first among equals
    let mut by_size: Vec<&Candidate> = by_age
        .iter()
        .copied()
        .filter(|c| !taken.contains(&c.container.id))
        .collect();
    by_size.sort_by(|a, b| metric(&b.usage).cmp(&metric(&a.usage)));

    for c in by_size {
        if total <= ceiling {
            break;
        }
        let id = &c.container.id;
        total = total.saturating_sub(metric(&c.usage));
        taken.insert(id.clone());
        chosen.push((id.clone(), reason.clone()));
    }
}
