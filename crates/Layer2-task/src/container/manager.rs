//! Container Lifecycle Manager
//!
//! Tracks the containers this process created and forwards
//! create/exec/destroy/list/logs to the runtime adapter. Knows nothing
//! about task policy; the engine decides what runs, this only runs it.

use super::{Container, ContainerId, ContainerRequest, Retention};
use crate::runtime::{
    CreateRequest, ExecOptions, ExecutionResult, ResourceUsage, RuntimeAdapter, RuntimeContainer,
    RuntimeError, RuntimeKind, CONTAINER_LABEL, MANAGED_LABEL, PROJECT_LABEL, TASK_LABEL,
    USER_LABEL,
};
use bastion_foundation::{Error, Result, SharedClock};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transcript lines kept per container
const MAX_TRANSCRIPT_LINES: usize = 2000;

pub struct LifecycleManager {
    runtime: Arc<dyn RuntimeAdapter>,
    clock: SharedClock,
    containers: RwLock<HashMap<ContainerId, Container>>,
    transcripts: Mutex<HashMap<ContainerId, VecDeque<String>>>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, clock: SharedClock) -> Self {
        Self {
            runtime,
            clock,
            containers: RwLock::new(HashMap::new()),
            transcripts: Mutex::new(HashMap::new()),
        }
    }

    /// Id handed out before the runtime call so callers can correlate
    /// even a failed creation
    pub fn generate_container_id(&self) -> ContainerId {
        ContainerId::generate()
    }

    pub fn runtime_kind(&self) -> RuntimeKind {
        self.runtime.kind()
    }

    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await.map_err(Error::from)
    }

    // ========================================================================
    // Create / destroy
    // ========================================================================

    pub async fn create_container(&self, request: ContainerRequest) -> Result<Container> {
        request.spec.validate()?;

        let ContainerRequest { id, owner, spec } = request;

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_LABEL.to_string(), id.to_string());
        labels.insert(TASK_LABEL.to_string(), owner.task_id.full());
        labels.insert(PROJECT_LABEL.to_string(), owner.project.clone());
        if let Some(user) = &owner.user {
            labels.insert(USER_LABEL.to_string(), user.clone());
        }

        let create = CreateRequest {
            name: id.runtime_name(),
            spec: spec.clone(),
            labels,
        };
        let runtime_id = self.runtime.create(&create).await?;

        let now = self.clock.now();
        let container = Container {
            id: id.clone(),
            runtime_id,
            runtime: self.runtime.kind(),
            owner,
            spec,
            created_at: now,
            last_activity: now,
            retention: Retention::Active,
        };

        info!(
            container_id = %id,
            runtime_id = %container.runtime_id,
            task_id = %container.owner.task_id,
            "Container created"
        );
        self.containers.write().insert(id, container.clone());
        Ok(container)
    }

    /// Remove a container; an id that is already gone is not an error
    pub async fn destroy_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        let Some(container) = self.containers.write().remove(id) else {
            debug!(container_id = %id, "Destroy on untracked container, nothing to do");
            return Ok(());
        };

        match self.runtime.remove(&container.runtime_id, force).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                self.transcripts.lock().remove(id);
                info!(container_id = %id, "Container destroyed");
                Ok(())
            }
            Err(e) => {
                // keep tracking it so a later sweep can retry
                self.containers.write().entry(id.clone()).or_insert(container);
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Exec / files
    // ========================================================================

    pub async fn exec_in_container(
        &self,
        id: &ContainerId,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecutionResult> {
        let (runtime_id, working_dir) = self.lookup(id, |c| {
            (c.runtime_id.clone(), c.spec.working_dir.clone())
        })?;

        let options = if options.working_dir.is_none() {
            options.with_working_dir(working_dir)
        } else {
            options
        };

        self.touch(id);
        let result = self
            .runtime
            .exec(&runtime_id, command, &options)
            .await
            .map_err(|e| self.stale(id, e))?;
        self.touch(id);

        debug!(
            container_id = %id,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "Command finished"
        );

        let mut transcripts = self.transcripts.lock();
        let lines = transcripts.entry(id.clone()).or_default();
        lines.push_back(format!("$ {}", command));
        lines.extend(result.combined().lines().map(str::to_string));
        while lines.len() > MAX_TRANSCRIPT_LINES {
            lines.pop_front();
        }

        Ok(result)
    }

    /// Read a file; `options.timeout` bounds the read like any exec
    pub async fn read_file(
        &self,
        id: &ContainerId,
        path: &str,
        options: ExecOptions,
    ) -> Result<String> {
        let (runtime_id, options) = self.file_target(id, options)?;
        self.touch(id);
        let content = self
            .runtime
            .read_file(&runtime_id, path, &options)
            .await
            .map_err(|e| self.stale(id, e))?;
        self.touch(id);
        Ok(content)
    }

    pub async fn write_file(
        &self,
        id: &ContainerId,
        path: &str,
        content: &str,
        options: ExecOptions,
    ) -> Result<()> {
        let (runtime_id, options) = self.file_target(id, options)?;
        self.touch(id);
        self.runtime
            .write_file(&runtime_id, path, content, &options)
            .await
            .map_err(|e| self.stale(id, e))?;
        self.touch(id);
        Ok(())
    }

    fn file_target(&self, id: &ContainerId, options: ExecOptions) -> Result<(String, ExecOptions)> {
        let (runtime_id, working_dir) = self.lookup(id, |c| {
            (c.runtime_id.clone(), c.spec.working_dir.clone())
        })?;
        let options = if options.working_dir.is_none() {
            options.with_working_dir(working_dir)
        } else {
            options
        };
        Ok((runtime_id, options))
    }

    /// Files changed under the container's working directory
    pub async fn changed_files(&self, id: &ContainerId) -> Result<Vec<String>> {
        let (runtime_id, working_dir) = self.lookup(id, |c| {
            (c.runtime_id.clone(), c.spec.working_dir.clone())
        })?;
        self.runtime
            .changed_files(&runtime_id, &working_dir)
            .await
            .map_err(|e| self.stale(id, e))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Tracked containers, oldest first
    pub fn list_containers(&self) -> Vec<Container> {
        let mut list: Vec<Container> = self.containers.read().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn get_container(&self, id: &ContainerId) -> Option<Container> {
        self.containers.read().get(id).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.containers.read().len()
    }

    /// Last `tail` lines of the exec transcript, or the runtime's own log
    /// when nothing ran through this manager
    pub async fn get_container_logs(&self, id: &ContainerId, tail: usize) -> Result<String> {
        let runtime_id = self.lookup(id, |c| c.runtime_id.clone())?;

        {
            let transcripts = self.transcripts.lock();
            if let Some(lines) = transcripts.get(id).filter(|l| !l.is_empty()) {
                let start = lines.len().saturating_sub(tail);
                return Ok(lines
                    .iter()
                    .skip(start)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n"));
            }
        }

        self.runtime
            .logs(&runtime_id, tail)
            .await
            .map_err(|e| self.stale(id, e))
    }

    pub async fn usage(&self, id: &ContainerId) -> Result<ResourceUsage> {
        let runtime_id = self.lookup(id, |c| c.runtime_id.clone())?;
        self.runtime.usage(&runtime_id).await.map_err(Error::from)
    }

    /// Filesystem export for backups
    pub async fn snapshot(&self, id: &ContainerId) -> Result<Vec<u8>> {
        let runtime_id = self.lookup(id, |c| c.runtime_id.clone())?;
        self.runtime.export(&runtime_id).await.map_err(Error::from)
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    pub fn touch(&self, id: &ContainerId) {
        let now = self.clock.now();
        if let Some(c) = self.containers.write().get_mut(id) {
            c.last_activity = now;
        }
    }

    /// Keep a container past its task, marked with the task outcome
    pub fn mark_retained(&self, id: &ContainerId, retention: Retention) {
        let now = self.clock.now();
        if let Some(c) = self.containers.write().get_mut(id) {
            c.retention = retention;
            c.last_activity = now;
        }
    }

    /// Every runtime container carrying the managed label
    pub async fn list_runtime_managed(&self) -> Result<Vec<RuntimeContainer>> {
        Ok(self.runtime.list(MANAGED_LABEL).await?)
    }

    pub fn tracked_runtime_ids(&self) -> HashSet<String> {
        self.containers
            .read()
            .values()
            .map(|c| c.runtime_id.clone())
            .collect()
    }

    /// Remove a runtime container this manager does not track
    pub async fn remove_runtime(&self, runtime_id: &str) -> Result<()> {
        match self.runtime.remove(runtime_id, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lookup<T>(&self, id: &ContainerId, f: impl FnOnce(&Container) -> T) -> Result<T> {
        self.containers
            .read()
            .get(id)
            .map(f)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// The runtime lost the container behind our back: stop tracking it
    fn stale(&self, id: &ContainerId, e: RuntimeError) -> Error {
        if let RuntimeError::NotFound(_) = e {
            warn!(container_id = %id, "Container vanished from the runtime");
            self.containers.write().remove(id);
            self.transcripts.lock().remove(id);
            return Error::ContainerNotFound(id.to_string());
        }
        e.into()
    }
}
