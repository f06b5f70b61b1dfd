//! Container Runtime Adapter
//!
//! Thin seam over a container engine. Docker and Podman both speak the
//! Docker Engine API, so one bollard-backed adapter serves both;
//! `InMemoryRuntime` stands in for tests and dry runs.
//!
//! Adapters know nothing about tasks. They create, exec in, inspect and
//! remove containers by runtime id.

mod docker;
mod memory;

pub use docker::DockerRuntime;
pub use memory::{InMemoryRuntime, ScriptedExec};

use async_trait::async_trait;
use bastion_foundation::{ContainerSpec, Error, RuntimeConfig, RuntimeSelection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Label present on every container this system creates
pub const MANAGED_LABEL: &str = "bastion.managed";
/// Label carrying the tracked container id
pub const CONTAINER_LABEL: &str = "bastion.container";
pub const TASK_LABEL: &str = "bastion.task";
pub const PROJECT_LABEL: &str = "bastion.project";
pub const USER_LABEL: &str = "bastion.user";

// ============================================================================
// Runtime kind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
    Memory,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Runtime adapter error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image unavailable: {0}")]
    Image(String),

    #[error("{0}")]
    Other(String),
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => Error::RuntimeUnavailable(msg),
            RuntimeError::NotFound(id) => Error::ContainerNotFound(id),
            RuntimeError::Image(msg) => Error::Runtime(format!("image unavailable: {}", msg)),
            RuntimeError::Other(msg) => Error::Runtime(msg),
        }
    }
}

// ============================================================================
// Requests / responses
// ============================================================================

/// Create call input
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Runtime-side container name
    pub name: String,
    pub spec: ContainerSpec,
    /// Management labels merged over `spec.labels`
    pub labels: BTreeMap<String, String>,
}

impl CreateRequest {
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.spec.labels.clone();
        labels.extend(self.labels.clone());
        labels
    }
}

/// Exec options
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Hard limit; the command is killed when it elapses
    pub timeout: Option<Duration>,
    pub working_dir: Option<String>,
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Exit code reported for commands killed on timeout (128 + SIGKILL)
pub const TIMEOUT_EXIT_CODE: i64 = 137;

/// Container exec result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut content = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&self.stderr);
        }
        content
    }

    pub(crate) fn timed_out(duration: Duration, stdout: String, stderr: String) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout,
            stderr,
            duration,
            timed_out: true,
        }
    }
}

/// A container as listed by the runtime
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub runtime_id: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

// ============================================================================
// Adapter trait
// ============================================================================

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Reachability check
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Pull-or-reuse the image, create and start; returns the runtime id
    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError>;

    async fn exec(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult, RuntimeError>;

    /// `NotFound` when the container is already gone
    async fn remove(&self, runtime_id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Containers (running or not) carrying `label`
    async fn list(&self, label: &str) -> Result<Vec<RuntimeContainer>, RuntimeError>;

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn usage(&self, runtime_id: &str) -> Result<ResourceUsage, RuntimeError>;

    /// Filesystem export (tar stream bytes)
    async fn export(&self, runtime_id: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Paths changed since creation, limited to `under`
    async fn changed_files(&self, runtime_id: &str, under: &str)
        -> Result<Vec<String>, RuntimeError>;

    /// Default goes through `exec`, so `options.timeout` bounds the read
    async fn read_file(
        &self,
        runtime_id: &str,
        path: &str,
        options: &ExecOptions,
    ) -> Result<String, RuntimeError> {
        let command = format!("cat -- {}", quote(path)?);
        let out = self.exec(runtime_id, &command, options).await?;
        file_result(out, "read", path).map(|out| out.stdout)
    }

    async fn write_file(
        &self,
        runtime_id: &str,
        path: &str,
        content: &str,
        options: &ExecOptions,
    ) -> Result<(), RuntimeError> {
        let target = quote(path)?;
        let command = format!(
            "mkdir -p \"$(dirname -- {target})\" && printf '%s' {} > {target}",
            quote(content)?,
        );
        let out = self.exec(runtime_id, &command, options).await?;
        file_result(out, "write", path).map(|_| ())
    }
}

fn file_result(
    out: ExecutionResult,
    op: &str,
    path: &str,
) -> Result<ExecutionResult, RuntimeError> {
    if out.timed_out {
        return Err(RuntimeError::Other(format!(
            "{} {} timed out after {}s",
            op,
            path,
            out.duration.as_secs()
        )));
    }
    if !out.success() {
        return Err(RuntimeError::Other(format!(
            "{} {} failed: {}",
            op,
            path,
            out.stderr.trim()
        )));
    }
    Ok(out)
}

fn quote(s: &str) -> Result<String, RuntimeError> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| RuntimeError::Other(format!("cannot quote argument: {}", e)))
}

// ============================================================================
// Detection
// ============================================================================

/// Connect to the configured runtime
///
/// `auto` tries the Docker default socket, then rootless Podman, then
/// rootful Podman, keeping the first that answers a ping.
pub async fn connect(config: &RuntimeConfig) -> bastion_foundation::Result<Arc<dyn RuntimeAdapter>> {
    match config.kind {
        RuntimeSelection::Memory => {
            info!("Using in-memory container runtime");
            Ok(Arc::new(InMemoryRuntime::new()))
        }
        RuntimeSelection::Docker => {
            let runtime = match &config.socket {
                Some(socket) => DockerRuntime::connect_socket(socket, RuntimeKind::Docker)?,
                None => DockerRuntime::connect_default()?,
            };
            ready(runtime).await
        }
        RuntimeSelection::Podman => {
            if let Some(socket) = &config.socket {
                return ready(DockerRuntime::connect_socket(socket, RuntimeKind::Podman)?).await;
            }
            for socket in podman_sockets() {
                if let Ok(runtime) = try_socket(&socket, RuntimeKind::Podman).await {
                    return Ok(runtime);
                }
            }
            Err(Error::RuntimeUnavailable("no Podman socket answered".to_string()))
        }
        RuntimeSelection::Auto => {
            if let Ok(runtime) = DockerRuntime::connect_default() {
                if runtime.ping().await.is_ok() {
                    info!(runtime = "docker", "Container runtime detected");
                    return Ok(Arc::new(runtime));
                }
            }
            for socket in podman_sockets() {
                if let Ok(runtime) = try_socket(&socket, RuntimeKind::Podman).await {
                    return Ok(runtime);
                }
            }
            Err(Error::RuntimeUnavailable(
                "neither Docker nor Podman is reachable".to_string(),
            ))
        }
    }
}

async fn try_socket(
    socket: &str,
    kind: RuntimeKind,
) -> bastion_foundation::Result<Arc<dyn RuntimeAdapter>> {
    debug!(socket = %socket, runtime = %kind, "Probing runtime socket");
    ready(DockerRuntime::connect_socket(socket, kind)?).await
}

async fn ready(runtime: DockerRuntime) -> bastion_foundation::Result<Arc<dyn RuntimeAdapter>> {
    runtime.ping().await?;
    info!(runtime = %runtime.kind(), "Container runtime detected");
    Ok(Arc::new(runtime))
}

fn podman_sockets() -> Vec<String> {
    let mut sockets = Vec::new();
    if let Some(dir) = dirs::runtime_dir() {
        sockets.push(dir.join("podman").join("podman.sock").to_string_lossy().into_owned());
    }
    sockets.push("/run/podman/podman.sock".to_string());
    sockets
}
