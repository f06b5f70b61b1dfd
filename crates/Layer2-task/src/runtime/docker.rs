//! Docker/Podman adapter (Docker Engine API via bollard)
//!
//! Containers stay alive with `sleep infinity`; every command runs through
//! exec. The per-command timeout is enforced twice: `timeout -s KILL`
//! inside the container kills the process, and an outer deadline stops
//! waiting on the exec stream if the runtime does not cooperate.

use super::{
    CreateRequest, ExecOptions, ExecutionResult, ResourceUsage, RuntimeAdapter, RuntimeContainer,
    RuntimeError, RuntimeKind,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// API client timeout (seconds)
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Extra time granted to the exec stream beyond the in-container kill
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Per-stream cap on collected exec output
const MAX_STREAM_BYTES: usize = 4 * 1024 * 1024;

const TRUNCATED_MARKER: &str = "\n[output truncated]\n";

/// Docker/Podman runtime adapter
pub struct DockerRuntime {
    docker: Docker,
    kind: RuntimeKind,
}

impl DockerRuntime {
    /// Docker default socket (`DOCKER_HOST` or `/var/run/docker.sock`)
    pub fn connect_default() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            kind: RuntimeKind::Docker,
        })
    }

    /// Explicit unix socket (`unix:///path` or `/path`)
    pub fn connect_socket(socket: &str, kind: RuntimeKind) -> Result<Self, RuntimeError> {
        let path = socket.strip_prefix("unix://").unwrap_or(socket);
        let docker = Docker::connect_with_unix(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", socket, e)))?;
        Ok(Self { docker, kind })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image present, skipping pull");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            if let Err(e) = msg {
                return Err(RuntimeError::Image(format!("{}: {}", image, e)));
            }
        }
        Ok(())
    }
}

fn map_err(id: &str, e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        other => RuntimeError::Other(other.to_string()),
    }
}

fn map_connect_err(e: BollardError) -> RuntimeError {
    RuntimeError::Unavailable(e.to_string())
}

/// Append `chunk` until the stream reaches `MAX_STREAM_BYTES`, then mark
/// it truncated once and drop the rest
fn append_capped(buf: &mut String, chunk: &[u8]) {
    if buf.ends_with(TRUNCATED_MARKER) {
        return;
    }
    let room = MAX_STREAM_BYTES.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.push_str(&String::from_utf8_lossy(chunk));
        return;
    }
    buf.push_str(&String::from_utf8_lossy(&chunk[..room]));
    buf.push_str(TRUNCATED_MARKER);
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(map_connect_err)?;
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        let spec = &request.spec;
        self.ensure_image(&spec.image).await?;

        let memory = spec
            .limits
            .memory_bytes()
            .map_err(|e| RuntimeError::Other(e.to_string()))?
            .map(|m| i64::try_from(m).unwrap_or(i64::MAX));
        let binds: Vec<String> = spec.mounts.iter().map(|m| m.bind_spec()).collect();
        let security_opt = spec.security.security_opts();

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            memory,
            memory_swap: memory,
            nano_cpus: spec.limits.nano_cpus(),
            pids_limit: spec.limits.pids_limit,
            network_mode: Some(spec.network.as_runtime_str().to_string()),
            readonly_rootfs: Some(spec.security.read_only_rootfs),
            cap_drop: (!spec.security.drop_caps.is_empty()).then(|| spec.security.drop_caps.clone()),
            cap_add: (!spec.security.add_caps.is_empty()).then(|| spec.security.add_caps.clone()),
            security_opt: (!security_opt.is_empty()).then_some(security_opt),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env_list()),
            user: spec.security.user.clone(),
            labels: Some(request.all_labels().into_iter().collect::<HashMap<_, _>>()),
            host_config: Some(host_config),
            // Keep container running with a sleep command
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Other(format!("create {}: {}", request.name, e)))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            // don't leave a created-but-dead container behind
            let _ = self.remove(&response.id, true).await;
            return Err(RuntimeError::Other(format!("start {}: {}", request.name, e)));
        }

        info!(
            runtime_id = %response.id,
            name = %request.name,
            image = %spec.image,
            "Container started"
        );
        Ok(response.id)
    }

    async fn exec(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let mut cmd: Vec<String> = Vec::new();
        if let Some(timeout) = options.timeout {
            let secs = timeout.as_secs().max(1);
            cmd.extend(["timeout".into(), "-s".into(), "KILL".into(), secs.to_string()]);
        }
        cmd.extend(["sh".into(), "-c".into(), command.to_string()]);

        let exec = self
            .docker
            .create_exec(
                runtime_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: options.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err(runtime_id, e))?;

        let started = Instant::now();
        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err(runtime_id, e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = output {
            let collect = async {
                while let Some(Ok(msg)) = output.next().await {
                    match msg {
                        LogOutput::StdOut { message } => append_capped(&mut stdout, &message),
                        LogOutput::StdErr { message } => append_capped(&mut stderr, &message),
                        _ => {}
                    }
                }
            };

            match options.timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit + KILL_GRACE, collect).await.is_err() {
                        warn!(runtime_id = %runtime_id, "Exec stream outlived its timeout");
                        return Ok(ExecutionResult::timed_out(started.elapsed(), stdout, stderr));
                    }
                }
                None => collect.await,
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_err(runtime_id, e))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        let duration = started.elapsed();

        if options.timeout.is_some() && exit_code == super::TIMEOUT_EXIT_CODE {
            return Ok(ExecutionResult::timed_out(duration, stdout, stderr));
        }

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out: false,
        })
    }

    async fn remove(&self, runtime_id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                runtime_id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(runtime_id, e))?;
        debug!(runtime_id = %runtime_id, "Container removed");
        Ok(())
    }

    async fn list(&self, label: &str) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_connect_err)?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let runtime_id = s.id?;
                let created_at = s
                    .created
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .unwrap_or_else(Utc::now);
                Some(RuntimeContainer {
                    runtime_id,
                    labels: s.labels.unwrap_or_default().into_iter().collect(),
                    created_at,
                })
            })
            .collect())
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        let mut stream = self.docker.logs(
            runtime_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err(runtime_id, e))?;
            text.push_str(&chunk.to_string());
        }
        Ok(text)
    }

    async fn usage(&self, runtime_id: &str) -> Result<ResourceUsage, RuntimeError> {
        let memory_bytes = {
            let mut stream = self.docker.stats(
                runtime_id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                }),
            );
            match stream.next().await {
                Some(Ok(stats)) => stats.memory_stats.usage.unwrap_or(0),
                Some(Err(e)) => return Err(map_err(runtime_id, e)),
                None => 0,
            }
        };

        let inspect = self
            .docker
            .inspect_container(runtime_id, Some(InspectContainerOptions { size: true }))
            .await
            .map_err(|e| map_err(runtime_id, e))?;
        let disk_bytes = inspect.size_rw.map(|s| s.max(0) as u64).unwrap_or(0);

        Ok(ResourceUsage {
            memory_bytes,
            disk_bytes,
        })
    }

    async fn export(&self, runtime_id: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = self.docker.export_container(runtime_id);
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err(runtime_id, e))?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    async fn changed_files(
        &self,
        runtime_id: &str,
        under: &str,
    ) -> Result<Vec<String>, RuntimeError> {
        let changes = self
            .docker
            .container_changes(runtime_id)
            .await
            .map_err(|e| map_err(runtime_id, e))?;

        let prefix = format!("{}/", under.trim_end_matches('/'));
        let mut paths: Vec<String> = changes
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.path)
            .filter(|p| p.starts_with(&prefix))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_capped_once() {
        let mut buf = String::new();
        append_capped(&mut buf, b"hello ");
        assert_eq!(buf, "hello ");

        let big = vec![b'x'; MAX_STREAM_BYTES];
        append_capped(&mut buf, &big);
        assert!(buf.ends_with(TRUNCATED_MARKER));
        let capped = buf.len();
        assert_eq!(capped, MAX_STREAM_BYTES + TRUNCATED_MARKER.len());

        append_capped(&mut buf, b"more");
        assert_eq!(buf.len(), capped);
    }
}
