//! In-memory runtime
//!
//! Containers are plain records. Commands are answered by scripts matched
//! on substring (first registered wins), with a built-in `echo`. Used by
//! the test suite and for dry runs without a container engine.

use super::{
    CreateRequest, ExecOptions, ExecutionResult, ResourceUsage, RuntimeAdapter, RuntimeContainer,
    RuntimeError, RuntimeKind,
};
use async_trait::async_trait;
use bastion_foundation::policy::normalize_path;
use bastion_foundation::SharedClock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Canned reply for commands containing a pattern
#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Simulated run time; longer than the exec timeout means a kill
    pub delay: Option<Duration>,
    /// Files the command leaves behind (path, content)
    pub writes: Vec<(String, String)>,
}

impl ScriptedExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_write(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.writes.push((path.into(), content.into()));
        self
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    working_dir: String,
    files: BTreeMap<String, String>,
    changed: BTreeSet<String>,
    usage: ResourceUsage,
    log: Vec<String>,
}

impl FakeContainer {
    fn put(&mut self, path: &str, content: &str) {
        let path = normalize_path(path, &self.working_dir);
        self.files.insert(path.clone(), content.to_string());
        self.changed.insert(path);
    }
}

#[derive(Debug)]
struct State {
    containers: HashMap<String, FakeContainer>,
    scripts: Vec<(String, ScriptedExec)>,
    available: bool,
    fail_next_create: Option<String>,
    create_delay: Option<Duration>,
    file_delay: Option<Duration>,
    executed: Vec<String>,
    remove_calls: usize,
    next_id: u64,
}

/// Container runtime that never leaves the process
pub struct InMemoryRuntime {
    state: Mutex<State>,
    clock: Option<SharedClock>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                containers: HashMap::new(),
                scripts: Vec::new(),
                available: true,
                fail_next_create: None,
                create_delay: None,
                file_delay: None,
                executed: Vec::new(),
                remove_calls: 0,
                next_id: 0,
            }),
            clock: None,
        }
    }

    /// Stamp creation times from `clock` instead of the wall clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map(|c| c.now()).unwrap_or_else(Utc::now)
    }

    /// Reply with `exec` to any command containing `pattern`
    pub fn script(&self, pattern: impl Into<String>, exec: ScriptedExec) {
        self.state.lock().scripts.push((pattern.into(), exec));
    }

    /// Simulate the engine going away (every call fails with `Unavailable`)
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make the next `create` fail with `message`
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.state.lock().fail_next_create = Some(message.into());
    }

    /// Make every `create` take `delay` before it answers
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Make file reads and writes take `delay` (a FIFO, a slow mount)
    pub fn set_file_delay(&self, delay: Duration) {
        self.state.lock().file_delay = Some(delay);
    }

    /// Sleep out the file delay; past the exec timeout the call fails
    async fn file_wait(
        &self,
        op: &str,
        path: &str,
        options: &ExecOptions,
    ) -> Result<(), RuntimeError> {
        let delay = self.state.lock().file_delay.unwrap_or_default();
        if let Some(limit) = options.timeout {
            if delay > limit {
                tokio::time::sleep(limit).await;
                return Err(RuntimeError::Other(format!(
                    "{} {} timed out after {}s",
                    op,
                    path,
                    limit.as_secs()
                )));
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// A managed-looking container nobody is tracking
    pub fn insert_orphan(
        &self,
        labels: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> String {
        let mut state = self.state.lock();
        let id = Self::allocate_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels,
                created_at,
                working_dir: "/workspace".to_string(),
                files: BTreeMap::new(),
                changed: BTreeSet::new(),
                usage: ResourceUsage::default(),
                log: Vec::new(),
            },
        );
        id
    }

    pub fn set_usage(&self, runtime_id: &str, usage: ResourceUsage) {
        if let Some(c) = self.state.lock().containers.get_mut(runtime_id) {
            c.usage = usage;
        }
    }

    /// Containers currently alive
    pub fn live_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn contains(&self, runtime_id: &str) -> bool {
        self.state.lock().containers.contains_key(runtime_id)
    }

    /// Every command that reached `exec`, in order
    pub fn executed_commands(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().remove_calls
    }

    /// Content of a file inside a container
    pub fn file(&self, runtime_id: &str, path: &str) -> Option<String> {
        let state = self.state.lock();
        let c = state.containers.get(runtime_id)?;
        c.files.get(&normalize_path(path, &c.working_dir)).cloned()
    }

    fn allocate_id(state: &mut State) -> String {
        state.next_id += 1;
        format!("mem-{:06}", state.next_id)
    }

    fn check_available(state: &State) -> Result<(), RuntimeError> {
        if state.available {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("in-memory runtime switched off".into()))
        }
    }

    fn reply_for(state: &State, command: &str) -> ScriptedExec {
        if let Some((_, exec)) = state
            .scripts
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return exec.clone();
        }

        match command.strip_prefix("echo ") {
            Some(rest) => ScriptedExec::ok(format!("{}\n", rest.trim_matches(&['"', '\''][..]))),
            None => ScriptedExec::default(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for InMemoryRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Memory
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Self::check_available(&self.state.lock())
    }

    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let created_at = self.now();
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        if let Some(message) = state.fail_next_create.take() {
            return Err(RuntimeError::Other(message));
        }

        let id = Self::allocate_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels: request.all_labels(),
                created_at,
                working_dir: request.spec.working_dir.clone(),
                files: BTreeMap::new(),
                changed: BTreeSet::new(),
                usage: ResourceUsage::default(),
                log: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn exec(
        &self,
        runtime_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult, RuntimeError> {
        let reply = {
            let mut state = self.state.lock();
            Self::check_available(&state)?;
            if !state.containers.contains_key(runtime_id) {
                return Err(RuntimeError::NotFound(runtime_id.to_string()));
            }
            state.executed.push(command.to_string());
            Self::reply_for(&state, command)
        };

        let delay = reply.delay.unwrap_or_default();
        if let Some(limit) = options.timeout {
            if delay > limit {
                tokio::time::sleep(limit).await;
                return Ok(ExecutionResult::timed_out(limit, reply.stdout, reply.stderr));
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = ExecutionResult {
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
            duration: delay,
            timed_out: false,
        };

        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        for (path, content) in &reply.writes {
            container.put(path, content);
        }
        container.log.push(result.combined());
        Ok(result)
    }

    async fn remove(&self, runtime_id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.remove_calls += 1;
        state
            .containers
            .remove(runtime_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }

    async fn list(&self, label: &str) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let state = self.state.lock();
        Self::check_available(&state)?;

        let (key, value) = match label.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (label, None),
        };

        let mut found: Vec<RuntimeContainer> = state
            .containers
            .iter()
            .filter(|(_, c)| match (c.labels.get(key), value) {
                (Some(v), Some(want)) => v == want,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|(id, c)| RuntimeContainer {
                runtime_id: id.clone(),
                labels: c.labels.clone(),
                created_at: c.created_at,
            })
            .collect();
        found.sort_by(|a, b| a.runtime_id.cmp(&b.runtime_id));
        Ok(found)
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.state.lock();
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        let lines: Vec<&str> = c.log.iter().flat_map(|chunk| chunk.lines()).collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    async fn usage(&self, runtime_id: &str) -> Result<ResourceUsage, RuntimeError> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        state
            .containers
            .get(runtime_id)
            .map(|c| c.usage)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }

    async fn export(&self, runtime_id: &str) -> Result<Vec<u8>, RuntimeError> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        serde_json::to_vec(&c.files).map_err(|e| RuntimeError::Other(e.to_string()))
    }

    async fn changed_files(
        &self,
        runtime_id: &str,
        under: &str,
    ) -> Result<Vec<String>, RuntimeError> {
        let state = self.state.lock();
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        let prefix = format!("{}/", under.trim_end_matches('/'));
        Ok(c.changed
            .iter()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn read_file(
        &self,
        runtime_id: &str,
        path: &str,
        options: &ExecOptions,
    ) -> Result<String, RuntimeError> {
        self.file_wait("read", path, options).await?;
        let state = self.state.lock();
        Self::check_available(&state)?;
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        let resolved = normalize_path(path, &c.working_dir);
        c.files
            .get(&resolved)
            .cloned()
            .ok_or_else(|| RuntimeError::Other(format!("read {} failed: no such file", resolved)))
    }

    async fn write_file(
        &self,
        runtime_id: &str,
        path: &str,
        content: &str,
        options: &ExecOptions,
    ) -> Result<(), RuntimeError> {
        self.file_wait("write", path, options).await?;
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let c = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        c.put(path, content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_foundation::ContainerSpec;

    fn request() -> CreateRequest {
        CreateRequest {
            name: "bastion-test".into(),
            spec: ContainerSpec::default(),
            labels: BTreeMap::from([("bastion.managed".to_string(), "true".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_script_and_echo() {
        let rt = InMemoryRuntime::new();
        rt.script("cargo test", ScriptedExec::fail(101, "1 test failed"));
        let id = rt.create(&request()).await.unwrap();

        let out = rt.exec(&id, "echo hello", &ExecOptions::default()).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert!(out.success());

        let out = rt.exec(&id, "cargo test --all", &ExecOptions::default()).await.unwrap();
        assert_eq!(out.exit_code, 101);
        assert_eq!(rt.executed_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_delay_past_timeout_is_killed() {
        let rt = InMemoryRuntime::new();
        rt.script("sleep", ScriptedExec::ok("").with_delay(Duration::from_secs(30)));
        let id = rt.create(&request()).await.unwrap();

        let opts = ExecOptions::default().with_timeout(Duration::from_millis(20));
        let out = rt.exec(&id, "sleep 30", &opts).await.unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, super::super::TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_files_and_changes() {
        let rt = InMemoryRuntime::new();
        let id = rt.create(&request()).await.unwrap();

        let opts = ExecOptions::default();
        rt.write_file(&id, "src/lib.rs", "fn main() {}", &opts).await.unwrap();
        assert_eq!(
            rt.read_file(&id, "/workspace/src/lib.rs", &opts).await.unwrap(),
            "fn main() {}"
        );
        assert_eq!(
            rt.changed_files(&id, "/workspace").await.unwrap(),
            vec!["/workspace/src/lib.rs".to_string()]
        );
        assert!(rt.read_file(&id, "missing.txt", &opts).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_twice_reports_not_found() {
        let rt = InMemoryRuntime::new();
        let id = rt.create(&request()).await.unwrap();
        rt.remove(&id, true).await.unwrap();
        assert!(matches!(rt.remove(&id, true).await, Err(RuntimeError::NotFound(_))));
        assert_eq!(rt.live_count(), 0);
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let rt = InMemoryRuntime::new();
        rt.create(&request()).await.unwrap();
        rt.insert_orphan(BTreeMap::new(), Utc::now());

        assert_eq!(rt.list("bastion.managed").await.unwrap().len(), 1);
        assert_eq!(rt.list("bastion.managed=true").await.unwrap().len(), 1);
        assert_eq!(rt.list("bastion.managed=false").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let rt = InMemoryRuntime::new();
        rt.set_available(false);
        assert!(matches!(rt.ping().await, Err(RuntimeError::Unavailable(_))));
        assert!(rt.create(&request()).await.is_err());
    }
}
