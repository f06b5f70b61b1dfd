//! # bastion-task
//!
//! Task execution core for Bastion.
//!
//! ## Components
//!
//! - **Task Engine**: intake, approval gating, execution, audit emission
//! - **Container Lifecycle**: create/exec/destroy/list/logs over a runtime
//! - **Runtime adapters**: Docker/Podman (bollard) and in-memory
//! - **Garbage Collector**: idle/quota/ceiling eviction with optional backup
//!
//! ## 흐름
//!
//! ```text
//! submit ──► Enforcer (approval?) ──► needs-approval ──approve──┐
//!    │                                                            ▼
//!    └──────────── auto / clean on-miss ─────────────► lease + create container
//!                                                                 │
//!                              Agent ──► Enforcer ──► exec ◄──────┘
//!                                                                 │
//!                        completed / failed ──► retain or destroy, release lease
//! ```
//!
//! The GC reads the same `LeaseTable` before every eviction, so a
//! container never disappears under a running task.

pub mod agent;
pub mod container;
pub mod engine;
pub mod gc;
pub mod runtime;
pub mod state;
mod store;
pub mod task;

// Task system
pub use agent::{ActionOutcome, Agent, AgentAction, PlannedAgent};
pub use engine::{EngineBuilder, EngineStatus, LogTail, TaskEngine, AUTO_APPROVE_ACTOR};
pub use state::TaskStatus;
pub use task::{Task, TaskId, TaskRequest, TaskResult};

// Container system
pub use container::{
    Container, ContainerId, ContainerOwner, ContainerRequest, LeaseTable, LifecycleManager,
    Retention,
};
pub use runtime::{
    connect, CreateRequest, DockerRuntime, ExecOptions, ExecutionResult, InMemoryRuntime,
    ResourceUsage, RuntimeAdapter, RuntimeContainer, RuntimeError, RuntimeKind, ScriptedExec,
};

// Garbage collection
pub use gc::{
    Eviction, EvictionReason, EvictionReport, GarbageCollector, LocalDirStore, MemoryStore,
    SnapshotStore,
};
