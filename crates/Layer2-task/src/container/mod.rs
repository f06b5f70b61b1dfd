//! Container Lifecycle
//!
//! - `LifecycleManager`: create/exec/destroy/list/logs over a runtime adapter
//! - `LeaseTable`: the single "is this container busy" map shared by the
//!   Task Engine and the Garbage Collector

mod lease;
mod manager;
mod types;

pub use lease::LeaseTable;
pub use manager::LifecycleManager;
pub use types::{Container, ContainerId, ContainerOwner, ContainerRequest, Retention};
