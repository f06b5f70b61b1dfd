//! Config - 통합 설정 관리
//!
//! - `container.rs` - 컨테이너 이미지/리소스/보안 프로필
//! - `gc.rs` - 컨테이너 풀 정리 정책
//! - `bastion.rs` - BastionConfig 통합 설정 (TOML)

mod bastion;
mod container;
mod gc;

pub use bastion::{AuditConfig, BastionConfig, RuntimeConfig, RuntimeSelection, CONFIG_FILE};
pub use container::{
    parse_size, ContainerSpec, NetworkMode, ResourceLimits, SecurityProfile, VolumeMount,
};
pub use gc::GcPolicy;
