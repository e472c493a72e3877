//! コンテナランタイムとライフサイクルフェーズの実行

pub mod app;
pub mod cache;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod naming;
pub mod output;
pub mod phase;
pub mod runtime;

pub use app::AppRunner;
pub use cache::CacheImage;
pub use docker::{DOCKER_SOCKET, DockerRuntime};
pub use error::{ContainerError, Result};
pub use lifecycle::{Lifecycle, LifecycleExecutor, LifecycleOptions, LifecycleRunner};
pub use memory::{ContainerFs, MemoryRuntime, VolumeFile};
pub use naming::NameGenerator;
pub use output::{PrefixWriter, SharedBuffer};
pub use phase::Phase;
pub use runtime::{ContainerRuntime, ContainerSpec, PortMapping};
