//! cnbpack builder functionality
//!
//! This crate assembles ephemeral builder images: it parses image references,
//! reads and writes builder metadata, builds buildpack/env/order/stack layers,
//! selects run-image mirrors and fetches images from the Docker daemon or a
//! registry.

pub mod auth;
pub mod builder;
pub mod buildpack;
pub mod error;
pub mod fetch;
pub mod image;
pub mod layer;
pub mod metadata;
pub mod progress;
pub mod reference;
pub mod stack;

pub use auth::{REGISTRY_AUTH_ENV, RegistryAuth};
pub use builder::{Builder, ENV_GID, ENV_UID};
pub use buildpack::Buildpack;
pub use error::{BuildError, BuildResult};
pub use fetch::{DockerFetcher, FetchedImage, ImageFetcher};
pub use image::{DockerImage, Image, MemoryImage, RemoteImage};
pub use layer::{LayerFactory, dir_archive};
pub use metadata::{
    BuilderMetadata, BuildpackMetadata, GroupBuildpack, GroupMetadata, METADATA_LABEL,
};
pub use progress::PullProgress;
pub use reference::ImageRef;
pub use stack::{RunImageMetadata, STACK_ID_LABEL, StackMetadata};
