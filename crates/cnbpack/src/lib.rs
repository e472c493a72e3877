//! cnbpack client
//!
//! Validates build inputs, resolves the builder and run image, assembles an
//! ephemeral builder and drives the buildpacks lifecycle on top of
//! `cnbpack-builder` and `cnbpack-container`.

pub mod client;
pub mod env;

pub use client::{BuildOptions, BuilderInfo, Client, RunOptions, run_image_name};
pub use env::{parse_env, parse_env_file};
