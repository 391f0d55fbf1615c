//! cu-engine: container engine client for container-use
//!
//! This crate starts throwaway containers, moves filesystem snapshots in and
//! out of them, and runs commands with captured output.
//!
//! ## Layer 2 - Environment/Tooling
//!
//! Focus: bounded container lifetimes and faithful exit statuses.
//!
//! ## Key Components
//!
//! - `ContainerEngine` / `EngineSession`: engine-agnostic client interface
//! - `DockerEngine`: docker-compatible CLI backend (`docker`, `podman`)
//! - `fakes::MemoryEngine`: in-memory engine with a toy shell, for tests

pub mod client;
pub mod docker;
mod error;
pub mod fakes;

pub use client::{
    ContainerEngine, ContainerId, ContainerSpec, EngineSession, ExecOutput, ExecRequest,
};
pub use docker::{DockerEngine, ENGINE_ENV};
pub use error::EngineError;

/// Result type for cu-engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
