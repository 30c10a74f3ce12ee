//! # burrow-engine
//!
//! Container runtime adapter for burrow instances.
//! Provides a thin, retry-free abstraction over the Docker Engine API.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burrow_engine::{ContainerEngine, ContainerSpec, DockerEngine, ExecSpec};
//!
//! # async fn example() -> burrow_engine::Result<()> {
//! let engine = DockerEngine::connect_local()?;
//! engine.ping().await?;
//!
//! // Create and start a container running an idle shell
//! let id = engine
//!     .create(&ContainerSpec::new("alpine:latest", "burrow-demo"))
//!     .await?;
//! engine.start(&id).await?;
//!
//! // Attach an interactive shell
//! let exec_id = engine
//!     .exec_create(&id, &ExecSpec::interactive_shell("/bin/sh"))
//!     .await?;
//! let channel = engine.exec_start(&exec_id).await?;
//! drop(channel);
//!
//! // Cleanup
//! engine.stop(&id, std::time::Duration::from_secs(5)).await?;
//! engine.remove(&id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Container CRUD**: list, create, start, stop, restart, remove, inspect
//! - **Exec Channels**: duplex byte streams into a process with independently closable halves
//! - **Error Taxonomy**: unavailable / not found / rejected, surfaced unchanged
//! - **Test Engine**: in-memory `FakeEngine` behind the `test-util` feature

mod config;
mod docker;
mod engine;
mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use config::{
    ContainerSpec, ExecSpec, PortBinding, PortProtocol, LABEL_INSTANCE, LABEL_MANAGED,
    LABEL_OWNER,
};
pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, ContainerStatus, ContainerSummary, ExecChannel, ExecInput, ExecOutput,
    RawState,
};
pub use error::{EngineError, Result};
