//! # burrow-core
//!
//! Instance management layer for burrow container "VMs".
//!
//! This crate keeps a registry of which user owns which container, drives
//! container lifecycle through a [`ContainerEngine`](burrow_engine::ContainerEngine),
//! and bridges interactive shells to remote clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    burrow-core                           │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────────┐    ┌────────────────────────┐  │
//! │  │ LifecycleController  │───▶│  InstanceRegistry      │  │
//! │  │   - provision()      │    │   (dyn InstanceStore)  │  │
//! │  │   - decommission()   │    └────────────────────────┘  │
//! │  │   - set_power()      │               ▲                │
//! │  │   - query_status()   │               │                │
//! │  └──────────────────────┘    ┌────────────────────────┐  │
//! │             │                │  SessionBridge         │  │
//! │             │  InstanceLocks │   - attach()           │  │
//! │             │                │   - detach_all()       │  │
//! │             ▼                └────────────────────────┘  │
//! │  ┌──────────────────────┐               │ exec channel   │
//! │  │ dyn ContainerEngine  │◀──────────────┘                │
//! │  │ (from burrow-engine) │                                │
//! │  └──────────────────────┘                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrow_core::{
//!     ClientConnection, ControllerConfig, InstanceLocks, InstanceRegistry,
//!     LifecycleController, OwnerId, SessionBridge, SessionConfig,
//! };
//! use burrow_engine::DockerEngine;
//! use std::sync::Arc;
//!
//! # async fn example() -> burrow_core::Result<()> {
//! let engine = Arc::new(DockerEngine::connect_local()?);
//! let registry = Arc::new(InstanceRegistry::in_memory());
//! let locks = Arc::new(InstanceLocks::new());
//!
//! let controller = LifecycleController::new(
//!     engine.clone(),
//!     registry.clone(),
//!     locks.clone(),
//!     ControllerConfig::default(),
//! );
//! let bridge = SessionBridge::new(engine, registry, locks, SessionConfig::default());
//!
//! let owner = OwnerId::from("u1");
//! let instance = controller.provision(&owner, "box1", "alpine").await?;
//!
//! let session = bridge
//!     .attach(instance.id, &owner, ClientConnection::new(sink, stream))
//!     .await?;
//! session.closed().await;
//!
//! controller.decommission(instance.id, &owner).await?;
//! # Ok(())
//! # }
//! ```

mod catalog;
mod config;
mod error;
mod file_store;
mod identity;
mod instance;
mod lifecycle;
mod locks;
mod registry;
mod relay;
mod session;

pub use catalog::ImageCatalog;
pub use config::{
    ControllerConfig, ControllerConfigBuilder, SessionConfig, SessionConfigBuilder, DEFAULT_SHELL,
};
pub use error::{CoreError, Result, StoreError};
pub use file_store::JsonFileStore;
pub use identity::{AuthError, Identity, IdentityProvider};
pub use instance::{Instance, InstanceId, InstancePhase, OwnerId};
pub use lifecycle::{DriftReport, LifecycleController, PowerAction, RuntimeStatus};
pub use locks::InstanceLocks;
pub use registry::{InstanceRegistry, InstanceStore, Lookup, MemoryStore};
pub use session::{
    ClientConnection, ClientFrame, CloseReason, ServerFrame, Session, SessionBridge, SessionId,
    SessionOutcome, SessionState,
};
