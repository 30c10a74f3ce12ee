//! # burrow-server
//!
//! HTTP and WebSocket front end for burrow instances.
//!
//! Requests authenticate with a bearer token (or a `token` query parameter
//! on the terminal upgrade) mapped to an owner by [`TokenIdentity`].
//! Everything behind the router lives in `burrow-core`.

pub mod auth;
pub mod config;
pub mod http;
pub mod terminal;
pub mod types;

pub use auth::{Caller, TokenIdentity};
pub use config::{BurrowConfig, ConfigError};
pub use http::{build_router, serve, ApiError, AppState};
