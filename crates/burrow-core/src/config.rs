//! Lifecycle and session configuration types.

use crate::catalog::ImageCatalog;
use crate::error::CoreError;
use burrow_engine::PortBinding;
use std::time::Duration;

/// Default shell run inside instances and terminal sessions.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Configuration for the [`LifecycleController`](crate::LifecycleController).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// OS label to image mapping.
    pub catalog: ImageCatalog,
    /// Main process of every container (default: `/bin/sh`).
    pub shell: String,
    /// Grace period before the engine kills a stopping container (default: 10s).
    pub stop_grace: Duration,
    /// Container names are `<prefix>-<instance id>` (default: `burrow`).
    pub container_prefix: String,
    /// Host port mappings applied to every new container.
    pub ports: Vec<PortBinding>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            catalog: ImageCatalog::default(),
            shell: DEFAULT_SHELL.to_string(),
            stop_grace: Duration::from_secs(10),
            container_prefix: "burrow".to_string(),
            ports: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Create a new config builder.
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.catalog.is_empty() {
            return Err(CoreError::InvalidConfig("image catalog is empty".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(CoreError::InvalidConfig("shell is required".into()));
        }
        let prefix_ok = !self.container_prefix.is_empty()
            && self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !prefix_ok {
            return Err(CoreError::InvalidConfig(format!(
                "container_prefix {:?} must be non-empty [a-zA-Z0-9_.-]",
                self.container_prefix
            )));
        }
        for (i, a) in self.ports.iter().enumerate() {
            let clash = self.ports[i + 1..]
                .iter()
                .any(|b| a.host_port == b.host_port && a.protocol == b.protocol);
            if clash {
                return Err(CoreError::InvalidConfig(format!(
                    "host port {}/{} published twice",
                    a.host_port, a.protocol
                )));
            }
        }
        Ok(())
    }
}

/// Builder for ControllerConfig.
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn catalog(mut self, catalog: ImageCatalog) -> Self {
        self.config.catalog = catalog;
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    pub fn container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.container_prefix = prefix.into();
        self
    }

    /// Publish a port on every new container.
    pub fn port(mut self, binding: PortBinding) -> Self {
        self.config.ports.push(binding);
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ControllerConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for the [`SessionBridge`](crate::SessionBridge).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell started by each terminal session (default: `/bin/sh`).
    pub shell: String,
    /// Close a session after this long without traffic in either direction.
    pub idle_timeout: Option<Duration>,
    /// Upper bound when coalescing output chunks into one frame (default: 64 KiB).
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            idle_timeout: None,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.shell.trim().is_empty() {
            return Err(CoreError::InvalidConfig("shell is required".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "max_frame_bytes must be > 0".into(),
            ));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(CoreError::InvalidConfig(
                "idle_timeout must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.config.max_frame_bytes = bytes;
        self
    }

    pub fn build(self) -> Result<SessionConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
