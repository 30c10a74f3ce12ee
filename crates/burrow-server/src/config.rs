//! Configuration for the burrow server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::auth::TokenIdentity;
use burrow_core::{ControllerConfig, SessionConfig, DEFAULT_SHELL};
use burrow_engine::PortBinding;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the burrow server.
#[derive(Clone)]
pub struct BurrowConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Docker endpoint; local defaults when unset.
    pub docker_host: Option<String>,

    /// JSON file backing the registry; in-memory when unset.
    pub state_file: Option<PathBuf>,

    /// Shell used as container PID 1 and for terminal sessions.
    pub shell: String,

    /// Idle timeout for terminal sessions (`None` disables).
    pub session_idle: Option<Duration>,

    /// Grace period passed to the engine on stop.
    pub stop_timeout: Duration,

    /// Raw `host:container[/proto]` list applied to new containers.
    pub publish_ports: Option<String>,

    /// Raw `token=owner_id[:display name]` list.
    pub tokens: Option<String>,

    /// Container-name prefix.
    pub container_prefix: String,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port binding: {0}")]
    InvalidPort(String),

    #[error("invalid token entry: {0}")]
    InvalidToken(String),

    #[error("invalid docker host: {0}")]
    InvalidDockerHost(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 3000),
            docker_host: None,
            state_file: None,
            shell: DEFAULT_SHELL.to_string(),
            session_idle: Some(Duration::from_secs(1800)),
            stop_timeout: Duration::from_secs(10),
            publish_ports: None,
            tokens: None,
            container_prefix: "burrow".to_string(),
        }
    }
}

// Tokens are credentials; never print them.
impl fmt::Debug for BurrowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BurrowConfig")
            .field("http_addr", &self.http_addr)
            .field("docker_host", &self.docker_host)
            .field("state_file", &self.state_file)
            .field("shell", &self.shell)
            .field("session_idle", &self.session_idle)
            .field("stop_timeout", &self.stop_timeout)
            .field("publish_ports", &self.publish_ports)
            .field("tokens", &self.tokens.as_ref().map(|_| "<redacted>"))
            .field("container_prefix", &self.container_prefix)
            .finish()
    }
}

impl BurrowConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BURROW_HTTP_HOST` | `0.0.0.0` |
    /// | `BURROW_HTTP_PORT` | `3000` |
    /// | `BURROW_DOCKER_HOST` | local defaults |
    /// | `BURROW_STATE_FILE` | unset (in-memory registry) |
    /// | `BURROW_SHELL` | `/bin/sh` |
    /// | `BURROW_SESSION_IDLE_SECS` | `1800` (`0` disables) |
    /// | `BURROW_STOP_TIMEOUT_SECS` | `10` |
    /// | `BURROW_PUBLISH_PORTS` | unset (e.g. `25565:25565/tcp`) |
    /// | `BURROW_TOKENS` | unset (e.g. `s3cret=1234:alice`) |
    /// | `BURROW_CONTAINER_PREFIX` | `burrow` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let http_host: IpAddr = var("BURROW_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = var("BURROW_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        let session_idle = match var("BURROW_SESSION_IDLE_SECS").and_then(|v| v.parse::<u64>().ok()) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default.session_idle,
        };

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            docker_host: var("BURROW_DOCKER_HOST"),
            state_file: var("BURROW_STATE_FILE").map(PathBuf::from),
            shell: var("BURROW_SHELL").unwrap_or(default.shell),
            session_idle,
            stop_timeout: var("BURROW_STOP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.stop_timeout),
            publish_ports: var("BURROW_PUBLISH_PORTS"),
            tokens: var("BURROW_TOKENS"),
            container_prefix: var("BURROW_CONTAINER_PREFIX").unwrap_or(default.container_prefix),
        }
    }

    /// Parsed port bindings.
    pub fn ports(&self) -> Result<Vec<PortBinding>, ConfigError> {
        let Some(raw) = &self.publish_ports else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<PortBinding>().map_err(ConfigError::InvalidPort))
            .collect()
    }

    /// Identity provider built from the token table.
    pub fn identity(&self) -> Result<TokenIdentity, ConfigError> {
        TokenIdentity::parse(self.tokens.as_deref().unwrap_or_default())
    }

    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let mut builder = ControllerConfig::builder()
            .shell(&self.shell)
            .stop_grace(self.stop_timeout)
            .container_prefix(&self.container_prefix);
        for port in self.ports()? {
            builder = builder.port(port);
        }
        builder
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut builder = SessionConfig::builder().shell(&self.shell);
        if let Some(idle) = self.session_idle {
            builder = builder.idle_timeout(idle);
        }
        builder
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Validate everything that can be checked without touching the engine.
    ///
    /// Call this at startup to get clear error messages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(host) = &self.docker_host {
            let known = ["unix://", "tcp://", "http://"]
                .iter()
                .any(|scheme| host.starts_with(scheme));
            if !known {
                return Err(ConfigError::InvalidDockerHost(host.clone()));
            }
        }
        self.identity()?;
        self.controller_config()?;
        self.session_config()?;
        Ok(())
    }

    /// Log warnings for settings that are valid but probably unintended.
    pub fn validate_warn(&self) {
        if self.tokens.is_none() {
            tracing::warn!("BURROW_TOKENS is not set; every request will be rejected");
        }
        if self.state_file.is_none() {
            tracing::warn!("BURROW_STATE_FILE is not set; instance records are lost on restart");
        }
        if self.session_idle.is_none() {
            tracing::warn!("Session idle timeout disabled; abandoned sessions are never reaped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BurrowConfig::from_lookup(lookup(&[]));
        assert_eq!(config.http_addr.port(), 3000);
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.session_idle, Some(Duration::from_secs(1800)));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.container_prefix, "burrow");
        assert!(config.docker_host.is_none());
        assert!(config.state_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = BurrowConfig::from_lookup(lookup(&[
            ("BURROW_HTTP_HOST", "127.0.0.1"),
            ("BURROW_HTTP_PORT", "8081"),
            ("BURROW_DOCKER_HOST", "tcp://10.0.0.5:2375"),
            ("BURROW_STATE_FILE", "/var/lib/burrow/instances.json"),
            ("BURROW_SESSION_IDLE_SECS", "0"),
            ("BURROW_STOP_TIMEOUT_SECS", "3"),
            ("BURROW_PUBLISH_PORTS", "25565, 8080:80/tcp"),
            ("BURROW_TOKENS", "abc=1234:alice"),
        ]));
        assert_eq!(config.http_addr.to_string(), "127.0.0.1:8081");
        assert_eq!(config.session_idle, None);
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(
            config.ports().unwrap(),
            vec![PortBinding::tcp(25565), "8080:80/tcp".parse().unwrap()]
        );
        assert!(config.validate().is_ok());

        let controller = config.controller_config().unwrap();
        assert_eq!(controller.ports.len(), 2);
        assert!(config.session_config().unwrap().idle_timeout.is_none());
    }

    #[test]
    fn test_unparsable_numbers_fall_back() {
        let config = BurrowConfig::from_lookup(lookup(&[
            ("BURROW_HTTP_PORT", "not-a-port"),
            ("BURROW_SESSION_IDLE_SECS", "soon"),
        ]));
        assert_eq!(config.http_addr.port(), 3000);
        assert_eq!(config.session_idle, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_port = BurrowConfig::from_lookup(lookup(&[("BURROW_PUBLISH_PORTS", "0:80")]));
        assert!(matches!(bad_port.validate(), Err(ConfigError::InvalidPort(_))));

        let bad_host = BurrowConfig::from_lookup(lookup(&[("BURROW_DOCKER_HOST", "ftp://x")]));
        assert!(matches!(
            bad_host.validate(),
            Err(ConfigError::InvalidDockerHost(_))
        ));

        let bad_token = BurrowConfig::from_lookup(lookup(&[("BURROW_TOKENS", "no-owner")]));
        assert!(matches!(
            bad_token.validate(),
            Err(ConfigError::InvalidToken(_))
        ));

        let bad_prefix =
            BurrowConfig::from_lookup(lookup(&[("BURROW_CONTAINER_PREFIX", "a b")]));
        assert!(matches!(bad_prefix.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let config = BurrowConfig::from_lookup(lookup(&[("BURROW_TOKENS", "s3cret=1234")]));
        let printed = format!("{config:?}");
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
