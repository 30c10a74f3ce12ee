//! Request shapes for container and exec creation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Label marking containers created by burrow.
pub const LABEL_MANAGED: &str = "burrow.managed";
/// Label carrying the owning instance id.
pub const LABEL_INSTANCE: &str = "burrow.instance";
/// Label carrying the owner id.
pub const LABEL_OWNER: &str = "burrow.owner";

/// Everything the engine needs to materialize a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference, e.g. `alpine:latest`.
    pub image: String,
    /// Container name (must be unique on the engine).
    pub name: String,
    /// Command run as the container's main process.
    pub cmd: Vec<String>,
    /// Allocate a pseudo-TTY for the main process.
    pub tty: bool,
    /// Keep stdin open so an interactive main process does not exit.
    pub open_stdin: bool,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Host port bindings.
    pub ports: Vec<PortBinding>,
}

impl ContainerSpec {
    /// Start a spec for `image` named `name`, running `/bin/sh` with a TTY.
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            cmd: vec!["/bin/sh".to_string()],
            tty: true,
            open_stdin: true,
            labels: HashMap::new(),
            ports: Vec::new(),
        }
    }

    /// Replace the main command.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add host port bindings.
    pub fn ports(mut self, ports: impl IntoIterator<Item = PortBinding>) -> Self {
        self.ports.extend(ports);
        self
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A single `host:container/proto` port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: PortProtocol,
}

impl PortBinding {
    /// TCP binding with identical host and container port.
    pub fn tcp(port: u16) -> Self {
        Self {
            host_port: port,
            container_port: port,
            protocol: PortProtocol::Tcp,
        }
    }

    /// Engine key for the container side, e.g. `25565/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_key())
    }
}

impl FromStr for PortBinding {
    type Err = String;

    /// Parse `host:container[/tcp|/udp]` or a bare `port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, PortProtocol::Tcp),
            Some((ports, "udp")) => (ports, PortProtocol::Udp),
            Some((_, other)) => return Err(format!("unknown protocol '{other}' in '{s}'")),
            None => (s, PortProtocol::Tcp),
        };

        let parse = |p: &str| {
            p.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("invalid port '{p}' in '{s}'"))
        };

        let (host_port, container_port) = match ports.split_once(':') {
            Some((host, container)) => (parse(host)?, parse(container)?),
            None => {
                let port = parse(ports)?;
                (port, port)
            }
        };

        Ok(Self {
            host_port,
            container_port,
            protocol,
        })
    }
}

/// Parameters for spawning a process inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
}

impl ExecSpec {
    /// An interactive shell with all three streams attached and a TTY.
    pub fn interactive_shell(shell: impl Into<String>) -> Self {
        Self {
            cmd: vec![shell.into()],
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_defaults() {
        let spec = ContainerSpec::new("alpine:latest", "burrow-1");
        assert_eq!(spec.cmd, vec!["/bin/sh"]);
        assert!(spec.tty);
        assert!(spec.open_stdin);
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn test_port_binding_parse() {
        let p: PortBinding = "8080:80".parse().unwrap();
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, PortProtocol::Tcp);

        let p: PortBinding = "25565".parse().unwrap();
        assert_eq!(p, PortBinding::tcp(25565));
        assert_eq!(p.container_key(), "25565/tcp");

        let p: PortBinding = "53:53/udp".parse().unwrap();
        assert_eq!(p.protocol, PortProtocol::Udp);
        assert_eq!(p.to_string(), "53:53/udp");
    }

    #[test]
    fn test_port_binding_rejects_garbage() {
        assert!("abc".parse::<PortBinding>().is_err());
        assert!("0:80".parse::<PortBinding>().is_err());
        assert!("80:80/sctp".parse::<PortBinding>().is_err());
        assert!("70000".parse::<PortBinding>().is_err());
    }

    #[test]
    fn test_interactive_shell_attaches_everything() {
        let exec = ExecSpec::interactive_shell("/bin/bash");
        assert_eq!(exec.cmd, vec!["/bin/bash"]);
        assert!(exec.attach_stdin && exec.attach_stdout && exec.attach_stderr && exec.tty);
    }
}
