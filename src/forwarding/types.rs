//! Forward kinds, specs and registry entries

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{validate_host, validate_port, ForwardError};

/// Type of port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

impl ForwardType {
    /// Prefix used in forward identities
    pub fn prefix(&self) -> &'static str {
        match self {
            ForwardType::Local => "L",
            ForwardType::Remote => "R",
            ForwardType::Dynamic => "D",
        }
    }
}

impl fmt::Display for ForwardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForwardType::Local => "local",
            ForwardType::Remote => "remote",
            ForwardType::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}

impl FromStr for ForwardType {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "l" => Ok(ForwardType::Local),
            "remote" | "r" => Ok(ForwardType::Remote),
            "dynamic" | "d" | "socks" | "socks5" => Ok(ForwardType::Dynamic),
            _ => Err(ForwardError::UnsupportedForwardType(s.to_string())),
        }
    }
}

/// What to forward. Each kind carries exactly the endpoints it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ForwardSpec {
    /// Listen locally, connect to `remote_host:remote_port` through the tunnel
    Local {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    /// Ask the server to listen on `remote_port`, connect back to `local_host:local_port`
    Remote {
        remote_port: u16,
        local_host: String,
        local_port: u16,
    },
    /// Local SOCKS5 proxy, destination negotiated per connection
    Dynamic { local_port: u16 },
}

impl ForwardSpec {
    pub fn local(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        ForwardSpec::Local {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn remote(remote_port: u16, local_host: impl Into<String>, local_port: u16) -> Self {
        ForwardSpec::Remote {
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }

    pub fn dynamic(local_port: u16) -> Self {
        ForwardSpec::Dynamic { local_port }
    }

    /// Build a spec from a string discriminator and raw fields.
    ///
    /// `port` is the listening port (local for local/dynamic, remote for
    /// remote); `host`/`target_port` are ignored for dynamic forwards.
    pub fn from_parts(
        kind: &str,
        port: u16,
        host: &str,
        target_port: u16,
    ) -> Result<Self, ForwardError> {
        Ok(match kind.parse::<ForwardType>()? {
            ForwardType::Local => ForwardSpec::local(port, host, target_port),
            ForwardType::Remote => ForwardSpec::remote(port, host, target_port),
            ForwardType::Dynamic => ForwardSpec::dynamic(port),
        })
    }

    pub fn forward_type(&self) -> ForwardType {
        match self {
            ForwardSpec::Local { .. } => ForwardType::Local,
            ForwardSpec::Remote { .. } => ForwardType::Remote,
            ForwardSpec::Dynamic { .. } => ForwardType::Dynamic,
        }
    }

    /// Composite identity, derived from the raw parameters
    pub fn id(&self) -> String {
        match self {
            ForwardSpec::Local {
                local_port,
                remote_host,
                remote_port,
            } => format!("L:{}:{}:{}", local_port, remote_host, remote_port),
            ForwardSpec::Remote {
                remote_port,
                local_host,
                local_port,
            } => format!("R:{}:{}:{}", remote_port, local_host, local_port),
            ForwardSpec::Dynamic { local_port } => format!("D:{}", local_port),
        }
    }

    pub fn validate(&self) -> Result<(), ForwardError> {
        match self {
            ForwardSpec::Local {
                local_port,
                remote_host,
                remote_port,
            } => {
                validate_port("localPort", *local_port)?;
                validate_host("remoteHost", remote_host)?;
                validate_port("remotePort", *remote_port)
            }
            ForwardSpec::Remote {
                remote_port,
                local_host,
                local_port,
            } => {
                validate_port("remotePort", *remote_port)?;
                validate_host("localHost", local_host)?;
                validate_port("localPort", *local_port)
            }
            ForwardSpec::Dynamic { local_port } => validate_port("localPort", *local_port),
        }
    }

    /// Port on the local side (listener for local/dynamic, target for remote)
    pub fn local_port(&self) -> u16 {
        match self {
            ForwardSpec::Local { local_port, .. }
            | ForwardSpec::Remote { local_port, .. }
            | ForwardSpec::Dynamic { local_port } => *local_port,
        }
    }

    /// Port on the remote side, if fixed at setup time
    pub fn remote_port(&self) -> Option<u16> {
        match self {
            ForwardSpec::Local { remote_port, .. } | ForwardSpec::Remote { remote_port, .. } => {
                Some(*remote_port)
            }
            ForwardSpec::Dynamic { .. } => None,
        }
    }

    /// Host connections are relayed to, if fixed at setup time
    pub fn remote_host(&self) -> Option<&str> {
        match self {
            ForwardSpec::Local { remote_host, .. } => Some(remote_host),
            ForwardSpec::Remote { local_host, .. } => Some(local_host),
            ForwardSpec::Dynamic { .. } => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            ForwardSpec::Local {
                local_port,
                remote_host,
                remote_port,
            } => format!("localhost:{} → {}:{}", local_port, remote_host, remote_port),
            ForwardSpec::Remote {
                remote_port,
                local_host,
                local_port,
            } => format!("remote:{} → {}:{}", remote_port, local_host, local_port),
            ForwardSpec::Dynamic { local_port } => format!("SOCKS5 localhost:{}", local_port),
        }
    }
}

/// Status of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Stopped,
    Active,
    /// Registered but not functional; must be removed explicitly
    Error,
}

/// A registered forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEntry {
    pub id: String,
    pub spec: ForwardSpec,
    pub status: ForwardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ForwardEntry {
    pub(crate) fn new(spec: ForwardSpec, status: ForwardStatus) -> Self {
        Self {
            id: spec.id(),
            spec,
            status,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn forward_type(&self) -> ForwardType {
        self.spec.forward_type()
    }

    pub fn description(&self) -> String {
        self.spec.description()
    }

    pub fn is_active(&self) -> bool {
        self.status == ForwardStatus::Active
    }
}
