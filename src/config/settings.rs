//! Forwarding settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::StorageError;
use crate::relay::{RelayOptions, DEFAULT_BUFFER_SIZE};

/// Default time allowed for a single forward setup call
pub const DEFAULT_SETUP_TIMEOUT_MS: u64 = 10_000;

/// Tunables for the forwarding core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForwardingConfig {
    /// Address local and dynamic listeners bind to
    pub bind_address: String,
    /// Upper bound on a transport setup call (bind / tcpip-forward)
    pub setup_timeout_ms: u64,
    /// Copy buffer per relay direction
    pub relay_buffer_size: usize,
    /// Close relays idle on both sides for this long. None disables.
    pub idle_timeout_secs: Option<u64>,
    /// Override for the rules document location
    pub rules_file: Option<PathBuf>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            setup_timeout_ms: DEFAULT_SETUP_TIMEOUT_MS,
            relay_buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout_secs: None,
            rules_file: None,
        }
    }
}

impl ForwardingConfig {
    /// Load settings from a JSON file, falling back to defaults if it doesn't exist
    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            buffer_size: self.relay_buffer_size.max(1),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolved rules document path
    pub fn rules_path(&self) -> Result<PathBuf, StorageError> {
        match &self.rules_file {
            Some(path) => Ok(path.clone()),
            None => super::storage::rules_file(),
        }
    }
}
