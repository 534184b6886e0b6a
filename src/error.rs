//! Forwarding core error types

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Malformed rule or forward parameters, rejected before any mutation
    #[error("Invalid forward parameters: {0}")]
    Validation(String),

    /// Duplicate forward identity or duplicate local port among enabled rules
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported forward type: {0}")]
    UnsupportedForwardType(String),

    /// The transport session failed to set up or tear down a channel
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl ForwardError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ForwardError::AlreadyExists(_))
    }
}

// Serialized as the plain message so frontends can show it directly
impl serde::Serialize for ForwardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Validate a port number (1-65535)
pub(crate) fn validate_port(field: &str, port: u16) -> Result<(), ForwardError> {
    if port == 0 {
        return Err(ForwardError::Validation(format!(
            "{} must be between 1 and 65535",
            field
        )));
    }
    Ok(())
}

/// Validate a host name or literal address
pub(crate) fn validate_host(field: &str, host: &str) -> Result<(), ForwardError> {
    if host.trim().is_empty() {
        return Err(ForwardError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}
