//! Transport error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("SOCKS5 error: {0}")]
    Socks(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Teardown requested for a port with no active listener
    #[error("No forward bound on port {0}")]
    NotBound(u16),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

/// Map a listener bind failure to a user-facing message
pub(crate) fn bind_error(addr: &str, e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => TransportError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => TransportError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => TransportError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => TransportError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
    }
}
