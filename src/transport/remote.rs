//! Remote Port Forwarding
//!
//! The server listens on a remote port and opens a forwarded-tcpip channel
//! per inbound connection; each channel is relayed to a local target.
//! Example: Remote server:9000 -> SSH tunnel -> localhost:3000

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ForwardStats, StatsCounter, TransportError};
use crate::relay::{relay, RelayOptions, TrackedStream};

/// Where forwarded-tcpip channels for one remote listener are relayed to
#[derive(Debug, Clone)]
pub struct RemoteForwardTarget {
    pub local_host: String,
    pub local_port: u16,
    pub options: RelayOptions,
    pub stats: Arc<StatsCounter>,
    /// Cancelled when the forward is unregistered
    pub cancel: CancellationToken,
}

/// Maps (remote_address, remote_port) to a local target.
///
/// The SSH client handler consults it when the server opens a
/// forwarded-tcpip channel.
#[derive(Default)]
pub struct RemoteForwardRegistry {
    forwards: RwLock<HashMap<(String, u16), RemoteForwardTarget>>,
}

impl RemoteForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote forward, replacing any previous target for the key
    pub fn register(
        &self,
        remote_addr: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
        options: RelayOptions,
    ) {
        let target = RemoteForwardTarget {
            local_host: local_host.to_string(),
            local_port,
            options,
            stats: Arc::new(StatsCounter::new()),
            cancel: CancellationToken::new(),
        };
        let previous = self
            .forwards
            .write()
            .insert((remote_addr.to_string(), remote_port), target);
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        debug!(
            "Registered remote forward: {}:{} -> {}:{}",
            remote_addr, remote_port, local_host, local_port
        );
    }

    /// Unregister a remote forward, closing its in-flight connections
    pub fn unregister(&self, remote_addr: &str, remote_port: u16) -> bool {
        let removed = self
            .forwards
            .write()
            .remove(&(remote_addr.to_string(), remote_port));
        match removed {
            Some(target) => {
                target.cancel.cancel();
                debug!("Unregistered remote forward: {}:{}", remote_addr, remote_port);
                true
            }
            None => false,
        }
    }

    /// Look up a target.
    ///
    /// Servers may report the connected address differently from the one
    /// requested ("localhost" vs "127.0.0.1"), so an exact miss falls back to
    /// the only forward on that port.
    pub fn lookup(&self, remote_addr: &str, remote_port: u16) -> Option<RemoteForwardTarget> {
        let forwards = self.forwards.read();
        if let Some(target) = forwards.get(&(remote_addr.to_string(), remote_port)) {
            return Some(target.clone());
        }

        let mut by_port = forwards
            .iter()
            .filter(|((_, port), _)| *port == remote_port)
            .map(|(_, target)| target);
        match (by_port.next(), by_port.next()) {
            (Some(target), None) => Some(target.clone()),
            _ => None,
        }
    }

    pub fn stats(&self, remote_addr: &str, remote_port: u16) -> Option<ForwardStats> {
        self.lookup(remote_addr, remote_port)
            .map(|target| target.stats.snapshot())
    }

    pub fn len(&self) -> usize {
        self.forwards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.read().is_empty()
    }

    /// Relay one server-opened channel to its registered local target
    pub async fn handle_inbound<S>(
        &self,
        channel: S,
        connected_address: &str,
        connected_port: u16,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let target = self
            .lookup(connected_address, connected_port)
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!(
                    "No registered forward for {}:{}",
                    connected_address, connected_port
                ))
            })?;

        target.stats.connection_opened();
        let result = relay_to_target(channel, &target).await;
        target.stats.connection_closed();
        result
    }
}

async fn relay_to_target<S>(channel: S, target: &RemoteForwardTarget) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let local_addr = format!("{}:{}", target.local_host, target.local_port);
    let local_stream = tokio::select! {
        _ = target.cancel.cancelled() => return Ok(()),
        stream = TcpStream::connect(&local_addr) => stream.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {}: {}", local_addr, e))
        })?,
    };

    if let Err(e) = local_stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    info!("Bridging forwarded connection -> {}", local_addr);

    let result = relay(
        TrackedStream::new(local_stream),
        TrackedStream::new(channel),
        &target.options,
        &target.cancel,
    )
    .await;
    target.stats.record(&result);

    debug!(
        "Forwarded connection to {} closed ({:?})",
        local_addr, result.end
    );
    Ok(())
}
