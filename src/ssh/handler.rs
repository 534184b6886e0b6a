//! russh client handler for forwarding sessions

use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{info, warn};

use crate::transport::{RemoteForwardRegistry, TransportError};

/// Host key policy: return true to accept the server key
pub type HostKeyCheck = Arc<dyn Fn(&PublicKey) -> bool + Send + Sync>;

/// Processes server-initiated events:
/// - host key verification through the configured policy
/// - forwarded-tcpip channels for remote port forwards
pub struct ForwardingClientHandler {
    registry: Arc<RemoteForwardRegistry>,
    host_key_check: HostKeyCheck,
}

impl ForwardingClientHandler {
    pub fn new(registry: Arc<RemoteForwardRegistry>, host_key_check: HostKeyCheck) -> Self {
        Self {
            registry,
            host_key_check,
        }
    }

    /// Accept only `expected`
    pub fn with_pinned_key(registry: Arc<RemoteForwardRegistry>, expected: PublicKey) -> Self {
        Self::new(registry, Arc::new(move |key: &PublicKey| *key == expected))
    }

    pub fn registry(&self) -> Arc<RemoteForwardRegistry> {
        self.registry.clone()
    }
}

impl client::Handler for ForwardingClientHandler {
    type Error = TransportError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if (self.host_key_check)(server_public_key) {
            info!("Host key accepted");
            Ok(true)
        } else {
            warn!("Host key rejected by policy");
            Ok(false)
        }
    }

    /// Someone connected to a remote-forwarded port on the server
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Ok(connected_port) = u16::try_from(connected_port) else {
            warn!("Ignoring forwarded channel for invalid port {}", connected_port);
            return Ok(());
        };

        let registry = self.registry.clone();
        let connected_address = connected_address.to_string();

        // Must not block the SSH event loop
        tokio::spawn(async move {
            if let Err(e) = registry
                .handle_inbound(channel.into_stream(), &connected_address, connected_port)
                .await
            {
                warn!(
                    "Failed to handle forwarded connection {}:{}: {}",
                    connected_address, connected_port, e
                );
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::Handler;

    const TRUSTED: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
    const OTHER: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

    #[tokio::test]
    async fn test_pinned_key_policy() {
        let trusted = russh::keys::parse_public_key_base64(TRUSTED).unwrap();
        let other = russh::keys::parse_public_key_base64(OTHER).unwrap();
        let mut handler = ForwardingClientHandler::with_pinned_key(
            Arc::new(RemoteForwardRegistry::new()),
            trusted.clone(),
        );

        assert!(handler.check_server_key(&trusted).await.unwrap());
        assert!(!handler.check_server_key(&other).await.unwrap());
    }
}
