//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Local SOCKS5 proxy whose CONNECT requests are tunneled through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination
//!
//! Only the NO AUTH method and the CONNECT command are supported.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{spawn_listener, ListenerHandle, TransportError, TunnelChannels};
use crate::relay::{relay, RelayOptions, RelayResult, TrackedStream};

/// SOCKS5 protocol constants
#[allow(dead_code)]
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

pub(crate) fn start_dynamic_forward<C: TunnelChannels>(
    listener: TcpListener,
    channels: C,
    options: RelayOptions,
) -> Result<ListenerHandle, TransportError> {
    let disconnect_rx = channels.subscribe_disconnect();

    spawn_listener("SOCKS5 proxy", listener, disconnect_rx, move |stream, peer, cancel| {
        handle_socks5_connection(channels.clone(), stream, peer, options.clone(), cancel)
    })
}

/// Handle a single SOCKS5 connection
async fn handle_socks5_connection<C: TunnelChannels>(
    channels: C,
    mut stream: TcpStream,
    peer: SocketAddr,
    options: RelayOptions,
    cancel: CancellationToken,
) -> Result<Option<RelayResult>, TransportError> {
    let (dest_host, dest_port) = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        target = negotiate(&mut stream) => target?,
    };

    debug!("SOCKS5: Connecting to {}:{}", dest_host, dest_port);

    let channel = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        channel = channels.open_direct_tcpip(&dest_host, dest_port, peer) => channel,
    };

    let channel = match channel {
        Ok(ch) => ch,
        Err(e) => {
            warn!(
                "Failed to open SSH channel to {}:{}: {}",
                dest_host, dest_port, e
            );
            send_socks5_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;

    debug!("SOCKS5: Tunnel established to {}:{}", dest_host, dest_port);

    let result = relay(
        TrackedStream::new(stream),
        TrackedStream::new(channel),
        &options,
        &cancel,
    )
    .await;
    Ok(Some(result))
}

/// Run the greeting and request phases; returns the CONNECT destination
async fn negotiate<S>(stream: &mut S) -> Result<(String, u16), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: Authentication negotiation
    let mut buf = [0u8; 258];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| TransportError::Socks(format!("Failed to read greeting: {}", e)))?;

    let version = buf[0];
    let nmethods = buf[1] as usize;

    if version != socks5::VERSION {
        return Err(TransportError::Socks(format!(
            "Unsupported SOCKS version: {}",
            version
        )));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| TransportError::Socks(format!("Failed to read auth methods: {}", e)))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await
            .ok();
        return Err(TransportError::Socks(
            "Client doesn't support NO AUTH method".into(),
        ));
    }

    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| TransportError::Socks(format!("Failed to send auth response: {}", e)))?;

    // Phase 2: Connection request
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| TransportError::Socks(format!("Failed to read request: {}", e)))?;

    let version = buf[0];
    let cmd = buf[1];
    // buf[2] is reserved
    let atyp = buf[3];

    if version != socks5::VERSION {
        return Err(TransportError::Socks("Invalid SOCKS5 version in request".into()));
    }

    if cmd != socks5::CMD_CONNECT {
        send_socks5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(TransportError::Socks(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    let target = match atyp {
        socks5::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await.map_err(|e| {
                TransportError::Socks(format!("Failed to read IPv4 address: {}", e))
            })?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip.to_string(), port)
        }
        socks5::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await.map_err(|e| {
                TransportError::Socks(format!("Failed to read domain length: {}", e))
            })?;
            let domain_len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..domain_len + 2])
                .await
                .map_err(|e| TransportError::Socks(format!("Failed to read domain: {}", e)))?;
            let domain = String::from_utf8_lossy(&buf[..domain_len]).to_string();
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            (domain, port)
        }
        socks5::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await.map_err(|e| {
                TransportError::Socks(format!("Failed to read IPv6 address: {}", e))
            })?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (Ipv6Addr::from(octets).to_string(), port)
        }
        _ => {
            send_socks5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(TransportError::Socks(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    Ok(target)
}

/// Send a SOCKS5 reply
async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    // Bound address is always reported as 0.0.0.0:0
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    stream
        .write_all(&reply)
        .await
        .map_err(|e| TransportError::Socks(format!("Failed to send reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{free_port, spawn_echo_server, DirectChannels};
    use super::super::{ChannelTransport, TransportSession};
    use super::*;
    use crate::config::ForwardingConfig;

    #[tokio::test]
    async fn test_negotiate_domain() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut auth = [0u8; 2];
            client.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth, [0x05, 0x00]);

            let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
            request.extend_from_slice(b"example.com");
            request.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&request).await.unwrap();
        });

        let target = negotiate(&mut server).await.unwrap();
        assert_eq!(target, ("example.com".to_string(), 443));
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_ipv6() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut auth = [0u8; 2];
            client.read_exact(&mut auth).await.unwrap();

            let mut request = vec![0x05, 0x01, 0x00, 0x04];
            request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
            request.extend_from_slice(&8080u16.to_be_bytes());
            client.write_all(&request).await.unwrap();
        });

        let target = negotiate(&mut server).await.unwrap();
        assert_eq!(target, ("::1".to_string(), 8080));
    }

    #[tokio::test]
    async fn test_rejects_auth_required() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            // Username/password only
            client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0xFF]);
        });

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::Socks(_)));
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut auth = [0u8; 2];
            client.read_exact(&mut auth).await.unwrap();

            client
                .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();
            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            reply[1]
        });

        assert!(negotiate(&mut server).await.is_err());
        assert_eq!(client_task.await.unwrap(), socks5::REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_socks5_proxy_end_to_end() {
        let echo_port = spawn_echo_server().await;
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());
        let proxy_port = free_port().await;
        transport.add_dynamic_port_forwarding(proxy_port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo_port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks5::REP_SUCCESS);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unreachable_target_replies_failure() {
        let closed_port = free_port().await;
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());
        let proxy_port = free_port().await;
        transport.add_dynamic_port_forwarding(proxy_port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&closed_port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks5::REP_HOST_UNREACHABLE);
    }
}
