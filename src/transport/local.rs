//! Local Port Forwarding
//!
//! Local listener whose connections are relayed through a direct-tcpip channel.
//! Example: 127.0.0.1:13306 -> SSH tunnel -> 10.0.0.5:3306

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{spawn_listener, ListenerHandle, TransportError, TunnelChannels};
use crate::relay::{relay, RelayOptions, RelayResult, TrackedStream};

pub(crate) fn start_local_forward<C: TunnelChannels>(
    listener: TcpListener,
    channels: C,
    remote_host: String,
    remote_port: u16,
    options: RelayOptions,
) -> Result<ListenerHandle, TransportError> {
    let disconnect_rx = channels.subscribe_disconnect();

    spawn_listener("Local forward", listener, disconnect_rx, move |stream, peer, cancel| {
        handle_local_connection(
            channels.clone(),
            stream,
            peer,
            remote_host.clone(),
            remote_port,
            options.clone(),
            cancel,
        )
    })
}

async fn handle_local_connection<C: TunnelChannels>(
    channels: C,
    stream: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
    options: RelayOptions,
    cancel: CancellationToken,
) -> Result<Option<RelayResult>, TransportError> {
    let channel = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        channel = channels.open_direct_tcpip(&remote_host, remote_port, peer) => channel?,
    };

    debug!("Tunnel open: {} -> {}:{}", peer, remote_host, remote_port);

    let result = relay(
        TrackedStream::new(stream),
        TrackedStream::new(channel),
        &options,
        &cancel,
    )
    .await;

    debug!(
        "Tunnel closed ({:?}): {} -> {}:{}, {} bytes out, {} bytes in",
        result.end, peer, remote_host, remote_port, result.a_to_b, result.b_to_a
    );
    Ok(Some(result))
}
