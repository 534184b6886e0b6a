//! Transport Session
//!
//! The seam between the forward manager and the SSH connection.
//!
//! [`TransportSession`] is what the manager drives: add/remove one listener
//! per forward. [`ChannelTransport`] implements it on top of any
//! [`TunnelChannels`] (the "give me a duplex stream through the tunnel"
//! capability), binding local listeners, running SOCKS5 for dynamic
//! forwards and dispatching server-initiated channels for remote forwards.

mod dynamic;
mod error;
mod local;
pub mod remote;
mod stats;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwardingConfig;
use crate::forwarding::ForwardType;
use crate::relay::RelayResult;

pub(crate) use error::bind_error;
pub use error::TransportError;
pub use remote::RemoteForwardRegistry;
pub use stats::{ForwardStats, StatsCounter};

/// Address requested for remote (server side) listeners
pub const REMOTE_BIND_ADDRESS: &str = "localhost";

/// Any duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> AsyncStream for T {}

/// A stream through the tunnel
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Forward setup/teardown against one established transport session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Listen on `local_port`, relaying each connection to `remote_host:remote_port`
    async fn add_local_port_forwarding(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError>;

    async fn remove_local_port_forwarding(&self, local_port: u16) -> Result<(), TransportError>;

    /// Ask the remote end to listen on `remote_port`, relaying back to `local_host:local_port`
    async fn add_remote_port_forwarding(
        &self,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<(), TransportError>;

    async fn remove_remote_port_forwarding(&self, remote_port: u16) -> Result<(), TransportError>;

    /// Local SOCKS5 listener on `local_port`
    async fn add_dynamic_port_forwarding(&self, local_port: u16) -> Result<(), TransportError>;

    async fn remove_dynamic_port_forwarding(&self, local_port: u16)
        -> Result<(), TransportError>;

    /// Fires once when the underlying connection goes away
    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        None
    }

    /// False once the underlying connection is gone
    fn is_connected(&self) -> bool {
        true
    }
}

/// Channel-level capabilities of an authenticated SSH connection
#[async_trait]
pub trait TunnelChannels: Clone + Send + Sync + 'static {
    /// Open a direct-tcpip channel to `host:port`
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TransportError>;

    /// Send a tcpip-forward request; returns the port actually bound
    async fn request_remote_listen(&self, address: &str, port: u16) -> Result<u16, TransportError>;

    async fn cancel_remote_listen(&self, address: &str, port: u16) -> Result<(), TransportError>;

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    /// False once the connection is closed. Stays false after it flips.
    fn is_connected(&self) -> bool;
}

/// A running local accept loop
pub(crate) struct ListenerHandle {
    pub bound_addr: SocketAddr,
    cancel: CancellationToken,
    stats: Arc<StatsCounter>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stop accepting and force-close in-flight connections
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop and wait until the accept loop has released the socket
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop on {} ended abnormally: {}", self.bound_addr, e);
            }
        }
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.snapshot()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) async fn bind_listener(addr: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr).await.map_err(|e| bind_error(addr, e))
}

/// Spawn the accept loop for a bound listener.
///
/// Every accepted connection runs `handler` in its own task with a child
/// token of the listener, so stopping the listener also closes its relays.
/// The handler yields the relay result once a tunnel was established.
pub(crate) fn spawn_listener<F, Fut>(
    label: &'static str,
    listener: TcpListener,
    mut disconnect_rx: broadcast::Receiver<()>,
    handler: F,
) -> Result<ListenerHandle, TransportError>
where
    F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<RelayResult>, TransportError>> + Send + 'static,
{
    let bound_addr = listener
        .local_addr()
        .map_err(|e| TransportError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

    let cancel = CancellationToken::new();
    let stats = Arc::new(StatsCounter::new());
    let loop_cancel = cancel.clone();
    let loop_stats = stats.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    info!("{} on {} stopped by request", label, bound_addr);
                    break;
                }

                _ = disconnect_rx.recv() => {
                    info!("{} on {} stopped: SSH disconnected", label, bound_addr);
                    loop_cancel.cancel();
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            // Disable Nagle's algorithm for low-latency forwarding
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("{}: accepted connection from {}", label, peer_addr);
                            loop_stats.connection_opened();

                            let conn = handler(stream, peer_addr, loop_cancel.child_token());
                            let conn_stats = loop_stats.clone();
                            tokio::spawn(async move {
                                match conn.await {
                                    Ok(Some(result)) => {
                                        conn_stats.record(&result);
                                        if let Some(e) = result.error {
                                            debug!("{} relay for {} ended with error: {}", label, peer_addr, e);
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!("{} connection error from {}: {}", label, peer_addr, e);
                                    }
                                }
                                conn_stats.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("{} accept error: {}", label, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        info!("{} task exited", label);
    });

    Ok(ListenerHandle {
        bound_addr,
        cancel,
        stats,
        task: Some(task),
    })
}

struct RemoteBinding {
    address: String,
    bound_port: u16,
}

/// [`TransportSession`] over an SSH connection's channels
pub struct ChannelTransport<C: TunnelChannels> {
    channels: C,
    config: ForwardingConfig,
    registry: Arc<RemoteForwardRegistry>,
    local: Mutex<HashMap<u16, ListenerHandle>>,
    dynamic: Mutex<HashMap<u16, ListenerHandle>>,
    remote: Mutex<HashMap<u16, RemoteBinding>>,
}

impl<C: TunnelChannels> ChannelTransport<C> {
    pub fn new(channels: C, config: ForwardingConfig) -> Self {
        Self::with_registry(channels, config, Arc::new(RemoteForwardRegistry::new()))
    }

    /// Share a registry with the handler that receives forwarded-tcpip channels
    pub fn with_registry(
        channels: C,
        config: ForwardingConfig,
        registry: Arc<RemoteForwardRegistry>,
    ) -> Self {
        Self {
            channels,
            config,
            registry,
            local: Mutex::new(HashMap::new()),
            dynamic: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<RemoteForwardRegistry> {
        self.registry.clone()
    }

    pub fn channels(&self) -> &C {
        &self.channels
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.channels.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.config.bind_address, port)
    }

    /// Address a local or dynamic listener actually bound
    pub fn bound_addr(&self, forward_type: ForwardType, port: u16) -> Option<SocketAddr> {
        match forward_type {
            ForwardType::Local => self.local.lock().get(&port).map(|h| h.bound_addr),
            ForwardType::Dynamic => self.dynamic.lock().get(&port).map(|h| h.bound_addr),
            ForwardType::Remote => None,
        }
    }

    /// Connection statistics for the listener bound on `port`
    pub fn stats(&self, forward_type: ForwardType, port: u16) -> Option<ForwardStats> {
        match forward_type {
            ForwardType::Local => self.local.lock().get(&port).map(|h| h.stats()),
            ForwardType::Dynamic => self.dynamic.lock().get(&port).map(|h| h.stats()),
            ForwardType::Remote => {
                let remote = self.remote.lock();
                let binding = remote.get(&port)?;
                self.registry.stats(&binding.address, binding.bound_port)
            }
        }
    }

    /// Whether the listener for `port` is still accepting
    pub fn is_running(&self, forward_type: ForwardType, port: u16) -> bool {
        match forward_type {
            ForwardType::Local => self.local.lock().get(&port).is_some_and(|h| h.is_running()),
            ForwardType::Dynamic => self
                .dynamic
                .lock()
                .get(&port)
                .is_some_and(|h| h.is_running()),
            ForwardType::Remote => self.remote.lock().contains_key(&port),
        }
    }
}

#[async_trait]
impl<C: TunnelChannels> TransportSession for ChannelTransport<C> {
    async fn add_local_port_forwarding(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.local.lock().contains_key(&local_port) {
            return Err(TransportError::ConnectionFailed(format!(
                "Local port {} is already forwarded",
                local_port
            )));
        }

        let addr = self.bind_addr(local_port);
        let listener = bind_listener(&addr).await?;
        let handle = local::start_local_forward(
            listener,
            self.channels.clone(),
            remote_host.to_string(),
            remote_port,
            self.config.relay_options(),
        )?;

        info!(
            "Started local port forward: {} -> {}:{}",
            handle.bound_addr, remote_host, remote_port
        );
        self.local.lock().insert(local_port, handle);
        Ok(())
    }

    async fn remove_local_port_forwarding(&self, local_port: u16) -> Result<(), TransportError> {
        let handle = self
            .local
            .lock()
            .remove(&local_port)
            .ok_or(TransportError::NotBound(local_port))?;
        info!("Stopping local port forward on {}", handle.bound_addr);
        handle.shutdown().await;
        Ok(())
    }

    async fn add_remote_port_forwarding(
        &self,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.remote.lock().contains_key(&remote_port) {
            return Err(TransportError::ConnectionFailed(format!(
                "Remote port {} is already forwarded",
                remote_port
            )));
        }

        info!(
            "Requesting remote port forward: {}:{} -> {}:{}",
            REMOTE_BIND_ADDRESS, remote_port, local_host, local_port
        );

        let bound_port = self
            .channels
            .request_remote_listen(REMOTE_BIND_ADDRESS, remote_port)
            .await?;

        self.registry.register(
            REMOTE_BIND_ADDRESS,
            bound_port,
            local_host,
            local_port,
            self.config.relay_options(),
        );

        info!(
            "Remote forward established: {}:{} (requested {}) -> {}:{}",
            REMOTE_BIND_ADDRESS, bound_port, remote_port, local_host, local_port
        );

        self.remote.lock().insert(
            remote_port,
            RemoteBinding {
                address: REMOTE_BIND_ADDRESS.to_string(),
                bound_port,
            },
        );
        Ok(())
    }

    async fn remove_remote_port_forwarding(&self, remote_port: u16) -> Result<(), TransportError> {
        let binding = self
            .remote
            .lock()
            .remove(&remote_port)
            .ok_or(TransportError::NotBound(remote_port))?;

        info!(
            "Stopping remote port forward {}:{}",
            binding.address, binding.bound_port
        );

        // Local state is dropped even if the server refuses the cancel
        self.registry.unregister(&binding.address, binding.bound_port);
        self.channels
            .cancel_remote_listen(&binding.address, binding.bound_port)
            .await
    }

    async fn add_dynamic_port_forwarding(&self, local_port: u16) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.dynamic.lock().contains_key(&local_port) {
            return Err(TransportError::ConnectionFailed(format!(
                "SOCKS5 proxy already running on port {}",
                local_port
            )));
        }

        let addr = self.bind_addr(local_port);
        let listener = bind_listener(&addr).await?;
        let handle = dynamic::start_dynamic_forward(
            listener,
            self.channels.clone(),
            self.config.relay_options(),
        )?;

        info!("Started SOCKS5 proxy on {}", handle.bound_addr);
        self.dynamic.lock().insert(local_port, handle);
        Ok(())
    }

    async fn remove_dynamic_port_forwarding(
        &self,
        local_port: u16,
    ) -> Result<(), TransportError> {
        let handle = self
            .dynamic
            .lock()
            .remove(&local_port)
            .ok_or(TransportError::NotBound(local_port))?;
        info!("Stopping SOCKS5 proxy on {}", handle.bound_addr);
        handle.shutdown().await;
        Ok(())
    }

    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.channels.subscribe_disconnect())
    }

    fn is_connected(&self) -> bool {
        self.channels.is_connected()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_local_forward_end_to_end() {
        let echo_port = spawn_echo_server().await;
        let channels = DirectChannels::new();
        let transport = ChannelTransport::new(channels.clone(), ForwardingConfig::default());

        let local_port = free_port().await;
        transport
            .add_local_port_forwarding(local_port, "127.0.0.1", echo_port)
            .await
            .unwrap();
        assert!(transport.is_running(ForwardType::Local, local_port));

        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(channels.opened.load(Ordering::SeqCst), 1);

        let stats = transport.stats(ForwardType::Local, local_port).unwrap();
        assert_eq!(stats.connection_count, 1);

        transport.remove_local_port_forwarding(local_port).await.unwrap();

        // In-flight relay is force-closed
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .expect("relay should be closed on stop")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_duplicate_local_port_rejected() {
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());
        let port = free_port().await;
        transport
            .add_local_port_forwarding(port, "127.0.0.1", 80)
            .await
            .unwrap();
        let err = transport
            .add_local_port_forwarding(port, "127.0.0.1", 81)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already forwarded"));
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_port_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());

        let err = transport
            .add_dynamic_port_forwarding(port)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Port already in use"));
    }

    #[tokio::test]
    async fn test_remove_unbound_port() {
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());
        let err = transport.remove_local_port_forwarding(4242).await.unwrap_err();
        assert!(matches!(err, TransportError::NotBound(4242)));
    }

    #[tokio::test]
    async fn test_disconnect_stops_listener() {
        let channels = DirectChannels::new();
        let transport = ChannelTransport::new(channels.clone(), ForwardingConfig::default());
        let port = free_port().await;
        transport.add_dynamic_port_forwarding(port).await.unwrap();

        channels.disconnect_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.is_running(ForwardType::Dynamic, port) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener should stop after disconnect");
    }

    #[tokio::test]
    async fn test_local_port_rebound_after_remove() {
        let transport = ChannelTransport::new(DirectChannels::new(), ForwardingConfig::default());
        let port = free_port().await;
        transport
            .add_local_port_forwarding(port, "10.0.0.5", 3306)
            .await
            .unwrap();
        transport.remove_local_port_forwarding(port).await.unwrap();

        // Same port, new target, straight away
        transport
            .add_local_port_forwarding(port, "10.0.0.5", 5432)
            .await
            .unwrap();
        assert!(transport.is_running(ForwardType::Local, port));
    }

    #[tokio::test]
    async fn test_setup_refused_once_disconnected() {
        let channels = DirectChannels::new();
        let transport = ChannelTransport::new(channels.clone(), ForwardingConfig::default());
        channels.disconnect();
        assert!(!TransportSession::is_connected(&transport));

        let port = free_port().await;
        let err = transport
            .add_local_port_forwarding(port, "127.0.0.1", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
        assert!(matches!(
            transport.add_dynamic_port_forwarding(port).await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            transport.add_remote_port_forwarding(9002, "localhost", 3002).await,
            Err(TransportError::Disconnected)
        ));

        assert!(!transport.is_running(ForwardType::Local, port));
        assert!(!transport.is_running(ForwardType::Dynamic, port));
        assert!(channels.remote_requests.lock().is_empty());
        // Nothing was bound, so the port is still free
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_forward_registration() {
        let channels = DirectChannels::new();
        let transport = ChannelTransport::new(channels.clone(), ForwardingConfig::default());

        transport
            .add_remote_port_forwarding(9000, "localhost", 3000)
            .await
            .unwrap();
        assert_eq!(
            channels.remote_requests.lock().as_slice(),
            &[(REMOTE_BIND_ADDRESS.to_string(), 9000)]
        );
        assert!(transport.registry().lookup(REMOTE_BIND_ADDRESS, 9000).is_some());

        transport.remove_remote_port_forwarding(9000).await.unwrap();
        assert!(transport.registry().lookup(REMOTE_BIND_ADDRESS, 9000).is_none());
    }

    #[tokio::test]
    async fn test_remote_cancel_failure_still_unregisters() {
        let mut channels = DirectChannels::new();
        channels.fail_cancel = true;
        let transport = ChannelTransport::new(channels, ForwardingConfig::default());

        transport
            .add_remote_port_forwarding(9001, "localhost", 3001)
            .await
            .unwrap();
        assert!(transport.remove_remote_port_forwarding(9001).await.is_err());
        assert!(transport.registry().lookup(REMOTE_BIND_ADDRESS, 9001).is_none());
        assert!(!transport.is_running(ForwardType::Remote, 9001));
    }
}
