//! Handle Owner Task
//!
//! Only one task owns the russh `Handle`. Everything else talks to it through
//! a cloneable [`HandleController`], which sends commands over an mpsc
//! channel and awaits the reply on a oneshot.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "prod-db".into());
//! let bound_port = controller.tcpip_forward("localhost", 9000).await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::transport::{BoxedStream, TransportError, TunnelChannels};

/// How often the owner task checks whether the connection went away on its own
const CLOSED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (local forward / dynamic forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// Cloning is cheap (a sender pair). Any holder has full control over the
/// connection, so it must stay inside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the connection is closed
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a raw command channel whose disconnect signal never fires
    #[cfg(test)]
    pub(crate) fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TransportError::Disconnected)?
            .map_err(|e| TransportError::ChannelError(e.to_string()))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TransportError::Disconnected)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TransportError::Disconnected)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl TunnelChannels for HandleController {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TransportError> {
        let channel = HandleController::open_direct_tcpip(
            self,
            host,
            port as u32,
            &originator.ip().to_string(),
            originator.port() as u32,
        )
        .await?;
        Ok(Box::pin(channel.into_stream()))
    }

    async fn request_remote_listen(&self, address: &str, port: u16) -> Result<u16, TransportError> {
        let bound = self.tcpip_forward(address, port as u32).await?;
        // Servers reply with a port only when 0 was requested
        if bound == 0 {
            return Ok(port);
        }
        u16::try_from(bound).map_err(|_| {
            TransportError::ProtocolError(format!("Server bound invalid port {}", bound))
        })
    }

    async fn cancel_remote_listen(&self, address: &str, port: u16) -> Result<(), TransportError> {
        self.cancel_tcpip_forward(address, port as u32).await
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        HandleController::subscribe_disconnect(self)
    }

    fn is_connected(&self) -> bool {
        HandleController::is_connected(self)
    }
}

/// Spawn the Handle Owner Task, consuming the handle.
///
/// `label` only appears in logs.
pub fn spawn_handle_owner_task<H>(handle: Handle<H>, label: String) -> HandleController
where
    H: client::Handler + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let task_disconnect_tx = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut closed_poll = tokio::time::interval(CLOSED_POLL_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = closed_poll.tick() => {
                    if handle.is_closed() {
                        info!("SSH connection closed for {}", label);
                        break;
                    }
                    continue;
                }
            };

            let Some(cmd) = cmd else {
                info!("All controllers dropped for {}", label);
                break;
            };

            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // The channel is dropped here and the server closes it
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(address.clone(), port).await;
                    match result {
                        Ok(bound_port) => {
                            if reply_tx.send(Ok(bound_port)).is_err() {
                                // Nobody owns the forward now, cancel it before it lingers
                                let bound_port = if bound_port == 0 { port } else { bound_port };
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(address, bound_port).await;
                            }
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(e));
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(address, port).await;
                    if reply_tx.send(result).is_err() {
                        debug!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        // Close the queue before signalling so that anyone subscribing after
        // the signal already sees is_connected() == false
        cmd_rx.close();
        let _ = task_disconnect_tx.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Close the queue and answer every pending command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
