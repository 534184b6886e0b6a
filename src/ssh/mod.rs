//! russh-backed tunnel channels
//!
//! The embedding application connects and authenticates a russh client with
//! a [`ForwardingClientHandler`], then hands the `Handle` over here:
//!
//! ```ignore
//! let registry = Arc::new(RemoteForwardRegistry::new());
//! let handler = ForwardingClientHandler::with_pinned_key(registry.clone(), server_key);
//! let mut handle = russh::client::connect(config, addr, handler).await?;
//! handle.authenticate_password(user, password).await?;
//!
//! let transport = Arc::new(ssh_transport(handle, "prod-db", registry, ForwardingConfig::default()));
//! let manager = ForwardSessionManager::new(transport, ForwardingConfig::default());
//! ```

mod handle_owner;
mod handler;

use std::sync::Arc;

use russh::client::Handle;

pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use handler::{ForwardingClientHandler, HostKeyCheck};

use crate::config::ForwardingConfig;
use crate::transport::{ChannelTransport, RemoteForwardRegistry};

/// Transport session over an authenticated russh connection
pub type SshTransport = ChannelTransport<HandleController>;

/// Take ownership of `handle` and build a transport on it.
///
/// `registry` must be the one given to the handler so forwarded-tcpip
/// channels find their targets.
pub fn ssh_transport(
    handle: Handle<ForwardingClientHandler>,
    label: impl Into<String>,
    registry: Arc<RemoteForwardRegistry>,
    config: ForwardingConfig,
) -> SshTransport {
    let controller = spawn_handle_owner_task(handle, label.into());
    ChannelTransport::with_registry(controller, config, registry)
}
