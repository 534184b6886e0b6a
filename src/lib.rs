//! OxideTerm port forwarding core
//!
//! Turns user-declared forwarding rules into live SSH tunnels and keeps track
//! of them:
//!
//! - [`rules`]: durable forwarding rules persisted as JSON in the config dir
//! - [`forwarding`]: the active-tunnel registry and the rule-to-session adapter
//! - [`transport`]: the transport-session seam plus the listener/SOCKS5 wiring
//! - [`ssh`]: the russh-backed tunnel channels
//! - [`relay`]: the bidirectional byte pump with idle tracking

pub mod config;
pub mod error;
pub mod forwarding;
mod listeners;
pub mod logging;
pub mod relay;
pub mod rules;
pub mod ssh;
pub mod transport;

pub use config::ForwardingConfig;
pub use error::ForwardError;
pub use forwarding::{
    ChannelListener, ForwardEntry, ForwardEvent, ForwardListener, ForwardNotification,
    ForwardSessionManager, ForwardSpec, ForwardStatus, ForwardType, ReconcileReport,
    RuleSessionAdapter,
};
pub use listeners::ListenerId;
pub use relay::{
    find_available_port, is_port_available, relay, RelayOptions, RelayResult, TrackedStream,
};
pub use rules::{ForwardingRule, RuleStore, RulesListener};
pub use ssh::SshTransport;
pub use transport::{
    ChannelTransport, ForwardStats, RemoteForwardRegistry, TransportError, TransportSession,
    TunnelChannels,
};
