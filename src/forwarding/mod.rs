//! Port Forwarding Module
//!
//! - [`ForwardSessionManager`]: registry of the forwards on one transport session
//! - [`RuleSessionAdapter`]: turns stored rules into running forwards
//! - [`ForwardListener`]: lifecycle events

mod adapter;
mod events;
mod manager;
mod types;

pub use adapter::{ReconcileReport, RuleSessionAdapter};
pub use events::{ChannelListener, ForwardEvent, ForwardListener, ForwardNotification};
pub use manager::{ForwardSessionManager, CONNECTION_LOST};
pub use types::{ForwardEntry, ForwardSpec, ForwardStatus, ForwardType};
