//! Durable forwarding rules
//!
//! Rules describe local forwards the user wants; the adapter in
//! [`crate::forwarding`] turns enabled rules into running forwards.

mod store;
mod types;

pub use store::{RuleStore, RulesListener};
pub use types::{ForwardingRule, RuleDocument, RULES_VERSION};
