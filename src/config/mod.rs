//! Configuration Management Module
//!
//! Persistent storage location for forwarding rules and the forwarding settings.

pub mod settings;
pub mod storage;

pub use settings::ForwardingConfig;
pub use storage::{config_dir, rules_file, settings_file, RuleStorage, StorageError};
