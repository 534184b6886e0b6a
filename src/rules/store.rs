//! Rule Store
//!
//! In-memory rule set backed by the JSON rules document. Every mutation
//! rewrites the whole document and then notifies listeners. Disk failures are
//! logged and the in-memory set stays authoritative.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::types::{ForwardingRule, RuleDocument};
use crate::config::{ForwardingConfig, RuleStorage, StorageError};
use crate::error::ForwardError;
use crate::listeners::{ListenerId, ListenerSet};

/// Notified after every change to the rule set
pub trait RulesListener: Send + Sync {
    fn on_rules_changed(&self);
}

pub struct RuleStore {
    storage: RuleStorage,
    rules: RwLock<Vec<ForwardingRule>>,
    listeners: ListenerSet<dyn RulesListener>,
    /// Serializes mutate + write so the file always matches the last mutation
    save_lock: tokio::sync::Mutex<()>,
    /// Cleared when the document on disk must not be overwritten
    writable: bool,
}

impl RuleStore {
    /// Load the rule set from `storage`.
    ///
    /// A missing or corrupted document yields an empty set. A document from a
    /// newer version, or one that cannot be read, also yields an empty set but
    /// leaves the file untouched.
    pub async fn open(storage: RuleStorage) -> Self {
        let (rules, writable) = match storage.load().await {
            Ok(doc) => {
                info!(
                    "Loaded {} forwarding rules from {:?}",
                    doc.rules.len(),
                    storage.path()
                );
                (doc.rules, true)
            }
            Err(e @ StorageError::VersionTooNew { .. }) => {
                error!("{}; rules will not be saved", e);
                (Vec::new(), false)
            }
            Err(e) => {
                error!("Failed to load forwarding rules: {}; rules will not be saved", e);
                (Vec::new(), false)
            }
        };

        Self {
            storage,
            rules: RwLock::new(rules),
            listeners: ListenerSet::new(),
            save_lock: tokio::sync::Mutex::new(()),
            writable,
        }
    }

    /// Open the rules document configured in `config` (default location unless overridden)
    pub async fn open_configured(config: &ForwardingConfig) -> Result<Self, ForwardError> {
        let path = config
            .rules_path()
            .map_err(|e| ForwardError::Persistence(e.to_string()))?;
        Ok(Self::open(RuleStorage::with_path(path)).await)
    }

    pub fn storage(&self) -> &RuleStorage {
        &self.storage
    }

    /// Write the current set to disk. Failures are logged, never returned.
    async fn persist(&self) {
        if !self.writable {
            warn!("Rules document is read-only for this session, change kept in memory");
            return;
        }

        let doc = RuleDocument {
            rules: self.rules.read().clone(),
            ..RuleDocument::default()
        };
        if let Err(e) = self.storage.save(&doc).await {
            error!("Failed to save forwarding rules: {}", e);
        }
    }

    fn notify(&self) {
        self.listeners.notify("rules changed", |l| l.on_rules_changed());
    }

    fn port_in_use(rules: &[ForwardingRule], port: u16, excluding_id: Option<&str>) -> bool {
        rules.iter().any(|r| {
            r.enabled && r.local_port == port && excluding_id.map_or(true, |id| r.id != id)
        })
    }

    /// Add a rule. Enabled rules may not share a local port.
    pub async fn add(&self, rule: ForwardingRule) -> Result<ForwardingRule, ForwardError> {
        rule.validate()?;

        let _guard = self.save_lock.lock().await;
        {
            let mut rules = self.rules.write();
            if rules.iter().any(|r| r.id == rule.id) {
                return Err(ForwardError::AlreadyExists(format!("rule {}", rule.id)));
            }
            if rule.enabled && Self::port_in_use(&rules, rule.local_port, None) {
                return Err(ForwardError::AlreadyExists(format!(
                    "local port {} is used by another enabled rule",
                    rule.local_port
                )));
            }
            rules.push(rule.clone());
        }
        self.persist().await;
        drop(_guard);

        info!("Added forwarding rule {} ({})", rule.name, rule.id);
        self.notify();
        Ok(rule)
    }

    /// Replace the rule with the same id, keeping its id and creation time
    pub async fn update(&self, rule: ForwardingRule) -> Result<ForwardingRule, ForwardError> {
        rule.validate()?;

        let _guard = self.save_lock.lock().await;
        let updated = {
            let mut rules = self.rules.write();
            let index = rules
                .iter()
                .position(|r| r.id == rule.id)
                .ok_or_else(|| ForwardError::NotFound(format!("rule {}", rule.id)))?;

            if rule.enabled && Self::port_in_use(&rules, rule.local_port, Some(&rule.id)) {
                return Err(ForwardError::AlreadyExists(format!(
                    "local port {} is used by another enabled rule",
                    rule.local_port
                )));
            }

            let mut updated = rule;
            updated.created_at = rules[index].created_at;
            updated.touch();
            rules[index] = updated.clone();
            updated
        };
        self.persist().await;
        drop(_guard);

        info!("Updated forwarding rule {} ({})", updated.name, updated.id);
        self.notify();
        Ok(updated)
    }

    /// Flip a rule's enabled flag
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ForwardingRule, ForwardError> {
        let mut rule = self
            .get_by_id(id)
            .ok_or_else(|| ForwardError::NotFound(format!("rule {}", id)))?;
        rule.enabled = enabled;
        self.update(rule).await
    }

    /// Remove by id; returns false for an unknown id
    pub async fn remove(&self, id: &str) -> bool {
        self.remove_where(|r| r.id == id).await
    }

    /// Remove the first rule with this name; returns false if none matched
    pub async fn remove_by_name(&self, name: &str) -> bool {
        self.remove_where(|r| r.name == name).await
    }

    async fn remove_where<F>(&self, pred: F) -> bool
    where
        F: Fn(&ForwardingRule) -> bool,
    {
        let _guard = self.save_lock.lock().await;
        let removed = {
            let mut rules = self.rules.write();
            match rules.iter().position(|r| pred(r)) {
                Some(index) => rules.remove(index),
                None => return false,
            }
        };
        self.persist().await;
        drop(_guard);

        info!("Removed forwarding rule {} ({})", removed.name, removed.id);
        self.notify();
        true
    }

    /// Snapshot of all rules in insertion order
    pub fn get_all(&self) -> Vec<ForwardingRule> {
        self.rules.read().clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<ForwardingRule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    /// First rule with this name
    pub fn get_by_name(&self, name: &str) -> Option<ForwardingRule> {
        self.rules.read().iter().find(|r| r.name == name).cloned()
    }

    pub fn get_by_owner(&self, owner_session_id: &str) -> Vec<ForwardingRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.owner_session_id.as_deref() == Some(owner_session_id))
            .cloned()
            .collect()
    }

    /// Whether another enabled rule claims `port`
    pub fn is_local_port_in_use(&self, port: u16, excluding_id: Option<&str>) -> bool {
        Self::port_in_use(&self.rules.read(), port, excluding_id)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn add_listener(&self, listener: Arc<dyn RulesListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
