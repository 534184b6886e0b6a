//! Rule-to-Session Adapter
//!
//! Maps rule ids to running forwards and implements the global forwarding
//! switch. Without a manager attached it only tracks which rules are turned
//! on.
//!
//! Once [`attach`](RuleSessionAdapter::attach)ed, every rule change runs
//! [`reconcile`](RuleSessionAdapter::reconcile), so the running sessions
//! follow the enabled rules: enabling a rule starts its tunnel, disabling or
//! removing it stops the tunnel, and editing its endpoints restarts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::manager::ForwardSessionManager;
use super::types::ForwardSpec;
use crate::error::ForwardError;
use crate::listeners::ListenerId;
use crate::rules::{ForwardingRule, RuleStore, RulesListener};

#[derive(Debug, Clone)]
struct RuleSession {
    /// Forward identity of the rule as it was when the session started
    forward_key: String,
    /// Set once the forward is up; None while starting or without a manager
    forward_id: Option<String>,
}

/// Forward identity a rule maps to
fn forward_key(rule: &ForwardingRule) -> String {
    ForwardSpec::local(rule.local_port, rule.target_host.as_str(), rule.target_port).id()
}

/// What a [`reconcile`](RuleSessionAdapter::reconcile) pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions whose rule was removed or disabled
    pub stopped: usize,
    /// Sessions restarted because their rule's endpoints changed
    pub restarted: usize,
    /// Enabled rules that had no session
    pub started: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.stopped == 0 && self.restarted == 0 && self.started == 0
    }
}

pub struct RuleSessionAdapter {
    rules: Arc<RuleStore>,
    manager: Option<Arc<ForwardSessionManager>>,
    enabled: AtomicBool,
    sessions: Mutex<HashMap<String, RuleSession>>,
    rules_listener: Mutex<Option<ListenerId>>,
    /// One reconcile pass at a time
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl RuleSessionAdapter {
    /// Adapter that only tracks session state
    pub fn new(rules: Arc<RuleStore>) -> Self {
        Self {
            rules,
            manager: None,
            enabled: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
            rules_listener: Mutex::new(None),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Adapter that starts a local forward per running rule
    pub fn with_manager(rules: Arc<RuleStore>, manager: Arc<ForwardSessionManager>) -> Self {
        Self {
            manager: Some(manager),
            ..Self::new(rules)
        }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// Start forwarding for a rule.
    ///
    /// Returns `Ok(false)` if the rule doesn't exist or forwarding is globally
    /// disabled, `Ok(true)` once the session is running (or already was).
    pub async fn start_session(&self, rule_id: &str) -> Result<bool, ForwardError> {
        let Some(rule) = self.rules.get_by_id(rule_id) else {
            debug!("start_session: no rule {}", rule_id);
            return Ok(false);
        };

        {
            let mut sessions = self.sessions.lock();
            // Checked under the lock so a concurrent disable can't miss this session
            if !self.is_enabled() {
                debug!("start_session: forwarding disabled, ignoring {}", rule_id);
                return Ok(false);
            }
            if sessions.contains_key(rule_id) {
                return Ok(true);
            }
            sessions.insert(
                rule_id.to_string(),
                RuleSession {
                    forward_key: forward_key(&rule),
                    forward_id: None,
                },
            );
        }

        let Some(manager) = &self.manager else {
            info!("Session started for rule {} ({})", rule.name, rule_id);
            return Ok(true);
        };

        let entry = match manager
            .add_local_forward(rule.local_port, &rule.target_host, rule.target_port)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                self.sessions.lock().remove(rule_id);
                warn!("Failed to start session for rule {}: {}", rule_id, e);
                return Err(e);
            }
        };

        let still_wanted = match self.sessions.lock().get_mut(rule_id) {
            Some(session) => {
                session.forward_id = Some(entry.id.clone());
                true
            }
            None => false,
        };

        if !still_wanted {
            // Stopped while the forward was being set up
            manager.remove_forward(&entry.id).await?;
            return Ok(false);
        }

        info!(
            "Session started for rule {} ({}): {}",
            rule.name,
            rule_id,
            entry.description()
        );
        Ok(true)
    }

    /// Stop forwarding for a rule. Unknown or stopped rules are a no-op.
    pub async fn stop_session(&self, rule_id: &str) {
        let session = self.sessions.lock().remove(rule_id);
        if let Some(session) = session {
            self.close_session(rule_id, session).await;
        }
    }

    async fn close_session(&self, rule_id: &str, session: RuleSession) {
        if let (Some(manager), Some(forward_id)) = (&self.manager, session.forward_id) {
            // remove_forward never fails; teardown errors are logged inside
            let _ = manager.remove_forward(&forward_id).await;
        }
        info!("Session stopped for rule {}", rule_id);
    }

    /// Stop every running session; returns how many were stopped
    pub async fn stop_all_sessions(&self) -> usize {
        let sessions: Vec<(String, RuleSession)> = self.sessions.lock().drain().collect();
        let count = sessions.len();
        for (rule_id, session) in sessions {
            self.close_session(&rule_id, session).await;
        }
        count
    }

    pub fn is_session_running(&self, rule_id: &str) -> bool {
        self.sessions.lock().contains_key(rule_id)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Global switch. Disabling stops all sessions immediately; re-enabling
    /// an attached adapter brings the enabled rules back up.
    pub async fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.enabled.swap(enabled, Ordering::SeqCst);
        if was_enabled && !enabled {
            let stopped = self.stop_all_sessions().await;
            info!("Forwarding disabled, stopped {} sessions", stopped);
        } else if !was_enabled && enabled && self.is_attached() {
            let report = self.reconcile().await;
            info!("Forwarding enabled, started {} sessions", report.started);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Bring the running sessions in line with the rule set.
    ///
    /// Sessions whose rule is gone or disabled are stopped, sessions whose
    /// rule now maps to a different forward are restarted, and while
    /// forwarding is enabled every enabled rule without a session is started.
    /// Start failures are logged and leave the rule without a session.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.reconcile_lock.lock().await;
        let rules = self.rules.get_all();
        let mut report = ReconcileReport::default();

        let mut stale = Vec::new();
        let mut retargeted = Vec::new();
        for (rule_id, session) in self.sessions.lock().iter() {
            match rules.iter().find(|r| &r.id == rule_id) {
                Some(rule) if !rule.enabled => stale.push(rule_id.clone()),
                Some(rule) if forward_key(rule) != session.forward_key => {
                    retargeted.push(rule_id.clone())
                }
                Some(_) => {}
                None => stale.push(rule_id.clone()),
            }
        }

        for rule_id in &stale {
            self.stop_session(rule_id).await;
            report.stopped += 1;
        }

        for rule_id in &retargeted {
            self.stop_session(rule_id).await;
            match self.start_session(rule_id).await {
                Ok(true) => report.restarted += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to restart session for rule {}: {}", rule_id, e),
            }
        }

        if self.is_enabled() {
            for rule in rules.iter().filter(|r| r.enabled) {
                if self.is_session_running(&rule.id) {
                    continue;
                }
                match self.start_session(&rule.id).await {
                    Ok(true) => report.started += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to start session for rule {}: {}", rule.id, e),
                }
            }
        }

        report
    }

    /// Follow rule store changes with [`reconcile`](Self::reconcile), starting
    /// with one pass right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(self: &Arc<Self>) -> ListenerId {
        let mut registered = self.rules_listener.lock();
        if let Some(id) = *registered {
            return id;
        }
        let listener = Arc::new(ReconcileOnChange(Arc::downgrade(self)));
        let id = self.rules.add_listener(listener.clone());
        *registered = Some(id);
        drop(registered);

        listener.on_rules_changed();
        id
    }

    pub fn detach(&self) -> bool {
        match self.rules_listener.lock().take() {
            Some(id) => self.rules.remove_listener(id),
            None => false,
        }
    }

    fn is_attached(&self) -> bool {
        self.rules_listener.lock().is_some()
    }
}

struct ReconcileOnChange(Weak<RuleSessionAdapter>);

impl RulesListener for ReconcileOnChange {
    fn on_rules_changed(&self) {
        let Some(adapter) = self.0.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let report = adapter.reconcile().await;
                    if !report.is_empty() {
                        info!("Sessions reconciled after rule change: {:?}", report);
                    }
                });
            }
            Err(_) => warn!("Rules changed outside a tokio runtime, sessions not reconciled"),
        }
    }
}
