//! Forward Session Manager
//!
//! Authoritative registry of the forwards layered on one transport session.
//!
//! Entry lifecycle: `Stopped -> Active` on successful setup, `Active -> Error`
//! on a runtime failure (the entry stays registered so the error is visible),
//! and back to `Stopped` on explicit removal. Nothing is retried
//! automatically.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::events::{ForwardEvent, ForwardListener};
use super::types::{ForwardEntry, ForwardSpec, ForwardStatus};
use crate::config::ForwardingConfig;
use crate::error::ForwardError;
use crate::listeners::{ListenerId, ListenerSet};
use crate::transport::{TransportError, TransportSession};

/// Error message given to active forwards when the transport goes away
pub const CONNECTION_LOST: &str = "SSH connection lost";

#[derive(Default)]
struct Registry {
    /// Insertion order is teardown order
    entries: Vec<ForwardEntry>,
    /// Identities whose transport setup is in flight
    pending: HashSet<String>,
}

pub struct ForwardSessionManager {
    transport: Arc<dyn TransportSession>,
    config: ForwardingConfig,
    registry: Mutex<Registry>,
    listeners: ListenerSet<dyn ForwardListener>,
}

/// Releases a pending identity even if the setup future is dropped
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.lock().pending.remove(&self.id);
    }
}

impl ForwardSessionManager {
    pub fn new(transport: Arc<dyn TransportSession>, config: ForwardingConfig) -> Self {
        Self {
            transport,
            config,
            registry: Mutex::new(Registry::default()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    /// Listen on `local_port` and forward to `remote_host:remote_port` through the tunnel
    pub async fn add_local_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardEntry, ForwardError> {
        self.add_forward(ForwardSpec::local(local_port, remote_host, remote_port))
            .await
    }

    /// Have the server listen on `remote_port` and forward back to `local_host:local_port`
    pub async fn add_remote_forward(
        &self,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<ForwardEntry, ForwardError> {
        self.add_forward(ForwardSpec::remote(remote_port, local_host, local_port))
            .await
    }

    /// SOCKS5 proxy on `local_port`
    pub async fn add_dynamic_forward(&self, local_port: u16) -> Result<ForwardEntry, ForwardError> {
        self.add_forward(ForwardSpec::dynamic(local_port)).await
    }

    /// Validate, reserve the identity, then set the forward up on the transport.
    ///
    /// A failed setup registers nothing; listeners get an `Error` event with
    /// an unregistered entry carrying the message.
    pub async fn add_forward(&self, spec: ForwardSpec) -> Result<ForwardEntry, ForwardError> {
        spec.validate()?;
        let id = spec.id();

        let reservation = {
            let mut registry = self.registry.lock();
            if registry.pending.contains(&id) || registry.entries.iter().any(|e| e.id == id) {
                return Err(ForwardError::AlreadyExists(format!("forward {}", id)));
            }
            registry.pending.insert(id.clone());
            Reservation {
                registry: &self.registry,
                id: id.clone(),
            }
        };

        info!("Creating {} forward {}", spec.forward_type(), spec.description());

        match self.setup(&spec).await {
            Ok(()) => {
                let entry = ForwardEntry::new(spec, ForwardStatus::Active);
                self.registry.lock().entries.push(entry.clone());
                drop(reservation);

                info!("Forward created: {}", entry.id);
                self.notify(ForwardEvent::Added, &entry);
                Ok(entry)
            }
            Err(e) => {
                drop(reservation);
                warn!("Failed to create forward {}: {}", id, e);

                let mut entry = ForwardEntry::new(spec, ForwardStatus::Error);
                entry.error = Some(e.to_string());
                self.notify(ForwardEvent::Error, &entry);
                Err(ForwardError::TransportFailure(e))
            }
        }
    }

    /// Single dispatch from spec kind to transport setup, bounded by the setup timeout
    async fn setup(&self, spec: &ForwardSpec) -> Result<(), TransportError> {
        let transport = &self.transport;
        let setup = match spec {
            ForwardSpec::Local {
                local_port,
                remote_host,
                remote_port,
            } => transport.add_local_port_forwarding(*local_port, remote_host, *remote_port),
            ForwardSpec::Remote {
                remote_port,
                local_host,
                local_port,
            } => transport.add_remote_port_forwarding(*remote_port, local_host, *local_port),
            ForwardSpec::Dynamic { local_port } => transport.add_dynamic_port_forwarding(*local_port),
        };

        let timeout = self.config.setup_timeout();
        tokio::time::timeout(timeout, setup).await.map_err(|_| {
            TransportError::Timeout(format!(
                "forward setup did not complete within {}ms",
                timeout.as_millis()
            ))
        })?
    }

    /// Undo a forward on the transport. Failures are logged and swallowed.
    async fn teardown_best_effort(&self, spec: &ForwardSpec) {
        let transport = &self.transport;
        let result = match spec {
            ForwardSpec::Local { local_port, .. } => {
                transport.remove_local_port_forwarding(*local_port).await
            }
            ForwardSpec::Remote { remote_port, .. } => {
                transport.remove_remote_port_forwarding(*remote_port).await
            }
            ForwardSpec::Dynamic { local_port } => {
                transport.remove_dynamic_port_forwarding(*local_port).await
            }
        };

        if let Err(e) = result {
            warn!("Teardown of {} failed (ignored): {}", spec.id(), e);
        }
    }

    /// Stop and evict a forward. Unknown ids are a no-op.
    pub async fn remove_forward(&self, id: &str) -> Result<(), ForwardError> {
        self.remove_entry(id).await;
        Ok(())
    }

    async fn remove_entry(&self, id: &str) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            registry
                .entries
                .iter()
                .position(|e| e.id == id)
                .map(|index| registry.entries.remove(index))
        };
        let Some(mut entry) = removed else {
            return false;
        };

        self.teardown_best_effort(&entry.spec).await;

        entry.status = ForwardStatus::Stopped;
        info!("Stopped forward: {}", entry.id);
        self.notify(ForwardEvent::Removed, &entry);
        true
    }

    /// Remove every registered forward in insertion order; returns how many were removed
    pub async fn remove_all_forwards(&self) -> usize {
        let ids: Vec<String> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|e| e.id.clone())
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.remove_entry(&id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Move an active forward to `Error`; returns false if it wasn't active
    pub fn mark_error(&self, id: &str, message: impl Into<String>) -> bool {
        let entry = {
            let mut registry = self.registry.lock();
            match registry.entries.iter_mut().find(|e| e.id == id && e.is_active()) {
                Some(entry) => {
                    entry.status = ForwardStatus::Error;
                    entry.error = Some(message.into());
                    entry.clone()
                }
                None => return false,
            }
        };

        error!(
            "Forward {} failed: {}",
            entry.id,
            entry.error.as_deref().unwrap_or_default()
        );
        self.notify(ForwardEvent::StatusChanged, &entry);
        self.notify(ForwardEvent::Error, &entry);
        true
    }

    /// Mark every active forward as failed when the transport reports a disconnect.
    ///
    /// Returns `None` if the transport has no disconnect signal. The task holds
    /// only a weak reference and exits once the manager is dropped.
    pub fn watch_transport(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut disconnect_rx = self.transport.subscribe_disconnect()?;
        // Checked after subscribing: a disconnect before this point is not replayed
        let already_gone = !self.transport.is_connected();
        let manager: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            if !already_gone {
                // Closed or lagged both mean the connection is gone
                let _ = disconnect_rx.recv().await;
            }

            let Some(manager) = manager.upgrade() else {
                return;
            };
            let ids: Vec<String> = manager
                .registry
                .lock()
                .entries
                .iter()
                .filter(|e| e.is_active())
                .map(|e| e.id.clone())
                .collect();

            info!("Transport disconnected, {} forwards affected", ids.len());
            for id in ids {
                manager.mark_error(&id, CONNECTION_LOST);
            }
        }))
    }

    /// Snapshot of all registered forwards (active and failed), insertion order
    pub fn get_active_forwards(&self) -> Vec<ForwardEntry> {
        self.registry.lock().entries.clone()
    }

    pub fn get_forward(&self, id: &str) -> Option<ForwardEntry> {
        self.registry
            .lock()
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn ForwardListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn notify(&self, event: ForwardEvent, entry: &ForwardEntry) {
        self.listeners
            .notify("forward event", |l| l.on_forward_event(event, entry));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;
    use crate::forwarding::ChannelListener;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager(transport: &Arc<MockTransport>) -> Arc<ForwardSessionManager> {
        Arc::new(ForwardSessionManager::new(
            transport.clone(),
            ForwardingConfig::default(),
        ))
    }

    struct Panicky;

    impl ForwardListener for Panicky {
        fn on_forward_event(&self, _event: ForwardEvent, _entry: &ForwardEntry) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_local_forward_scenario() {
        let transport = MockTransport::new();
        let manager = manager(&transport);

        let entry = manager
            .add_local_forward(13306, "10.0.0.5", 3306)
            .await
            .unwrap();

        assert_eq!(entry.id, "L:13306:10.0.0.5:3306");
        assert_eq!(entry.status, ForwardStatus::Active);
        assert_eq!(entry.description(), "localhost:13306 → 10.0.0.5:3306");

        let active = manager.get_active_forwards();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, entry.id);
        assert_eq!(
            transport.calls.lock().as_slice(),
            &["add L 13306 10.0.0.5 3306".to_string()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_dynamic_forward() {
        let transport = MockTransport::new();
        let manager = manager(&transport);

        manager.add_dynamic_forward(1080).await.unwrap();
        let err = manager.add_dynamic_forward(1080).await.unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(transport.adds(), 1);
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get_active_forwards()[0].id, "D:1080");
    }

    #[tokio::test]
    async fn test_duplicate_rejected_while_setup_in_flight() {
        let transport = MockTransport::new();
        *transport.setup_delay.lock() = Some(Duration::from_millis(200));
        let manager = manager(&transport);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.add_dynamic_forward(1080).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = manager.add_dynamic_forward(1080).await.unwrap_err();
        assert!(err.is_already_exists());

        first.await.unwrap().unwrap();
        assert_eq!(transport.adds(), 1);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_validation_before_transport() {
        let transport = MockTransport::new();
        let manager = manager(&transport);

        let err = manager.add_local_forward(0, "localhost", 80).await.unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
        let err = manager.add_remote_forward(9000, " ", 3000).await.unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
        assert_eq!(transport.adds(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_registers_nothing() {
        let transport = MockTransport::new();
        transport.fail_add.store(true, Ordering::SeqCst);
        let manager = manager(&transport);
        let (listener, mut rx) = ChannelListener::new();
        manager.add_listener(Arc::new(listener));

        let err = manager
            .add_remote_forward(9000, "localhost", 3000)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::TransportFailure(_)));
        assert!(err.to_string().contains("bind refused"));
        assert_eq!(manager.count(), 0);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event, ForwardEvent::Error);
        assert_eq!(notification.entry.status, ForwardStatus::Error);
        assert!(notification.entry.error.unwrap().contains("bind refused"));

        // Identity is free again
        transport.fail_add.store(false, Ordering::SeqCst);
        manager
            .add_remote_forward(9000, "localhost", 3000)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout() {
        let transport = MockTransport::new();
        *transport.setup_delay.lock() = Some(Duration::from_secs(60));
        let manager = manager(&transport);

        let err = manager.add_dynamic_forward(1080).await.unwrap_err();
        assert!(matches!(
            err,
            ForwardError::TransportFailure(TransportError::Timeout(_))
        ));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let transport = MockTransport::new();
        let manager = manager(&transport);

        manager.remove_forward("L:1:nowhere:1").await.unwrap();
        assert_eq!(transport.removes(), 0);
    }

    #[tokio::test]
    async fn test_remove_forward_events() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        let (listener, mut rx) = ChannelListener::new();
        manager.add_listener(Arc::new(listener));

        let entry = manager
            .add_remote_forward(9000, "localhost", 3000)
            .await
            .unwrap();
        manager.remove_forward(&entry.id).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event, ForwardEvent::Added);
        let removed = rx.recv().await.unwrap();
        assert_eq!(removed.event, ForwardEvent::Removed);
        assert_eq!(removed.entry.status, ForwardStatus::Stopped);
        assert!(manager.get_forward(&entry.id).is_none());
        assert_eq!(transport.calls.lock().last().unwrap(), "remove R 9000");
    }

    #[tokio::test]
    async fn test_remove_all_despite_teardown_failures() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        let (listener, mut rx) = ChannelListener::new();

        manager.add_local_forward(8080, "localhost", 80).await.unwrap();
        manager.add_remote_forward(9000, "localhost", 3000).await.unwrap();
        manager.add_dynamic_forward(1080).await.unwrap();

        manager.add_listener(Arc::new(listener));
        transport.fail_remove.store(true, Ordering::SeqCst);

        assert_eq!(manager.remove_all_forwards().await, 3);
        assert_eq!(manager.count(), 0);
        assert_eq!(transport.removes(), 3);

        let mut removed = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            assert_eq!(notification.event, ForwardEvent::Removed);
            removed.push(notification.entry.id);
        }
        assert_eq!(removed, vec!["L:8080:localhost:80", "R:9000:localhost:3000", "D:1080"]);
    }

    #[tokio::test]
    async fn test_faulty_listener_does_not_block_others() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        let (listener, mut rx) = ChannelListener::new();
        manager.add_listener(Arc::new(Panicky));
        manager.add_listener(Arc::new(listener));

        manager.add_dynamic_forward(1080).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, ForwardEvent::Added);
    }

    #[tokio::test]
    async fn test_mark_error_keeps_entry() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        let (listener, mut rx) = ChannelListener::new();

        let entry = manager.add_dynamic_forward(1080).await.unwrap();
        manager.add_listener(Arc::new(listener));

        assert!(manager.mark_error(&entry.id, "listener died"));
        assert!(!manager.mark_error(&entry.id, "again"));

        let failed = manager.get_forward(&entry.id).unwrap();
        assert_eq!(failed.status, ForwardStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("listener died"));
        assert_eq!(rx.recv().await.unwrap().event, ForwardEvent::StatusChanged);
        assert_eq!(rx.recv().await.unwrap().event, ForwardEvent::Error);

        // Error -> Stopped by explicit removal
        manager.remove_forward(&entry.id).await.unwrap();
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_marks_forwards_failed() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        let watcher = manager.watch_transport().unwrap();

        manager.add_local_forward(8080, "localhost", 80).await.unwrap();
        manager.add_dynamic_forward(1080).await.unwrap();

        transport.disconnect_tx.send(()).unwrap();
        watcher.await.unwrap();

        for entry in manager.get_active_forwards() {
            assert_eq!(entry.status, ForwardStatus::Error);
            assert_eq!(entry.error.as_deref(), Some(CONNECTION_LOST));
        }
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn test_watch_after_disconnect_fails_forwards_at_once() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        manager.add_local_forward(8080, "localhost", 80).await.unwrap();

        // Signal fired before anyone subscribed
        transport.connected.store(false, Ordering::SeqCst);
        let _ = transport.disconnect_tx.send(());

        let watcher = manager.watch_transport().unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher must not wait for a second signal")
            .unwrap();

        let entry = manager.get_forward("L:8080:localhost:80").unwrap();
        assert_eq!(entry.status, ForwardStatus::Error);
        assert_eq!(entry.error.as_deref(), Some(CONNECTION_LOST));
    }

    #[tokio::test]
    async fn test_listener_may_reenter_manager() {
        struct RemoveOnAdd(Weak<ForwardSessionManager>);

        impl ForwardListener for RemoveOnAdd {
            fn on_forward_event(&self, event: ForwardEvent, entry: &ForwardEntry) {
                if event == ForwardEvent::Added {
                    if let Some(manager) = self.0.upgrade() {
                        // Would deadlock if the registry lock were still held
                        assert_eq!(manager.get_forward(&entry.id).unwrap().id, entry.id);
                        manager.mark_error(&entry.id, "rejected by observer");
                    }
                }
            }
        }

        let transport = MockTransport::new();
        let manager = manager(&transport);
        manager.add_listener(Arc::new(RemoveOnAdd(Arc::downgrade(&manager))));

        let entry = manager.add_dynamic_forward(1080).await.unwrap();
        assert_eq!(
            manager.get_forward(&entry.id).unwrap().status,
            ForwardStatus::Error
        );
    }

    #[tokio::test]
    async fn test_add_forward_from_parts() {
        let transport = MockTransport::new();
        let manager = manager(&transport);

        let spec = ForwardSpec::from_parts("remote", 9000, "localhost", 3000).unwrap();
        let entry = manager.add_forward(spec).await.unwrap();
        assert_eq!(entry.id, "R:9000:localhost:3000");

        let listener_id = manager.add_listener(Arc::new(Panicky));
        assert!(manager.remove_listener(listener_id));
        assert!(!manager.remove_listener(listener_id));
    }
}
