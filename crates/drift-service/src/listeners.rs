//! Consumers notified after a change-set has been durably appended.

use drift_core::changeset::{Category, ChangeSet};
use drift_core::definition::HandlingMode;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Payload handed to every listener once a change-set is stored.
#[derive(Debug, Clone)]
pub struct ChangeSetReady {
    pub definition: String,
    pub handling_mode: HandlingMode,
    pub change_set: Arc<ChangeSet>,
    /// Drift that nobody announced: a non-empty drift change-set of a
    /// definition in normal handling mode.
    pub alertable: bool,
}

impl ChangeSetReady {
    pub fn new(change_set: Arc<ChangeSet>, handling_mode: HandlingMode) -> Self {
        let alertable = change_set.category == Category::Drift
            && !change_set.is_empty()
            && handling_mode == HandlingMode::Normal;
        Self {
            definition: change_set.definition.clone(),
            handling_mode,
            change_set,
            alertable,
        }
    }
}

pub trait ChangeSetListener: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    fn on_change_set_ready(&self, event: &ChangeSetReady) -> anyhow::Result<()>;
}

/// Named listener implementations. A failing listener is logged and never
/// affects the others or the ingestion that triggered it.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ChangeSetListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ChangeSetListener>) -> anyhow::Result<()> {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| l.name() == listener.name()) {
            anyhow::bail!("listener {} already registered", listener.name());
        }
        debug!(listener = listener.name(), "listener registered");
        listeners.push(listener);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Deliver `event` to every listener in registration order.
    pub fn notify(&self, event: &ChangeSetReady) {
        // snapshot the list so a listener may (un)register without deadlock
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            if let Err(e) = listener.on_change_set_ready(event) {
                warn!(
                    listener = listener.name(),
                    definition = %event.definition,
                    version = event.change_set.version,
                    error = %e,
                    "listener failed"
                );
            }
        }
    }
}
