//! Periodic per-definition scan loops.
//!
//! Every enabled definition gets its own loop, so scans of one definition
//! never overlap; a shared semaphore bounds how many scans run at once.
//! Loops scan immediately on start, then on their interval, on an explicit
//! wake-up, or on a re-baseline request.

use drift_core::definition::Definition;
use drift_core::errors::DriftError;
use drift_core::snapshot::{CancelToken, TreeWalker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{DriftAgent, ScanOutcome};

/// Control handle for running scan loops.
pub struct SchedulerHandle {
    wakes: HashMap<String, Arc<Notify>>,
    rebaseline: Arc<Mutex<HashSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
    cancel: CancelToken,
}

impl SchedulerHandle {
    /// Scan `definition` now instead of waiting for its interval.
    pub fn wake(&self, definition: &str) -> bool {
        match self.wakes.get(definition) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn wake_all(&self) {
        for notify in self.wakes.values() {
            notify.notify_one();
        }
    }

    /// Make the next scan of `definition` a coverage change-set, and run it
    /// now.
    pub fn request_rebaseline(&self, definition: &str) -> bool {
        if !self.wakes.contains_key(definition) {
            return false;
        }
        self.rebaseline.lock().insert(definition.to_string());
        self.wake(definition)
    }

    /// Stop all loops and cancel scans in progress.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(true);
    }
}

/// Callback invoked after every completed scan.
pub type ScanCallback = Arc<dyn Fn(&ScanOutcome) + Send + Sync>;

pub fn spawn_scheduler<W: TreeWalker + 'static>(
    agent: Arc<DriftAgent<W>>,
    definitions: Vec<(Definition, Duration)>,
    workers: usize,
    on_scan: Option<ScanCallback>,
) -> (Vec<JoinHandle<()>>, SchedulerHandle) {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rebaseline = Arc::new(Mutex::new(HashSet::new()));
    let cancel = CancelToken::new();
    let mut wakes = HashMap::new();
    let mut tasks = Vec::new();

    for (definition, interval) in definitions.into_iter().filter(|(d, _)| d.enabled) {
        let wake = Arc::new(Notify::new());
        wakes.insert(definition.name.clone(), wake.clone());
        tasks.push(tokio::spawn(scan_loop(
            agent.clone(),
            definition,
            interval,
            semaphore.clone(),
            wake,
            rebaseline.clone(),
            shutdown_rx.clone(),
            cancel.clone(),
            on_scan.clone(),
        )));
    }

    info!(loops = tasks.len(), workers, "scheduler started");
    (
        tasks,
        SchedulerHandle {
            wakes,
            rebaseline,
            shutdown_tx,
            cancel,
        },
    )
}

#[allow(clippy::too_many_arguments)]
async fn scan_loop<W: TreeWalker + 'static>(
    agent: Arc<DriftAgent<W>>,
    definition: Definition,
    interval: Duration,
    semaphore: Arc<Semaphore>,
    wake: Arc<Notify>,
    rebaseline: Arc<Mutex<HashSet<String>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    cancel: CancelToken,
    on_scan: Option<ScanCallback>,
) {
    let name = definition.name.clone();
    info!(definition = %name, interval_secs = interval.as_secs(), "scan loop started");
    let mut first = true;

    loop {
        if !first {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {
                    debug!(definition = %name, "scan loop woken early");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        first = false;

        if *shutdown_rx.borrow() {
            info!(definition = %name, "scan loop shutting down");
            return;
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = shutdown_rx.changed() => return,
        };

        let wants_rebaseline = rebaseline.lock().remove(&name);
        let result = agent.run_scan(&definition, &cancel, wants_rebaseline).await;
        drop(permit);

        match result {
            Ok(outcome) => {
                if let Some(cb) = &on_scan {
                    cb(&outcome);
                }
            }
            Err(e) => {
                if wants_rebaseline {
                    // keep the request for the next attempt
                    rebaseline.lock().insert(name.clone());
                }
                match e.downcast_ref::<DriftError>() {
                    Some(DriftError::Cancelled) => {
                        info!(definition = %name, "scan cancelled");
                        return;
                    }
                    Some(err) if err.is_retryable() => {
                        warn!(definition = %name, error = %e, "scan failed, will retry");
                    }
                    _ => {
                        let chain = format!("{e:#}");
                        error!(definition = %name, error = %chain, "scan failed");
                    }
                }
            }
        }
    }
}
