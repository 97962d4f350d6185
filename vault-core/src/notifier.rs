//! Per-threshold wait registrations
//!
//! A registration exists while at least one caller waits for the sequence
//! counter to exceed its threshold:
//!
//! ```text
//! (none) --register--> waiting(n) --fire--> draining(n) --release x n--> (none)
//! ```
//!
//! Firing publishes the snapshot of the mutation that crossed the threshold
//! on a `watch` channel, so every waiter on that threshold observes the same
//! post-mutation state and a waiter that subscribes late cannot miss it.
//!
//! The arena itself is not synchronized; it lives inside the state lock
//! together with the counter it is compared against.

use crate::types::Snapshot;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Wake signal; `None` until fired
pub type WakeSignal = watch::Receiver<Option<Arc<Snapshot>>>;

#[derive(Debug)]
struct Registration {
    waiters: usize,
    signal: watch::Sender<Option<Arc<Snapshot>>>,
}

impl Registration {
    fn new() -> Self {
        let (signal, _) = watch::channel(None);
        Self { waiters: 0, signal }
    }

    fn fired(&self) -> bool {
        self.signal.borrow().is_some()
    }
}

/// Threshold -> registration
#[derive(Debug, Default)]
pub struct WaitArena {
    registrations: HashMap<u64, Registration>,
}

impl WaitArena {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Join (or lazily create) the registration for `threshold`
    pub fn register(&mut self, threshold: u64) -> WakeSignal {
        let registration = self
            .registrations
            .entry(threshold)
            .or_insert_with(Registration::new);
        registration.waiters += 1;
        registration.signal.subscribe()
    }

    /// Leave the registration for `threshold`; the last one out removes it
    pub fn release(&mut self, threshold: u64) {
        if let Entry::Occupied(mut occupied) = self.registrations.entry(threshold) {
            let registration = occupied.get_mut();
            registration.waiters = registration.waiters.saturating_sub(1);
            if registration.waiters == 0 {
                occupied.remove();
            }
        }
    }

    /// Fire every registration whose threshold is below `sequence`.
    ///
    /// `snapshot` is only built when something fires. Registrations that
    /// already fired keep the snapshot of the mutation that crossed them.
    /// Returns the number of registrations fired.
    pub fn notify_advanced(&mut self, sequence: u64, snapshot: impl FnOnce() -> Snapshot) -> usize {
        let crossed: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|(threshold, registration)| **threshold < sequence && !registration.fired())
            .map(|(_, registration)| registration)
            .collect();

        if crossed.is_empty() {
            return 0;
        }

        let snapshot = Arc::new(snapshot());
        for registration in &crossed {
            registration.signal.send_replace(Some(Arc::clone(&snapshot)));
        }

        crossed.len()
    }

    /// Callers currently suspended, across all thresholds
    pub fn pending_waiters(&self) -> usize {
        self.registrations.values().map(|r| r.waiters).sum()
    }

    /// Distinct thresholds with live registrations
    pub fn thresholds(&self) -> usize {
        self.registrations.len()
    }
}
