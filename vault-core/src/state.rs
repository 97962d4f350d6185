//! Shared process state
//!
//! `VaultState` is the context object owned by one [`Vault`](crate::Vault):
//! the balance cache, the sequence counter and the wait arena sit behind one
//! lock, so a reader either sees a mutation completely or not at all and a
//! waiter cannot slip between a counter check and its registration.
//!
//! The lock is never held across an `.await`.

use crate::{
    cache::BalanceCache,
    error::{Error, Result},
    notifier::WaitArena,
    types::{HolderId, Snapshot},
    Storage,
};
use parking_lot::Mutex;

#[derive(Debug)]
struct StateInner {
    cache: BalanceCache,
    sequence: u64,
    waiters: WaitArena,
}

impl StateInner {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            balances: self.cache.to_map(),
            sequence: self.sequence,
        }
    }

    fn notify_advanced(&mut self) -> usize {
        let Self {
            cache,
            sequence,
            waiters,
        } = self;
        let sequence = *sequence;
        waiters.notify_advanced(sequence, || Snapshot {
            balances: cache.to_map(),
            sequence,
        })
    }
}

/// Cache + counter + waiters under one lock
#[derive(Debug)]
pub struct VaultState {
    inner: Mutex<StateInner>,
}

impl VaultState {
    /// Build from a full ledger scan
    pub fn rebuild(storage: &Storage) -> Result<Self> {
        let (cache, sequence) = BalanceCache::rebuild(storage)?;

        tracing::info!(
            holders = cache.len(),
            sequence,
            "Balance cache rebuilt"
        );

        Ok(Self {
            inner: Mutex::new(StateInner {
                cache,
                sequence,
                waiters: WaitArena::new(),
            }),
        })
    }

    /// Replace cache and counter with a fresh scan, keeping live waiters
    pub fn reload(&self, storage: &Storage) -> Result<u64> {
        let (cache, sequence) = BalanceCache::rebuild(storage)?;

        let mut inner = self.inner.lock();
        inner.cache = cache;
        inner.sequence = sequence;
        let fired = inner.notify_advanced();

        tracing::info!(
            holders = inner.cache.len(),
            sequence,
            fired,
            "Balance cache reloaded"
        );

        Ok(sequence)
    }

    /// Copy of balances and counter
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot()
    }

    /// Current sequence counter
    pub fn sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    /// Whether the holder is registered
    pub fn contains(&self, holder: &HolderId) -> bool {
        self.inner.lock().cache.contains(holder)
    }

    /// Cached balance of one holder
    pub fn balance(&self, holder: &HolderId) -> Option<i64> {
        self.inner.lock().cache.get(holder)
    }

    /// Σ of all cached totals
    pub fn total(&self) -> i128 {
        self.inner.lock().cache.sum()
    }

    /// Apply a committed mutation: update the cache, advance the counter by
    /// `appended` and wake crossed waiters, all under one lock acquisition.
    ///
    /// `committed_sequence` is the ledger count after the write; if the
    /// counter would not land on it, nothing changes and a consistency
    /// violation is returned.
    pub fn commit(
        &self,
        appended: u64,
        committed_sequence: u64,
        apply: impl FnOnce(&mut BalanceCache) -> Result<()>,
    ) -> Result<Snapshot> {
        let mut inner = self.inner.lock();

        if inner.sequence + appended != committed_sequence {
            return Err(Error::ConsistencyViolation(format!(
                "Counter at {} advancing by {} does not reach ledger count {}",
                inner.sequence, appended, committed_sequence
            )));
        }

        apply(&mut inner.cache)?;
        inner.sequence = committed_sequence;

        let fired = inner.notify_advanced();
        if fired > 0 {
            tracing::debug!(sequence = committed_sequence, fired, "Woke long-poll waiters");
        }

        Ok(inner.snapshot())
    }

    /// Suspend until the counter exceeds `threshold`.
    ///
    /// Returns immediately when it already does. Otherwise the returned
    /// snapshot is the one produced by the mutation that crossed the
    /// threshold. Dropping the future abandons the wait and releases its
    /// registration.
    pub async fn wait_until_greater_than(&self, threshold: u64) -> Snapshot {
        let mut signal = {
            let mut inner = self.inner.lock();
            if inner.sequence > threshold {
                return inner.snapshot();
            }
            inner.waiters.register(threshold)
        };
        let _registered = WaitGuard {
            state: self,
            threshold,
        };

        tracing::debug!(threshold, "Waiting for sequence to advance");

        let fired = signal
            .wait_for(|fired| fired.as_ref().map_or(false, |s| s.sequence > threshold))
            .await
            .map(|fired| Option::clone(&fired));

        match fired {
            Ok(Some(snapshot)) => Snapshot::clone(&snapshot),
            _ => {
                tracing::warn!(threshold, "Wait registration dropped before firing");
                self.snapshot()
            }
        }
    }

    /// Callers currently suspended in [`wait_until_greater_than`](Self::wait_until_greater_than)
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock().waiters.pending_waiters()
    }

    fn release(&self, threshold: u64) {
        self.inner.lock().waiters.release(threshold);
    }
}

/// Releases a wait registration when the waiting future finishes or is dropped
struct WaitGuard<'a> {
    state: &'a VaultState,
    threshold: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.state.release(self.threshold);
    }
}
