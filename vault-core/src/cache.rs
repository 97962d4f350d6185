//! In-memory balance view over the ledger
//!
//! Every `apply_*` checks all of its preconditions before touching the map,
//! so a failed call leaves the cache unchanged. A failed precondition means
//! the cache no longer matches the ledger and is reported as a
//! [`Error::ConsistencyViolation`].

use crate::{
    error::{Error, Result},
    types::{HolderId, Order},
    Storage,
};
use std::collections::BTreeMap;

/// Holder -> running total
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceCache {
    totals: BTreeMap<HolderId, i64>,
}

impl BalanceCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute totals from a full ledger scan.
    ///
    /// Returns the cache and the number of entries scanned.
    pub fn rebuild(storage: &Storage) -> Result<(Self, u64)> {
        let mut totals: BTreeMap<HolderId, i64> = BTreeMap::new();
        let mut scanned = 0u64;

        for entry in storage.scan(Order::Ascending)? {
            let entry = entry?;
            scanned += 1;

            if entry.sequence_id != scanned {
                return Err(Error::ConsistencyViolation(format!(
                    "Ledger gap: expected sequence id {}, found {}",
                    scanned, entry.sequence_id
                )));
            }

            let total = totals.entry(entry.subject).or_insert(0);
            *total = total.checked_add(entry.amount).ok_or_else(|| {
                Error::ConsistencyViolation(format!(
                    "Balance overflow at sequence id {}",
                    entry.sequence_id
                ))
            })?;
        }

        Ok((Self { totals }, scanned))
    }

    /// Whether the holder has any entries
    pub fn contains(&self, holder: &HolderId) -> bool {
        self.totals.contains_key(holder)
    }

    /// Balance of one holder
    pub fn get(&self, holder: &HolderId) -> Option<i64> {
        self.totals.get(holder).copied()
    }

    /// Number of holders
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    /// No holders yet
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Σ of all totals, widened so it cannot overflow
    pub fn sum(&self) -> i128 {
        self.totals.values().map(|total| i128::from(*total)).sum()
    }

    /// Copy of the mapping
    pub fn to_map(&self) -> BTreeMap<HolderId, i64> {
        self.totals.clone()
    }

    /// Insert `holder` at zero. No-op when already present; callers check
    /// [`contains`](Self::contains) first to report a domain error instead.
    pub fn apply_registration(&mut self, holder: &HolderId) {
        self.totals.entry(holder.clone()).or_insert(0);
    }

    /// Move the total of `from` to `to`
    pub fn apply_rename(&mut self, from: &HolderId, to: &HolderId) -> Result<()> {
        if self.totals.contains_key(to) {
            return Err(Error::ConsistencyViolation(format!(
                "Rename target {} already cached",
                to
            )));
        }

        let total = self.totals.remove(from).ok_or_else(|| {
            Error::ConsistencyViolation(format!("Rename source {} not cached", from))
        })?;
        self.totals.insert(to.clone(), total);

        Ok(())
    }

    /// Add each signed delta to an existing holder.
    ///
    /// Every new total is computed before any is stored; an unknown holder
    /// or a total outside `i64` leaves the cache untouched.
    pub fn apply_amounts(&mut self, deltas: &BTreeMap<HolderId, i64>) -> Result<()> {
        let mut updated = Vec::with_capacity(deltas.len());
        for (holder, delta) in deltas {
            let total = self.totals.get(holder).ok_or_else(|| {
                Error::ConsistencyViolation(format!("Delta for uncached holder {}", holder))
            })?;
            let total = total.checked_add(*delta).ok_or_else(|| {
                Error::ConsistencyViolation(format!("Balance overflow for {}", holder))
            })?;
            updated.push((holder, total));
        }

        for (holder, total) in updated {
            self.totals.insert(holder.clone(), total);
        }

        Ok(())
    }
}

/// Net signed delta per holder; independent of entry order.
///
/// Sums are widened while accumulating, so only a net delta that does not
/// fit an `i64` is an error, whatever the order of the amounts.
pub fn net_deltas<'a>(
    amounts: impl IntoIterator<Item = (&'a HolderId, i64)>,
) -> Result<BTreeMap<HolderId, i64>> {
    let mut wide: BTreeMap<&HolderId, i128> = BTreeMap::new();
    for (holder, amount) in amounts {
        *wide.entry(holder).or_insert(0) += i128::from(amount);
    }

    wide.into_iter()
        .map(|(holder, delta)| {
            i64::try_from(delta)
                .map(|delta| (holder.clone(), delta))
                .map_err(|_| Error::invalid("amount", format!("net amount for {} overflows", holder)))
        })
        .collect()
}
