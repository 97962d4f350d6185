//! Main vault orchestration layer
//!
//! Ties together storage, the balance state and the writer actor into the
//! API used by the HTTP layer. Mutations go through the actor; reads go to
//! the shared state or straight to storage.
//!
//! # Example
//!
//! ```no_run
//! use vault_core::{types::Registration, Config, HolderId, Vault};
//!
//! #[tokio::main]
//! async fn main() -> vault_core::Result<()> {
//!     let vault = Vault::open(Config::default()).await?;
//!
//!     let snapshot = vault
//!         .register(Registration {
//!             holder: HolderId::new("Elliot"),
//!             timestamp: chrono::Utc::now(),
//!             actor: "Magda".to_string(),
//!         })
//!         .await?;
//!     assert_eq!(snapshot.sequence, 1);
//!
//!     // Resolves once another mutation lands
//!     let next = vault.current_balances(Some(snapshot.sequence)).await;
//!     # let _ = next;
//!
//!     vault.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_vault_actor, VaultHandle},
    metrics::Metrics,
    state::VaultState,
    types::{LedgerEntry, NewEntry, Order, Registration, Rename, Snapshot, ValidationIssue},
    Config, Result, Storage,
};
use std::sync::Arc;

/// Main vault interface
#[derive(Debug)]
pub struct Vault {
    /// Actor handle for mutations
    handle: VaultHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Cache, counter and waiters
    state: Arc<VaultState>,

    /// Metrics
    metrics: Arc<Metrics>,

    /// Configuration
    config: Config,
}

impl Vault {
    /// Open the ledger, rebuild the balance cache from it and start the writer
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let state = Arc::new(VaultState::rebuild(&storage)?);

        let metrics = Arc::new(Metrics::new()?);
        metrics.set_sequence(state.sequence());

        let handle = spawn_vault_actor(
            storage.clone(),
            state.clone(),
            metrics.clone(),
            config.writer.mailbox_capacity,
        );

        Ok(Self {
            handle,
            storage,
            state,
            metrics,
            config,
        })
    }

    /// Configuration the vault was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Mutations

    /// Register a new holder with a zero balance
    pub async fn register(&self, registration: Registration) -> Result<Snapshot> {
        self.handle.register(registration).await
    }

    /// Rename a holder; its history is relabelled
    pub async fn rename(&self, rename: Rename) -> Result<Snapshot> {
        self.handle.rename(rename).await
    }

    /// Post a batch of transactions; all are applied or none
    pub async fn post_transactions(&self, entries: Vec<NewEntry>) -> Result<Snapshot> {
        self.handle.post_transactions(entries, Vec::new()).await
    }

    /// Post a batch that request validation already found `issues` in.
    ///
    /// The batch is still checked against the ledger so the rejection lists
    /// every problem at once; with no problems at all it is applied.
    pub async fn post_transactions_with_issues(
        &self,
        entries: Vec<NewEntry>,
        issues: Vec<ValidationIssue>,
    ) -> Result<Snapshot> {
        self.handle.post_transactions(entries, issues).await
    }

    /// Recompute balances and counter from the ledger
    pub async fn rebuild(&self) -> Result<u64> {
        self.handle.rebuild().await
    }

    // Queries

    /// Balances and counter.
    ///
    /// With a threshold, first waits until the counter exceeds it; the
    /// snapshot is then the one of the mutation that crossed it.
    pub async fn current_balances(&self, threshold: Option<u64>) -> Snapshot {
        match threshold {
            Some(threshold) => {
                if self.state.sequence() <= threshold {
                    self.metrics.record_long_poll();
                }
                self.state.wait_until_greater_than(threshold).await
            }
            None => self.state.snapshot(),
        }
    }

    /// All ledger entries with their sequence ids
    pub fn history(&self, order: Order) -> Result<Vec<LedgerEntry>> {
        self.storage.view()?.entries(order)
    }

    /// Ledger entries together with their count, read from one snapshot.
    ///
    /// The count is the ledger's, which may be ahead of [`sequence`](Self::sequence)
    /// while a mutation is between its write and its cache update.
    pub fn history_with_count(&self, order: Order) -> Result<(u64, Vec<LedgerEntry>)> {
        let view = self.storage.view()?;
        Ok((view.count()?, view.entries(order)?))
    }

    /// Current sequence counter
    pub fn sequence(&self) -> u64 {
        self.state.sequence()
    }

    /// Entry count according to the ledger itself
    pub fn ledger_count(&self) -> Result<u64> {
        self.storage.count()
    }

    /// Callers suspended in a long-poll
    pub fn pending_waiters(&self) -> usize {
        self.state.pending_waiters()
    }

    /// Stop the writer; later mutations fail with a concurrency error
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
