//! Single-writer mutation actor
//!
//! Every mutation goes through one Tokio task, so at most one mutation runs
//! at a time and each one completes fully before the next starts:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │             HTTP handlers / library callers           │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                VaultHandle (Clone)                    │
//! │         Sends messages to actor mailbox               │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               VaultActor (Single Task)                │
//! │  1. check preconditions against the cache            │
//! │  2. Storage: one WriteBatch (durable)                │
//! │  3. VaultState::commit: cache + counter + wake       │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A rejected request performs no write. The cache and counter only move
//! after the ledger write returned successfully.

use crate::{
    cache::net_deltas,
    metrics::Metrics,
    state::VaultState,
    types::{HolderId, NewEntry, Registration, Rename, Snapshot, ValidationIssue},
    Error, Result, Storage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the vault actor
#[derive(Debug)]
pub enum VaultMessage {
    /// Register a new holder
    Register {
        registration: Registration,
        response: oneshot::Sender<Result<Snapshot>>,
    },

    /// Rename a holder
    Rename {
        rename: Rename,
        response: oneshot::Sender<Result<Snapshot>>,
    },

    /// Post a batch of transactions (all or nothing)
    PostTransactions {
        entries: Vec<NewEntry>,
        /// Problems already found by request validation
        issues: Vec<ValidationIssue>,
        response: oneshot::Sender<Result<Snapshot>>,
    },

    /// Recompute cache and counter from the ledger
    Rebuild {
        response: oneshot::Sender<Result<u64>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that applies mutations
#[derive(Debug)]
pub struct VaultActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Shared cache/counter/waiters
    state: Arc<VaultState>,

    /// Metrics
    metrics: Arc<Metrics>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<VaultMessage>,
}

impl VaultActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        state: Arc<VaultState>,
        metrics: Arc<Metrics>,
        mailbox: mpsc::Receiver<VaultMessage>,
    ) -> Self {
        Self {
            storage,
            state,
            metrics,
            mailbox,
        }
    }

    /// Run the actor event loop until shutdown or until every handle is gone
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let VaultMessage::Shutdown = msg {
                break;
            }
            self.handle_message(msg);
        }

        tracing::info!("Vault writer stopped");
    }

    /// Handle a single message
    fn handle_message(&self, msg: VaultMessage) {
        match msg {
            VaultMessage::Register {
                registration,
                response,
            } => {
                let result = self.timed("register", || self.register(registration));
                let _ = response.send(result);
            }

            VaultMessage::Rename { rename, response } => {
                let result = self.timed("rename", || self.rename(rename));
                let _ = response.send(result);
            }

            VaultMessage::PostTransactions {
                entries,
                issues,
                response,
            } => {
                let result =
                    self.timed("post_transactions", || self.post_transactions(entries, issues));
                let _ = response.send(result);
            }

            VaultMessage::Rebuild { response } => {
                let result = self.state.reload(&self.storage);
                if let Ok(sequence) = result {
                    self.metrics.set_sequence(sequence);
                }
                let _ = response.send(result);
            }

            VaultMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn timed(
        &self,
        kind: &str,
        mutation: impl FnOnce() -> Result<(Snapshot, usize)>,
    ) -> Result<Snapshot> {
        let started = Instant::now();

        match mutation() {
            Ok((snapshot, appended)) => {
                self.metrics.record_mutation(
                    kind,
                    appended,
                    snapshot.sequence,
                    started.elapsed().as_secs_f64(),
                );
                Ok(snapshot)
            }
            Err(err) => {
                match &err {
                    Error::Validation(_) | Error::AlreadyRegistered(_) | Error::UnknownHolder(_) => {
                        tracing::info!(kind, error = %err, "Mutation rejected");
                        self.metrics.record_rejection(kind);
                    }
                    _ => tracing::error!(kind, error = %err, "Mutation failed"),
                }
                Err(err)
            }
        }
    }

    fn register(&self, registration: Registration) -> Result<(Snapshot, usize)> {
        let holder = registration.holder.clone();
        if self.state.contains(&holder) {
            return Err(Error::AlreadyRegistered(holder));
        }

        let appended = self
            .storage
            .append(vec![NewEntry::registration_marker(&registration)])?;

        let snapshot = self.commit(&appended, |cache| {
            cache.apply_registration(&holder);
            Ok(())
        })?;

        tracing::info!(
            holder = %holder,
            by = %registration.actor,
            sequence = snapshot.sequence,
            "Registered ticket holder"
        );

        Ok((snapshot, appended.len()))
    }

    fn rename(&self, rename: Rename) -> Result<(Snapshot, usize)> {
        if !self.state.contains(&rename.from) {
            return Err(Error::UnknownHolder(rename.from));
        }
        if self.state.contains(&rename.to) {
            return Err(Error::AlreadyRegistered(rename.to));
        }

        let (marker, relabelled) = self.storage.rename_subject(
            &rename.from,
            &rename.to,
            NewEntry::rename_marker(&rename),
        )?;

        let snapshot = self.commit(std::slice::from_ref(&marker), |cache| {
            cache.apply_rename(&rename.from, &rename.to)
        })?;

        tracing::info!(
            from = %rename.from,
            to = %rename.to,
            by = %rename.actor,
            relabelled,
            sequence = snapshot.sequence,
            "Renamed ticket holder"
        );

        Ok((snapshot, 1))
    }

    /// `issues` carries what request validation already found; everything is
    /// reported together and nothing is written if the list is not empty.
    fn post_transactions(
        &self,
        entries: Vec<NewEntry>,
        mut issues: Vec<ValidationIssue>,
    ) -> Result<(Snapshot, usize)> {
        if entries.is_empty() {
            issues.push(ValidationIssue::new(None, "transactions", "must not be empty"));
            return Err(Error::Validation(issues));
        }

        // Registered holder -> (balance after the batch, last index touching it)
        let mut projected: BTreeMap<&HolderId, (i128, usize)> = BTreeMap::new();

        for (index, entry) in entries.iter().enumerate() {
            match self.state.balance(&entry.subject) {
                Some(balance) => {
                    let slot = projected
                        .entry(&entry.subject)
                        .or_insert((i128::from(balance), index));
                    slot.0 += i128::from(entry.amount);
                    slot.1 = index;
                }
                None if !has_issue(&issues, index, "who") => {
                    issues.push(ValidationIssue::new(
                        Some(index),
                        "who",
                        format!("{} is not a registered ticket holder", entry.subject),
                    ));
                }
                None => {}
            }
            if entry.amount == 0 {
                issues.push(ValidationIssue::new(Some(index), "amount", "amount must not be zero"));
            }
        }

        for (holder, (balance, index)) in &projected {
            if i64::try_from(*balance).is_err() {
                issues.push(ValidationIssue::new(
                    Some(*index),
                    "amount",
                    format!("balance of {} would overflow", holder),
                ));
            }
        }

        if !issues.is_empty() {
            issues.sort_by_key(|issue| issue.index);
            return Err(Error::Validation(issues));
        }

        let deltas = net_deltas(entries.iter().map(|e| (&e.subject, e.amount)))?;
        let appended = self.storage.append(entries)?;

        let snapshot = self.commit(&appended, |cache| cache.apply_amounts(&deltas))?;

        tracing::info!(
            count = appended.len(),
            adjustments = ?deltas,
            sequence = snapshot.sequence,
            "Adjusted ticket amounts"
        );

        Ok((snapshot, appended.len()))
    }

    /// Advance cache and counter past entries that are already durable.
    ///
    /// A consistency violation here means cache and ledger diverged; the
    /// cache is rebuilt from the ledger before the error is returned.
    fn commit(
        &self,
        appended: &[crate::LedgerEntry],
        apply: impl FnOnce(&mut crate::cache::BalanceCache) -> Result<()>,
    ) -> Result<Snapshot> {
        let committed_sequence = appended.last().map(|e| e.sequence_id).unwrap_or_default();

        match self
            .state
            .commit(appended.len() as u64, committed_sequence, apply)
        {
            Err(Error::ConsistencyViolation(reason)) => {
                tracing::error!(%reason, "Balance cache diverged from ledger, rebuilding");
                if let Err(err) = self.state.reload(&self.storage) {
                    tracing::error!(error = %err, "Rebuild after consistency violation failed");
                }
                Err(Error::ConsistencyViolation(reason))
            }
            other => other,
        }
    }
}

fn has_issue(issues: &[ValidationIssue], index: usize, field: &str) -> bool {
    issues
        .iter()
        .any(|issue| issue.index == Some(index) && issue.field == field)
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct VaultHandle {
    sender: mpsc::Sender<VaultMessage>,
}

impl VaultHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<VaultMessage>) -> Self {
        Self { sender }
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T>>) -> VaultMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register a holder
    pub async fn register(&self, registration: Registration) -> Result<Snapshot> {
        self.call(|response| VaultMessage::Register {
            registration,
            response,
        })
        .await
    }

    /// Rename a holder
    pub async fn rename(&self, rename: Rename) -> Result<Snapshot> {
        self.call(|response| VaultMessage::Rename { rename, response })
            .await
    }

    /// Post a batch of transactions, together with any issues request
    /// validation found in it
    pub async fn post_transactions(
        &self,
        entries: Vec<NewEntry>,
        issues: Vec<ValidationIssue>,
    ) -> Result<Snapshot> {
        self.call(|response| VaultMessage::PostTransactions {
            entries,
            issues,
            response,
        })
        .await
    }

    /// Rebuild cache and counter from the ledger
    pub async fn rebuild(&self) -> Result<u64> {
        self.call(|response| VaultMessage::Rebuild { response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(VaultMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the vault actor
pub fn spawn_vault_actor(
    storage: Arc<Storage>,
    state: Arc<VaultState>,
    metrics: Arc<Metrics>,
    mailbox_capacity: usize,
) -> VaultHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = VaultActor::new(storage, state, metrics, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    VaultHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HolderId;
    use crate::Config;
    use chrono::Utc;

    struct Fixture {
        handle: VaultHandle,
        storage: Arc<Storage>,
        state: Arc<VaultState>,
        _temp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_path_buf();
        config.storage.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let state = Arc::new(VaultState::rebuild(&storage).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let handle = spawn_vault_actor(storage.clone(), state.clone(), metrics, 16);

        Fixture {
            handle,
            storage,
            state,
            _temp: temp_dir,
        }
    }

    fn registration(holder: &str) -> Registration {
        Registration {
            holder: HolderId::new(holder),
            timestamp: Utc::now(),
            actor: "Magda".to_string(),
        }
    }

    fn tx(who: &str, amount: i64) -> NewEntry {
        NewEntry {
            timestamp: Utc::now(),
            actor: "Edward".to_string(),
            subject: HolderId::new(who),
            amount,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let f = fixture();
        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_appends_marker() {
        let f = fixture();

        let snapshot = f.handle.register(registration("Elliot")).await.unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.balance("Elliot"), Some(0));

        let marker = f.storage.get(1).unwrap().unwrap();
        assert_eq!(marker.amount, 0);
        assert_eq!(marker.note.as_deref(), Some("Initial registration"));

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_changes_nothing() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();

        let err = f.handle.register(registration("Elliot")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref h) if h.as_str() == "Elliot"));
        assert_eq!(f.state.sequence(), 1);
        assert_eq!(f.storage.count().unwrap(), 1);

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_batch_is_rejected_whole() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();

        let err = f
            .handle
            .post_transactions(vec![tx("Elliot", 5), tx("Mobley", 3), tx("Elliot", 0)], Vec::new())
            .await
            .unwrap_err();

        match err {
            Error::Validation(issues) => {
                assert_eq!(issues.len(), 2);
                assert_eq!(issues[0].index, Some(1));
                assert_eq!(issues[0].field, "who");
                assert_eq!(issues[1].index, Some(2));
                assert_eq!(issues[1].field, "amount");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(f.storage.count().unwrap(), 1);
        assert_eq!(f.state.snapshot().balance("Elliot"), Some(0));

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let f = fixture();
        let err = f.handle.post_transactions(vec![], Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.state.sequence(), 0);
        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_preconditions() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();
        f.handle.register(registration("Darlene")).await.unwrap();

        let unknown = Rename {
            from: HolderId::new("Tyrell"),
            to: HolderId::new("Ty"),
            timestamp: Utc::now(),
            actor: "Edward".into(),
        };
        assert!(matches!(
            f.handle.rename(unknown).await,
            Err(Error::UnknownHolder(_))
        ));

        let onto_existing = Rename {
            from: HolderId::new("Darlene"),
            to: HolderId::new("Elliot"),
            timestamp: Utc::now(),
            actor: "Edward".into(),
        };
        assert!(matches!(
            f.handle.rename(onto_existing).await,
            Err(Error::AlreadyRegistered(_))
        ));
        assert_eq!(f.storage.count().unwrap(), 2);

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_after_external_write() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();

        // Simulates a write that landed before a crash, without cache update
        f.storage.append(vec![tx("Elliot", 9)]).unwrap();
        assert_eq!(f.state.sequence(), 1);

        let sequence = f.handle.rebuild().await.unwrap();
        assert_eq!(sequence, 2);
        assert_eq!(f.state.snapshot().balance("Elliot"), Some(9));

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_divergence_is_detected_and_repaired() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();
        f.storage.append(vec![tx("Elliot", 9)]).unwrap();

        // Counter is now behind the ledger; the next commit must notice
        let err = f
            .handle
            .post_transactions(vec![tx("Elliot", 1)], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsistencyViolation(_)));

        let snapshot = f.state.snapshot();
        assert_eq!(snapshot.sequence, 3);
        assert_eq!(snapshot.balance("Elliot"), Some(10));

        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflowing_batch_rejected_before_write() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();
        f.handle
            .post_transactions(vec![tx("Elliot", i64::MAX)], Vec::new())
            .await
            .unwrap();

        let err = f
            .handle
            .post_transactions(vec![tx("Elliot", 1)], Vec::new())
            .await
            .unwrap_err();
        match err {
            Error::Validation(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].index, Some(0));
                assert_eq!(issues[0].field, "amount");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(f.storage.count().unwrap(), 2);
        assert_eq!(f.state.sequence(), 2);

        // Offsetting amounts in one batch are judged by their net effect
        let snapshot = f
            .handle
            .post_transactions(vec![tx("Elliot", 1), tx("Elliot", -2)], Vec::new())
            .await
            .unwrap();
        assert_eq!(snapshot.balance("Elliot"), Some(i64::MAX - 1));

        // The writer is still alive
        f.handle.register(registration("Darlene")).await.unwrap();
        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_issues_reported_with_ledger_issues() {
        let f = fixture();
        f.handle.register(registration("Elliot")).await.unwrap();

        let request_issues = vec![
            ValidationIssue::new(Some(2), "by", "must not be empty"),
            ValidationIssue::new(Some(3), "who", "must contain only letters"),
        ];
        let err = f
            .handle
            .post_transactions(
                vec![tx("Elliot", 5), tx("Mobley", 3), tx("Elliot", 0), tx("Mobley2", 1)],
                request_issues,
            )
            .await
            .unwrap_err();

        match err {
            Error::Validation(issues) => {
                let found: Vec<_> = issues
                    .iter()
                    .map(|i| (i.index, i.field.as_str()))
                    .collect();
                assert_eq!(
                    found,
                    vec![
                        (Some(1), "who"),
                        (Some(2), "by"),
                        (Some(2), "amount"),
                        (Some(3), "who"),
                    ]
                );
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(f.storage.count().unwrap(), 1);

        f.handle.shutdown().await.unwrap();
    }
}
