//! Ticket Vault Core
//!
//! Per-holder reward balances derived from an append-only transaction log,
//! with long-polling for the next state change.
//!
//! # Architecture
//!
//! - **Ledger Store**: RocksDB column families, one `WriteBatch` per mutation
//! - **Single Writer**: One actor task applies every mutation in mailbox order
//! - **Materialized View**: In-memory balances rebuilt from a full scan at startup
//! - **Long-Poll**: Per-threshold wait registrations fired by the writer
//!
//! # Invariants
//!
//! - Sequence counter == number of ledger entries == highest sequence id
//! - Cached balance of a holder == Σ(amount) over entries whose subject is that holder
//! - Cache and counter advance only after the ledger write is durably committed
//! - Readers observe whole mutations only, never a partially applied one

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod cache;
pub mod notifier;
pub mod state;
pub mod actor;
pub mod vault;
pub mod validation;
pub mod error;
pub mod config;
pub mod metrics;
pub mod api;

// Re-exports
pub use error::{Error, Result};
pub use types::{HolderId, LedgerEntry, NewEntry, Order, Snapshot, ValidationIssue};
pub use storage::Storage;
pub use vault::Vault;
pub use config::Config;
