//! Request validation at the API boundary
//!
//! Turns request payloads into intents for the writer. Every problem in a
//! request is reported, not just the first one. Whether a holder is
//! registered, and what a batch does to balances, is checked by the writer;
//! batch issues found here travel with the batch so both are reported in
//! one response.

use crate::{
    error::{Error, Result},
    types::{HolderId, NewEntry, Registration, Rename, ValidationIssue},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Body of a registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationBody {
    /// When
    pub timestamp: DateTime<Utc>,
    /// Who registers
    pub by: String,
}

/// Body of a rename request
#[derive(Debug, Clone, Deserialize)]
pub struct RenameBody {
    /// When
    pub timestamp: DateTime<Utc>,
    /// Who renames
    pub by: String,
    /// New name
    pub to: String,
}

/// Holder ids are non-empty runs of ASCII letters
pub fn check_holder_id(index: Option<usize>, field: &str, id: &str) -> Option<ValidationIssue> {
    if id.is_empty() {
        Some(ValidationIssue::new(index, field, "must not be empty"))
    } else if !id.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(ValidationIssue::new(index, field, "must contain only letters"))
    } else {
        None
    }
}

fn check_not_empty(index: Option<usize>, field: &str, value: &str) -> Option<ValidationIssue> {
    value
        .trim()
        .is_empty()
        .then(|| ValidationIssue::new(index, field, "must not be empty"))
}

fn finish<T>(issues: Vec<ValidationIssue>, intent: T) -> Result<T> {
    if issues.is_empty() {
        Ok(intent)
    } else {
        Err(Error::Validation(issues))
    }
}

/// Validate a registration of `who`
pub fn registration(who: &str, body: RegistrationBody) -> Result<Registration> {
    let issues: Vec<_> = [
        check_holder_id(None, "who", who),
        check_not_empty(None, "by", &body.by),
    ]
    .into_iter()
    .flatten()
    .collect();

    finish(
        issues,
        Registration {
            holder: HolderId::new(who),
            timestamp: body.timestamp,
            actor: body.by,
        },
    )
}

/// Validate a rename of `who`
pub fn rename(who: &str, body: RenameBody) -> Result<Rename> {
    let issues: Vec<_> = [
        check_holder_id(None, "who", who),
        check_not_empty(None, "by", &body.by),
        check_holder_id(None, "to", &body.to),
    ]
    .into_iter()
    .flatten()
    .collect();

    finish(
        issues,
        Rename {
            from: HolderId::new(who),
            to: HolderId::new(body.to),
            timestamp: body.timestamp,
            actor: body.by,
        },
    )
}

/// Shape problems of a transaction batch, with the index of each entry
pub fn transaction_issues(batch: &[NewEntry]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (index, entry) in batch.iter().enumerate() {
        issues.extend(check_not_empty(Some(index), "by", &entry.actor));
        issues.extend(check_holder_id(Some(index), "who", entry.subject.as_str()));
    }
    issues
}
