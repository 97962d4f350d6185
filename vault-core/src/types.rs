//! Core types for the vault
//!
//! Field names on the wire follow the public API (`by`, `who`, `id`); the
//! Rust names follow the ledger vocabulary (`actor`, `subject`, `sequence_id`).

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Note written on the marker entry of a registration
pub const REGISTRATION_NOTE: &str = "Initial registration";

/// Ticket holder identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Create new holder ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, used for index keys
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HolderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Persisted ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Sequence id, assigned at append (1-based, dense)
    #[serde(rename = "id")]
    pub sequence_id: u64,

    /// When the movement happened (UTC, whole seconds)
    pub timestamp: DateTime<Utc>,

    /// Who recorded the entry
    #[serde(rename = "by")]
    pub actor: String,

    /// Holder the amount is attributed to (rewritten by renames)
    #[serde(rename = "who")]
    pub subject: HolderId,

    /// Signed amount; zero only for markers
    pub amount: i64,

    /// Free-form note
    pub note: Option<String>,
}

/// Entry to be appended; the store assigns the sequence id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    /// When the movement happened
    pub timestamp: DateTime<Utc>,

    /// Who records the entry
    #[serde(rename = "by")]
    pub actor: String,

    /// Holder the amount is attributed to
    #[serde(rename = "who")]
    pub subject: HolderId,

    /// Signed amount
    pub amount: i64,

    /// Free-form note
    #[serde(default)]
    pub note: Option<String>,
}

impl NewEntry {
    /// Zero-amount marker recording a registration
    pub fn registration_marker(registration: &Registration) -> Self {
        Self {
            timestamp: registration.timestamp,
            actor: registration.actor.clone(),
            subject: registration.holder.clone(),
            amount: 0,
            note: Some(REGISTRATION_NOTE.to_string()),
        }
    }

    /// Zero-amount marker recording a rename, attributed to the new name
    pub fn rename_marker(rename: &Rename) -> Self {
        Self {
            timestamp: rename.timestamp,
            actor: rename.actor.clone(),
            subject: rename.to.clone(),
            amount: 0,
            note: Some(format!("Ticket holder renamed from \"{}\"", rename.from)),
        }
    }

    /// Seal into a persisted entry. Timestamps are truncated to whole seconds.
    pub fn into_entry(self, sequence_id: u64) -> LedgerEntry {
        LedgerEntry {
            sequence_id,
            timestamp: self.timestamp.trunc_subsecs(0),
            actor: self.actor,
            subject: self.subject,
            amount: self.amount,
            note: self.note,
        }
    }
}

/// Intent: register a new holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Holder to register
    pub holder: HolderId,
    /// When
    pub timestamp: DateTime<Utc>,
    /// Who registers
    pub actor: String,
}

/// Intent: rename a holder, relabelling its history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    /// Current name
    pub from: HolderId,
    /// New name
    pub to: HolderId,
    /// When
    pub timestamp: DateTime<Utc>,
    /// Who renames
    pub actor: String,
}

/// Scan direction over the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first
    Ascending,
    /// Newest first
    #[default]
    Descending,
}

/// Consistent view of balances at one point of the sequence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Snapshot {
    /// Holder -> running total
    pub balances: BTreeMap<HolderId, i64>,
    /// Sequence counter the balances correspond to
    pub sequence: u64,
}

impl Snapshot {
    /// Balance of one holder
    pub fn balance(&self, holder: &str) -> Option<i64> {
        self.balances.get(&HolderId::new(holder)).copied()
    }
}

/// One rejected field of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Position in a batch, if the request was a batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Offending field
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl ValidationIssue {
    /// Create new issue
    pub fn new(index: Option<usize>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "[{}].{}: {}", index, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_truncated_not_rounded() {
        let ts = Utc.with_ymd_and_hms(2021, 3, 2, 4, 42, 59).unwrap()
            + chrono::Duration::milliseconds(999);
        let entry = NewEntry {
            timestamp: ts,
            actor: "Edward".into(),
            subject: HolderId::new("Darlene"),
            amount: 500,
            note: None,
        }
        .into_entry(3);

        assert_eq!(entry.sequence_id, 3);
        assert_eq!(entry.timestamp, Utc.with_ymd_and_hms(2021, 3, 2, 4, 42, 59).unwrap());
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = NewEntry {
            timestamp: Utc.with_ymd_and_hms(2021, 3, 2, 4, 43, 0).unwrap(),
            actor: "Magda".into(),
            subject: HolderId::new("Elliot"),
            amount: 5,
            note: Some("Brushed teeth".into()),
        }
        .into_entry(4);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 4,
                "timestamp": "2021-03-02T04:43:00Z",
                "by": "Magda",
                "who": "Elliot",
                "amount": 5,
                "note": "Brushed teeth",
            })
        );
    }

    #[test]
    fn test_new_entry_note_optional() {
        let entry: NewEntry = serde_json::from_str(
            r#"{"timestamp": "2021-03-02T04:41:14Z", "by": "Helen", "who": "Link", "amount": -50}"#,
        )
        .unwrap();
        assert_eq!(entry.note, None);
        assert_eq!(entry.amount, -50);
    }

    #[test]
    fn test_rename_marker_targets_new_name() {
        let rename = Rename {
            from: HolderId::new("Darlene"),
            to: HolderId::new("Dar"),
            timestamp: Utc::now(),
            actor: "Edward".into(),
        };
        let marker = NewEntry::rename_marker(&rename);
        assert_eq!(marker.subject, HolderId::new("Dar"));
        assert_eq!(marker.amount, 0);
        assert_eq!(marker.note.as_deref(), Some("Ticket holder renamed from \"Darlene\""));
    }
}
