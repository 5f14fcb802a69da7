// src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::id::{AccountId, EntryId, LineId, WalletId};
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Transfer,
    Hold,
    Capture,
    Release,
    Refund,
    IntentPay,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Hold => "hold",
            Self::Capture => "capture",
            Self::Release => "release",
            Self::Refund => "refund",
            Self::IntentPay => "intent_pay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Debit,
    Credit,
}

/// Balance bucket a line posts against. Buckets attach to lines, not
/// accounts: a hold moves value from an account's available bucket into the
/// same account's held bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Available,
    Held,
}

/// One side of a posting. Belongs to exactly one entry; amount is always a
/// positive quantity of the entry's currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub id: LineId,
    pub entry: EntryId,
    pub account: AccountId,
    pub side: Side,
    pub amount: Amount,
    pub bucket: Bucket,
}

impl JournalLine {
    pub fn new(entry: EntryId, account: AccountId, side: Side, amount: Amount, bucket: Bucket) -> Self {
        Self {
            id: LineId::generate(),
            entry,
            account,
            side,
            amount,
            bucket,
        }
    }
}

/// An atomic, balanced posting. Entries are append-only: once committed they
/// are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub initiator: WalletId,
    pub currency: String,
    pub reference: Option<String>,
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Back-link: capture → hold entry, release → hold entry,
    /// refund → capture entry.
    pub linked_entry: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(kind: EntryKind, initiator: WalletId, currency: &str) -> Self {
        Self {
            id: EntryId::generate(),
            kind,
            initiator,
            currency: currency.to_string(),
            reference: None,
            metadata: serde_json::Value::Null,
            idempotency_key: None,
            linked_entry: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_link(mut self, linked: EntryId) -> Self {
        self.linked_entry = Some(linked);
        self
    }
}

/// The accounting identity, enforced at the insert boundary: every line
/// positive, every line belonging to the entry, and ∑debits = ∑credits.
pub fn check_balanced(entry: &JournalEntry, lines: &[JournalLine]) -> Result<(), LedgerError> {
    if lines.is_empty() {
        return Err(LedgerError::Validation("entry has no lines".to_string()));
    }

    let mut debits = Amount::ZERO;
    let mut credits = Amount::ZERO;
    for line in lines {
        if line.entry != entry.id {
            return Err(LedgerError::Validation(format!(
                "line {} does not belong to entry {}",
                line.id, entry.id
            )));
        }
        if line.amount.is_zero() {
            return Err(LedgerError::Validation(format!(
                "line {} has zero amount",
                line.id
            )));
        }
        match line.side {
            Side::Debit => debits = debits.checked_add(line.amount)?,
            Side::Credit => credits = credits.checked_add(line.amount)?,
        }
    }

    if debits != credits {
        return Err(LedgerError::Validation(format!(
            "entry {} is unbalanced: debits {} != credits {}",
            entry.id, debits, credits
        )));
    }

    Ok(())
}
