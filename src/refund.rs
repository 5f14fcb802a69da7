// src/refund.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{EntryId, RefundId};
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Posted,
    Failed,
}

/// A reversal posted against a capture entry. The sum of refunds linked to
/// one capture never exceeds the captured amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub capture_entry: EntryId,
    pub amount: Amount,
    pub status: RefundStatus,
    /// The refund's own journal entry.
    pub entry: EntryId,
    pub created_at: DateTime<Utc>,
}

impl Refund {
    pub fn posted(capture_entry: EntryId, amount: Amount, entry: EntryId) -> Self {
        Self {
            id: RefundId::generate(),
            capture_entry,
            amount,
            status: RefundStatus::Posted,
            entry,
            created_at: Utc::now(),
        }
    }
}
