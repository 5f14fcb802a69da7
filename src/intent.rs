// src/intent.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AccountId, EntryId, IntentId};
use crate::money::{Amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Paid,
    Expired,
    Cancelled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A payee-initiated request that a specific amount be paid to them. Holds
/// no funds; the money moves only when a payer completes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: IntentId,
    pub payee_account: AccountId,
    pub currency: Currency,
    pub amount: Amount,
    pub status: IntentStatus,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub paid_entry: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn new(
        payee_account: AccountId,
        currency: Currency,
        amount: Amount,
        expires_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: IntentId::generate(),
            payee_account,
            currency,
            amount,
            status: IntentStatus::Pending,
            expires_at,
            metadata,
            paid_entry: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn record_payment(&mut self, entry: EntryId) {
        self.status = IntentStatus::Paid;
        self.paid_entry = Some(entry);
    }
}
