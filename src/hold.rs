// src/hold.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AccountId, EntryId, HoldId};
use crate::money::{Amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    PartiallyCaptured,
    Captured,
    Released,
    Expired,
}

impl HoldStatus {
    /// Captured, Released and Expired are terminal: no further lines may
    /// reference the hold.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Captured | Self::Released | Self::Expired)
    }

    pub fn can_capture(&self) -> bool {
        matches!(self, Self::Active | Self::PartiallyCaptured)
    }
}

/// A reservation of the payer's funds: available moves into the held bucket
/// at creation and leaves it again through captures and a final release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub payer_account: AccountId,
    pub currency: Currency,
    pub amount: Amount,
    /// Uncaptured remainder. 0 < remaining <= amount while the hold is
    /// capturable; zeroed when the hold reaches a terminal state.
    pub remaining: Amount,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// The entry that moved the funds into the held bucket.
    pub entry: EntryId,
}

impl Hold {
    pub fn new(
        payer_account: AccountId,
        currency: Currency,
        amount: Amount,
        expires_at: DateTime<Utc>,
        entry: EntryId,
    ) -> Self {
        Self {
            id: HoldId::generate(),
            payer_account,
            currency,
            amount,
            remaining: amount,
            status: HoldStatus::Active,
            expires_at,
            created_at: Utc::now(),
            entry,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Apply a capture of `amount` minor units. Caller has already verified
    /// the hold is capturable and the amount fits.
    pub fn record_capture(&mut self, amount: Amount) {
        self.remaining = Amount::from_minor_units(
            self.remaining.minor_units().saturating_sub(amount.minor_units()),
        );
        self.status = if self.remaining.is_zero() {
            HoldStatus::Captured
        } else {
            HoldStatus::PartiallyCaptured
        };
    }

    pub fn record_release(&mut self) {
        self.remaining = Amount::ZERO;
        self.status = HoldStatus::Released;
    }

    pub fn record_expiry(&mut self) {
        self.remaining = Amount::ZERO;
        self.status = HoldStatus::Expired;
    }
}
