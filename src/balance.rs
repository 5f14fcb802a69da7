// src/balance.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::AccountId;
use crate::money::Currency;

/// Derived balance buckets for one account. Sums are signed because system
/// treasury accounts may run negative; user accounts never do (the executor
/// enforces the floor before commit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account: AccountId,
    pub currency: Currency,
    pub available: i64,
    pub held: i64,
    pub total: i64,
    pub as_of: DateTime<Utc>,
}

impl Balance {
    pub fn from_sums(account: AccountId, currency: Currency, available: i64, held: i64) -> Self {
        Self {
            account,
            currency,
            available,
            held,
            total: available + held,
            as_of: Utc::now(),
        }
    }
}
