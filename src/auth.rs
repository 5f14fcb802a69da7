// src/auth.rs
use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::id::{ApiKeyId, WalletId};
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Read,
    Transfer,
    Hold,
    Capture,
    Refund,
    IntentCreate,
    IntentPay,
}

/// Rolling spend ceiling: the sum of committed outgoing available-bucket
/// debits within the window may not exceed the ceiling. Evaluated under the
/// payer account lock, so concurrent requests cannot slip past it.
#[derive(Debug, Clone)]
pub struct SpendLimit {
    pub ceiling: Amount,
    pub window: Duration,
}

/// Caller identity. Token parsing is the adapter's problem; the core sees
/// the resolved key with its wallet, scope set, and optional spend limit.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub wallet: WalletId,
    pub scopes: HashSet<Scope>,
    pub limit: Option<SpendLimit>,
}

impl ApiKey {
    pub fn new(wallet: WalletId, scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self {
            id: ApiKeyId::generate(),
            wallet,
            scopes: scopes.into_iter().collect(),
            limit: None,
        }
    }

    /// A key with every scope and no ceiling, for treasury and test use.
    pub fn unrestricted(wallet: WalletId) -> Self {
        Self::new(
            wallet,
            [
                Scope::Read,
                Scope::Transfer,
                Scope::Hold,
                Scope::Capture,
                Scope::Refund,
                Scope::IntentCreate,
                Scope::IntentPay,
            ],
        )
    }

    pub fn with_limit(mut self, ceiling: Amount, window: Duration) -> Self {
        self.limit = Some(SpendLimit { ceiling, window });
        self
    }

    pub fn require(&self, scope: Scope) -> Result<(), LedgerError> {
        if self.scopes.contains(&scope) {
            Ok(())
        } else {
            Err(LedgerError::ForbiddenScope)
        }
    }
}
