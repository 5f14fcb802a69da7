// src/account.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AccountId, WalletId};
use crate::money::Currency;

/// Owner-level record. A wallet may own one account per currency; in this
/// core, exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    /// Globally unique among non-null handles, addressed as `@handle`.
    pub handle: Option<String>,
    /// External identifier, addressed as `ext:<ref>`.
    pub external_ref: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(
        handle: Option<String>,
        external_ref: Option<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: WalletId::generate(),
            handle,
            external_ref,
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    User,
    /// Treasury accounts. Funds enter the ledger as transfers out of a
    /// system account, so system accounts are exempt from the non-negative
    /// available floor.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Frozen,
}

/// One ledger account per (wallet, currency). Balances are never stored on
/// the account row; they are derived from journal lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub wallet: WalletId,
    pub currency: Currency,
    pub kind: AccountKind,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

/// Provisioning request for a wallet plus its account.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub handle: Option<String>,
    pub external_ref: Option<String>,
    pub display_name: String,
    pub currency: String,
    pub kind: AccountKind,
}

impl NewWallet {
    pub fn user(handle: &str, currency: &str) -> Self {
        Self {
            handle: Some(handle.to_string()),
            external_ref: None,
            display_name: handle.to_string(),
            currency: currency.to_string(),
            kind: AccountKind::User,
        }
    }

    /// A treasury wallet: transfers out of it put money into circulation.
    pub fn system(display_name: &str, currency: &str) -> Self {
        Self {
            handle: None,
            external_ref: None,
            display_name: display_name.to_string(),
            currency: currency.to_string(),
            kind: AccountKind::System,
        }
    }

    pub fn with_external_ref(mut self, external_ref: &str) -> Self {
        self.external_ref = Some(external_ref.to_string());
        self
    }
}

impl Account {
    pub fn new(wallet: WalletId, currency: Currency, kind: AccountKind) -> Self {
        Self {
            id: AccountId::generate(),
            wallet,
            currency,
            kind,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, AccountStatus::Active)
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, AccountKind::System)
    }
}
