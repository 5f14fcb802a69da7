// src/resolver.rs
use uuid::Uuid;

use crate::account::Account;
use crate::error::LedgerError;
use crate::id::WalletId;
use crate::LedgerStore;

/// How a caller names a payee: a raw wallet id, an `@handle`, or an
/// `ext:`-prefixed external identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientRef {
    Wallet(WalletId),
    Handle(String),
    External(String),
}

impl RecipientRef {
    pub fn parse(input: &str) -> Result<Self, LedgerError> {
        let input = input.trim();
        if let Some(handle) = input.strip_prefix('@') {
            if handle.is_empty() {
                return Err(LedgerError::Validation("empty handle".to_string()));
            }
            return Ok(Self::Handle(handle.to_string()));
        }
        if let Some(external) = input.strip_prefix("ext:") {
            if external.is_empty() {
                return Err(LedgerError::Validation(
                    "empty external reference".to_string(),
                ));
            }
            return Ok(Self::External(external.to_string()));
        }
        match Uuid::parse_str(input) {
            Ok(id) => Ok(Self::Wallet(WalletId(id))),
            Err(_) => Err(LedgerError::Validation(format!(
                "unrecognized recipient: {:?}",
                input
            ))),
        }
    }
}

/// Resolve a recipient reference to the payee's account for the operation
/// currency. Read-only; runs before any account lock is taken.
pub async fn resolve_recipient(
    store: &dyn LedgerStore,
    recipient: &str,
    currency: &str,
) -> Result<Account, LedgerError> {
    let wallet_id = match RecipientRef::parse(recipient)? {
        RecipientRef::Wallet(id) => store
            .get_wallet(id)
            .await?
            .map(|w| w.id)
            .ok_or_else(|| LedgerError::RecipientNotFound(recipient.to_string()))?,
        RecipientRef::Handle(handle) => store
            .find_wallet_by_handle(&handle)
            .await?
            .map(|w| w.id)
            .ok_or_else(|| LedgerError::RecipientNotFound(recipient.to_string()))?,
        RecipientRef::External(external) => store
            .find_wallet_by_external_ref(&external)
            .await?
            .map(|w| w.id)
            .ok_or_else(|| LedgerError::RecipientNotFound(recipient.to_string()))?,
    };

    // One account per wallet in this core; resolve it first, then judge the
    // currency, so a EUR wallet paid in USD reads as a mismatch rather than
    // a missing recipient.
    let account = store
        .accounts_for_wallet(wallet_id)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| LedgerError::RecipientNotFound(recipient.to_string()))?;

    if account.currency.code != currency {
        return Err(LedgerError::CurrencyMismatch {
            expected: currency.to_string(),
            found: account.currency.code.clone(),
        });
    }

    Ok(account)
}
