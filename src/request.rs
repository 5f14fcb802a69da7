// src/request.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Scope;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::id::{EntryId, HoldId, IntentId, RefundId};
use crate::money::Amount;
use crate::resolver::RecipientRef;

pub const MIN_EXPIRY_SECONDS: u64 = 1;
pub const MAX_EXPIRY_SECONDS: u64 = 86_400;

/// One tagged variant per money-moving operation. The adapter deserializes
/// its wire format into this; everything past this point is typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Transfer {
        to: String,
        amount: Amount,
        currency: String,
        reference: Option<String>,
        metadata: Option<serde_json::Value>,
    },
    HoldCreate {
        amount: Amount,
        currency: String,
        expires_in_seconds: u64,
    },
    HoldCapture {
        hold_id: HoldId,
        to: String,
        /// Defaults to the hold's remaining amount.
        amount: Option<Amount>,
    },
    HoldRelease {
        hold_id: HoldId,
    },
    IntentCreate {
        amount: Amount,
        currency: String,
        expires_in_seconds: u64,
        metadata: Option<serde_json::Value>,
    },
    IntentPay {
        intent_id: IntentId,
    },
    IntentCancel {
        intent_id: IntentId,
    },
    Refund {
        capture_entry_id: EntryId,
        /// Defaults to the capture's remaining refundable amount.
        amount: Option<Amount>,
    },
}

impl Request {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "transfer",
            Self::HoldCreate { .. } => "hold_create",
            Self::HoldCapture { .. } => "hold_capture",
            Self::HoldRelease { .. } => "hold_release",
            Self::IntentCreate { .. } => "intent_create",
            Self::IntentPay { .. } => "intent_pay",
            Self::IntentCancel { .. } => "intent_cancel",
            Self::Refund { .. } => "refund",
        }
    }

    pub fn required_scope(&self) -> Scope {
        match self {
            Self::Transfer { .. } => Scope::Transfer,
            Self::HoldCreate { .. } => Scope::Hold,
            Self::HoldCapture { .. } => Scope::Capture,
            Self::HoldRelease { .. } => Scope::Hold,
            Self::IntentCreate { .. } | Self::IntentCancel { .. } => Scope::IntentCreate,
            Self::IntentPay { .. } => Scope::IntentPay,
            Self::Refund { .. } => Scope::Refund,
        }
    }

    /// Shape-level validation, performed before the idempotency key is
    /// reserved: malformed requests never consume a key.
    pub fn validate(&self, config: &LedgerConfig) -> Result<(), LedgerError> {
        match self {
            Self::Transfer {
                to,
                amount,
                currency,
                reference,
                ..
            } => {
                RecipientRef::parse(to)?;
                require_positive(*amount)?;
                require_currency(config, currency)?;
                if let Some(reference) = reference {
                    if reference.len() > 255 {
                        return Err(LedgerError::Validation(
                            "reference exceeds 255 bytes".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            Self::HoldCreate {
                amount,
                currency,
                expires_in_seconds,
            } => {
                require_positive(*amount)?;
                require_currency(config, currency)?;
                require_expiry(*expires_in_seconds)
            }
            Self::HoldCapture { to, amount, .. } => {
                RecipientRef::parse(to)?;
                if let Some(amount) = amount {
                    require_positive(*amount)?;
                }
                Ok(())
            }
            Self::HoldRelease { .. } => Ok(()),
            Self::IntentCreate {
                amount,
                currency,
                expires_in_seconds,
                ..
            } => {
                require_positive(*amount)?;
                require_currency(config, currency)?;
                require_expiry(*expires_in_seconds)
            }
            Self::IntentPay { .. } | Self::IntentCancel { .. } => Ok(()),
            Self::Refund { amount, .. } => {
                if let Some(amount) = amount {
                    require_positive(*amount)?;
                }
                Ok(())
            }
        }
    }
}

fn require_positive(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_zero() {
        Err(LedgerError::Validation("amount must be positive".to_string()))
    } else {
        Ok(())
    }
}

fn require_currency(config: &LedgerConfig, code: &str) -> Result<(), LedgerError> {
    config
        .currency(code)
        .map(|_| ())
        .ok_or_else(|| LedgerError::Validation(format!("unknown currency: {}", code)))
}

fn require_expiry(seconds: u64) -> Result<(), LedgerError> {
    if (MIN_EXPIRY_SECONDS..=MAX_EXPIRY_SECONDS).contains(&seconds) {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "expires_in_seconds must be within [{}, {}]",
            MIN_EXPIRY_SECONDS, MAX_EXPIRY_SECONDS
        )))
    }
}

/// The response snapshot the adapter serializes back to the client. Stored
/// verbatim in the idempotency record, so replays are byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    Transfer {
        entry_id: EntryId,
    },
    HoldCreate {
        hold_id: HoldId,
        expires_at: DateTime<Utc>,
    },
    HoldCapture {
        entry_id: EntryId,
        remaining: Amount,
    },
    HoldRelease {
        entry_id: EntryId,
    },
    IntentCreate {
        intent_id: IntentId,
        expires_at: DateTime<Utc>,
    },
    IntentPay {
        entry_id: EntryId,
    },
    IntentCancel {
        intent_id: IntentId,
    },
    Refund {
        refund_id: RefundId,
        entry_id: EntryId,
    },
}
