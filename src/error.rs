// src/error.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{EntryId, HoldId, IntentId};

/// Every failure the ledger core can surface. Adapters map `code()` to their
/// own status space; the enum itself round-trips through serde so failed
/// idempotent requests replay the exact same error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerError {
    Validation(String),
    CurrencyMismatch { expected: String, found: String },
    RecipientNotFound(String),
    InsufficientFunds,
    HoldNotActive(HoldId),
    HoldExpired(HoldId),
    IntentExpired(IntentId),
    IntentAlreadyPaid(IntentId),
    IntentCancelled(IntentId),
    RefundExceedsCapture(EntryId),
    ForbiddenScope,
    LimitExceeded,
    IdempotencyConflict,
    IdempotencyInProgress,
    TransientConflict,
    Timeout,
    Conflict(String),
    Arithmetic,
    Storage(String),
}

impl LedgerError {
    /// Stable wire code, used by adapters for status mapping and by
    /// snapshots for audit.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::RecipientNotFound(_) => "RECIPIENT_NOT_FOUND",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::HoldNotActive(_) => "HOLD_NOT_ACTIVE",
            Self::HoldExpired(_) => "HOLD_EXPIRED",
            Self::IntentExpired(_) => "INTENT_EXPIRED",
            Self::IntentAlreadyPaid(_) => "INTENT_ALREADY_PAID",
            Self::IntentCancelled(_) => "INTENT_CANCELLED",
            Self::RefundExceedsCapture(_) => "REFUND_EXCEEDS_CAPTURE",
            Self::ForbiddenScope => "FORBIDDEN_SCOPE",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyInProgress => "IDEMPOTENCY_IN_PROGRESS",
            Self::TransientConflict => "TRANSIENT_CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::Conflict(_) => "CONFLICT",
            Self::Arithmetic => "ARITHMETIC_ERROR",
            Self::Storage(_) => "STORE_ERROR",
        }
    }

    /// Final business failures: recorded in the idempotency snapshot so a
    /// retry with the same key replays the same failure. Transient,
    /// authorization, and internal failures are never snapshotted.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::CurrencyMismatch { .. }
                | Self::RecipientNotFound(_)
                | Self::InsufficientFunds
                | Self::HoldNotActive(_)
                | Self::HoldExpired(_)
                | Self::IntentExpired(_)
                | Self::IntentAlreadyPaid(_)
                | Self::IntentCancelled(_)
                | Self::RefundExceedsCapture(_)
        )
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation failed: {}", msg),
            Self::CurrencyMismatch { expected, found } => {
                write!(f, "currency mismatch: expected {}, found {}", expected, found)
            }
            Self::RecipientNotFound(recipient) => {
                write!(f, "recipient not found: {}", recipient)
            }
            Self::InsufficientFunds => write!(f, "insufficient available funds"),
            Self::HoldNotActive(id) => write!(f, "hold {} is not active", id),
            Self::HoldExpired(id) => write!(f, "hold {} has expired", id),
            Self::IntentExpired(id) => write!(f, "payment intent {} has expired", id),
            Self::IntentAlreadyPaid(id) => write!(f, "payment intent {} is already paid", id),
            Self::IntentCancelled(id) => write!(f, "payment intent {} is cancelled", id),
            Self::RefundExceedsCapture(id) => {
                write!(f, "refund exceeds remaining refundable amount of capture {}", id)
            }
            Self::ForbiddenScope => write!(f, "caller scope does not permit this operation"),
            Self::LimitExceeded => write!(f, "spend ceiling exceeded for this key"),
            Self::IdempotencyConflict => {
                write!(f, "idempotency key was already used with a different request body")
            }
            Self::IdempotencyInProgress => {
                write!(f, "a request with this idempotency key is still in flight")
            }
            Self::TransientConflict => write!(f, "transient serialization conflict"),
            Self::Timeout => write!(f, "operation deadline expired"),
            Self::Conflict(msg) => write!(f, "conflict: {}", msg),
            Self::Arithmetic => write!(f, "arithmetic overflow"),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}
