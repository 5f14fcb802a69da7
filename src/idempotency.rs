// src/idempotency.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::id::ApiKeyId;
use crate::request::{Request, Response};

/// Client-supplied idempotency token, canonicalized at the boundary.
/// Scoped to the api key that presented it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LEN: usize = 255;

    pub fn new(raw: &str) -> Result<Self, LedgerError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(LedgerError::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if key.len() > Self::MAX_LEN {
            return Err(LedgerError::Validation(format!(
                "idempotency key exceeds {} bytes",
                Self::MAX_LEN
            )));
        }
        if !key.chars().all(|c| c.is_ascii_graphic()) {
            return Err(LedgerError::Validation(
                "idempotency key must be printable ascii".to_string(),
            ));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// blake3 over the key scope and the canonical request body. Two calls with
/// the same key but different bodies produce different fingerprints, which
/// the reserve step reports as a conflict.
pub fn fingerprint(api_key: ApiKeyId, request: &Request) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(api_key.0.as_bytes());
    // serde_json orders map keys deterministically, so equal bodies hash
    // equal regardless of how the client ordered its metadata.
    let body = serde_json::to_vec(request).unwrap_or_default();
    hasher.update(&body);
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InFlight,
    Completed,
    Failed,
}

/// The recorded outcome of a completed operation: the exact response the
/// adapter returned, or the final error it surfaced. Replays round-trip
/// through this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Response),
    Err(LedgerError),
}

impl Outcome {
    pub fn status(&self) -> IdempotencyStatus {
        match self {
            Self::Ok(_) => IdempotencyStatus::Completed,
            Self::Err(_) => IdempotencyStatus::Failed,
        }
    }

    pub fn into_result(self) -> Result<Response, LedgerError> {
        match self {
            Self::Ok(response) => Ok(response),
            Self::Err(err) => Err(err),
        }
    }
}

/// One row per (api-key, key). Immutable once completed or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub api_key: ApiKeyId,
    pub key: IdempotencyKey,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub snapshot: Option<Outcome>,
    pub created_at: DateTime<Utc>,
}

/// What the store reports when an operation reserves its key.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// No prior record; an in-flight record now exists inside the caller's
    /// transaction.
    Fresh,
    /// Same fingerprint, already completed or failed: return the snapshot
    /// without re-executing.
    Replay(Outcome),
    /// Same fingerprint, still in flight elsewhere.
    InProgress,
    /// Key reused with a different request body.
    Conflict,
}
