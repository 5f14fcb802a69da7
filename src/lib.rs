//! # Tallybook
//!
//! Tallybook is the core of a multi-tenant wallet platform: a double-entry
//! ledger engine with idempotent, concurrency-safe money movement. Every
//! monetary operation — transfer, hold, capture, release, intent pay,
//! refund — is an atomic, balanced journal posting. Nothing is deleted.
//! Everything is auditable.
//!
//! ## Guarantees
//!
//! - **The accounting identity holds after every commit.** Per entry,
//!   ∑debits = ∑credits in a single currency; per account, balances are
//!   derived from journal lines, never stored.
//! - **No double-spend.** Mutations on the same account serialize on an
//!   exclusive row lock; locks are taken in ascending account-id order so
//!   two-account operations cannot deadlock.
//! - **At-most-one effect per idempotency key.** Retries replay the
//!   original response byte-for-byte; a reused key with a different body is
//!   rejected.
//! - **Failures are honest.** Business failures roll back the posting and
//!   are snapshotted for replay; transient conflicts are retried with
//!   backoff and never snapshotted.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tallybook::{adapters::MemoryStore, LedgerEngine, NewWallet, Request};
//!
//! let engine = LedgerEngine::new(Box::new(MemoryStore::new()));
//! let (wallet, account) = engine.create_wallet(NewWallet::user("alice", "USD")).await?;
//! let response = engine.submit(&api_key, &key, Request::Transfer { .. }).await?;
//! ```
//!
//! The persistence port is [`LedgerStore`]; ship the Postgres adapter in
//! production and the in-memory adapter in tests.

pub mod account;
pub mod adapters;
pub mod auth;
pub mod balance;
pub mod config;
pub mod entry;
pub mod error;
pub mod executor;
pub mod hold;
pub mod id;
pub mod idempotency;
pub mod intent;
pub mod money;
pub mod posting;
pub mod refund;
pub mod request;
pub mod resolver;

pub use account::{Account, AccountKind, AccountStatus, NewWallet, Wallet};
pub use auth::{ApiKey, Scope, SpendLimit};
pub use balance::Balance;
pub use config::LedgerConfig;
pub use entry::{Bucket, EntryKind, JournalEntry, JournalLine, Side};
pub use error::LedgerError;
pub use executor::LedgerEngine;
pub use hold::{Hold, HoldStatus};
pub use id::{AccountId, ApiKeyId, EntryId, HoldId, IntentId, LineId, RefundId, WalletId};
pub use idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, Outcome, Reservation};
pub use intent::{IntentStatus, PaymentIntent};
pub use money::{Amount, Currency};
pub use refund::{Refund, RefundStatus};
pub use request::{Request, Response};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The persistence contract the core depends on. Callers never issue SQL;
/// every read and write goes through this port or through a [`StoreTx`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Start a transaction with isolation >= read committed. The store must
    /// support exclusive row locks for [`StoreTx::lock_account`].
    async fn begin(&self) -> Result<Box<dyn StoreTx>, LedgerError>;

    // === Read operations (outside any transaction) ===

    async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, LedgerError>;
    async fn find_wallet_by_handle(&self, handle: &str) -> Result<Option<Wallet>, LedgerError>;
    async fn find_wallet_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Wallet>, LedgerError>;
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError>;
    async fn find_account(
        &self,
        wallet: WalletId,
        currency: &str,
    ) -> Result<Option<Account>, LedgerError>;
    async fn accounts_for_wallet(&self, wallet: WalletId) -> Result<Vec<Account>, LedgerError>;
    /// Derived (available, held) sums over all committed lines.
    async fn balance(&self, account: AccountId) -> Result<(i64, i64), LedgerError>;
    async fn get_entry(
        &self,
        id: EntryId,
    ) -> Result<Option<(JournalEntry, Vec<JournalLine>)>, LedgerError>;
    /// Entries touching the account, newest first. `cursor` is an exclusive
    /// upper bound on entry id.
    async fn entries_for_account(
        &self,
        account: AccountId,
        cursor: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, LedgerError>;
    async fn get_hold(&self, id: HoldId) -> Result<Option<Hold>, LedgerError>;
    async fn get_intent(&self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError>;
    async fn get_refund(&self, id: RefundId) -> Result<Option<Refund>, LedgerError>;
    /// Holds past their expiry that still carry a remainder, for the sweeper.
    async fn expired_active_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HoldId>, LedgerError>;

    // === Provisioning ===

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), LedgerError>;
    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError>;
    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<(), LedgerError>;
}

/// One store transaction. Dropping a `StoreTx` without committing rolls it
/// back; all row locks release at commit or rollback.
#[async_trait]
pub trait StoreTx: Send {
    /// Acquire an exclusive lock on the account row. Blocks concurrent
    /// lockers until this transaction ends.
    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// Derived (available, held) as visible inside this transaction: all
    /// committed lines plus this transaction's own pending lines.
    async fn sum_buckets(&mut self, account: AccountId) -> Result<(i64, i64), LedgerError>;

    /// Append an entry with its lines. Rejects unbalanced line sets.
    async fn insert_entry(
        &mut self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), LedgerError>;

    async fn get_hold(&mut self, id: HoldId) -> Result<Option<Hold>, LedgerError>;
    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), LedgerError>;
    async fn update_hold(&mut self, hold: &Hold) -> Result<(), LedgerError>;

    async fn get_intent(&mut self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError>;
    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError>;
    async fn update_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError>;

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), LedgerError>;
    /// Sum of posted refunds linked to the capture entry.
    async fn refunded_total(&mut self, capture: EntryId) -> Result<Amount, LedgerError>;

    /// Sum of available-bucket debits on the account since `since`, for the
    /// rolling spend ceiling. Evaluated under the account lock.
    async fn outgoing_debits_since(
        &mut self,
        account: AccountId,
        since: DateTime<Utc>,
    ) -> Result<i64, LedgerError>;

    async fn idempotency_reserve(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        fingerprint: &str,
    ) -> Result<Reservation, LedgerError>;
    async fn idempotency_complete(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        outcome: &Outcome,
    ) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}
