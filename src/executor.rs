// src/executor.rs
//! The transaction executor: every money-moving operation runs through
//! [`LedgerEngine::submit`], which reserves the idempotency key, authorizes
//! the caller, locks the touched accounts in ascending id order, validates
//! preconditions against balances derived inside the lock, posts the
//! balanced line set, and commits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::histogram;

use crate::account::{Account, AccountStatus, NewWallet, Wallet};
use crate::auth::ApiKey;
use crate::balance::Balance;
use crate::config::LedgerConfig;
use crate::entry::JournalEntry;
use crate::error::LedgerError;
use crate::hold::Hold;
use crate::id::{AccountId, EntryId};
use crate::idempotency::{self, IdempotencyKey, Outcome, Reservation};
use crate::intent::{IntentStatus, PaymentIntent};
use crate::money::Amount;
use crate::posting;
use crate::refund::Refund;
use crate::request::{Request, Response};
use crate::resolver::resolve_recipient;
use crate::{LedgerStore, StoreTx};

/// Read-only pre-work for one operation: recipient resolution and state
/// lookups, performed before any lock is taken. Everything here is
/// re-validated under the locks.
enum Prep {
    Transfer {
        payer: Account,
        payee: Account,
    },
    HoldCreate {
        payer: Account,
    },
    HoldCapture {
        hold: Hold,
        payee: Account,
    },
    HoldRelease {
        hold: Hold,
    },
    IntentCreate {
        payee: Account,
    },
    IntentPay {
        intent: PaymentIntent,
        payer: Account,
    },
    IntentCancel {
        intent: PaymentIntent,
    },
    Refund {
        capture: JournalEntry,
        captured: Amount,
        refunder: Account,
        recipient: Account,
    },
}

pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn new(store: Box<dyn LedgerStore>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Box<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            store: store.into(),
            config,
        }
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // === Provisioning ===

    /// Create a wallet and its (wallet, currency)-unique account.
    pub async fn create_wallet(&self, spec: NewWallet) -> Result<(Wallet, Account), LedgerError> {
        let currency = self
            .config
            .currency(&spec.currency)
            .ok_or_else(|| LedgerError::Validation(format!("unknown currency: {}", spec.currency)))?;

        if let Some(handle) = &spec.handle {
            if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(LedgerError::Validation(format!(
                    "invalid handle: {:?}",
                    handle
                )));
            }
        }

        let wallet = Wallet::new(spec.handle, spec.external_ref, spec.display_name);
        let account = Account::new(wallet.id, currency, spec.kind);

        self.store.insert_wallet(&wallet).await?;
        self.store.insert_account(&account).await?;
        Ok((wallet, account))
    }

    pub async fn freeze_account(&self, id: AccountId) -> Result<(), LedgerError> {
        self.store.set_account_status(id, AccountStatus::Frozen).await
    }

    pub async fn unfreeze_account(&self, id: AccountId) -> Result<(), LedgerError> {
        self.store.set_account_status(id, AccountStatus::Active).await
    }

    // === Read plane ===

    pub async fn get_balance(&self, caller: &ApiKey) -> Result<Balance, LedgerError> {
        caller.require(crate::auth::Scope::Read)?;
        let account = self.caller_account_any(caller).await?;
        let (available, held) = self.store.balance(account.id).await?;
        Ok(Balance::from_sums(account.id, account.currency, available, held))
    }

    /// Page of entries touching the caller's account, newest first.
    pub async fn list_transactions(
        &self,
        caller: &ApiKey,
        cursor: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        caller.require(crate::auth::Scope::Read)?;
        let limit = limit.clamp(1, self.config.max_page_size);
        let account = self.caller_account_any(caller).await?;
        self.store.entries_for_account(account.id, cursor, limit).await
    }

    // === Write plane ===

    pub async fn submit(
        &self,
        caller: &ApiKey,
        key: &IdempotencyKey,
        request: Request,
    ) -> Result<Response, LedgerError> {
        self.submit_with_deadline(caller, key, request, self.config.operation_deadline)
            .await
    }

    /// Like [`submit`](Self::submit), with an explicit deadline. Past the
    /// deadline the in-flight transaction is dropped (rolled back) and
    /// `Timeout` is surfaced; a committed result is never undone.
    pub async fn submit_with_deadline(
        &self,
        caller: &ApiKey,
        key: &IdempotencyKey,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, LedgerError> {
        // Malformed requests never consume an idempotency key.
        request.validate(&self.config)?;
        let fingerprint = idempotency::fingerprint(caller.id, &request);

        let start = Instant::now();
        let result = match tokio::time::timeout(
            deadline,
            self.run(caller, key, &request, &fingerprint),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        };

        histogram!("tallybook.operation.duration_ms", "op" => request.op_name())
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn run(
        &self,
        caller: &ApiKey,
        key: &IdempotencyKey,
        request: &Request,
        fingerprint: &str,
    ) -> Result<Response, LedgerError> {
        let mut backoff = self.config.retry_backoff;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            match self.attempt(caller, key, request, fingerprint).await {
                // Only store-signaled serialization conflicts are retried;
                // business failures are final.
                Err(LedgerError::TransientConflict) if attempt < self.config.max_retries => {
                    continue;
                }
                Err(LedgerError::TransientConflict) => {
                    tracing::warn!(
                        op = request.op_name(),
                        retries = self.config.max_retries,
                        "serialization conflict persisted past retry budget"
                    );
                    return Err(LedgerError::TransientConflict);
                }
                other => return other,
            }
        }
        Err(LedgerError::TransientConflict)
    }

    async fn attempt(
        &self,
        caller: &ApiKey,
        key: &IdempotencyKey,
        request: &Request,
        fingerprint: &str,
    ) -> Result<Response, LedgerError> {
        let prep = self.prepare(caller, request).await?;

        let mut tx = self.store.begin().await?;
        match tx.idempotency_reserve(caller.id, key, fingerprint).await? {
            Reservation::Fresh => {}
            Reservation::Replay(outcome) => {
                tx.rollback().await?;
                tracing::debug!(op = request.op_name(), key = key.as_str(), "idempotent replay");
                return outcome.into_result();
            }
            Reservation::InProgress => {
                tx.rollback().await?;
                return Err(LedgerError::IdempotencyInProgress);
            }
            Reservation::Conflict => {
                tx.rollback().await?;
                return Err(LedgerError::IdempotencyConflict);
            }
        }

        // Authorization runs after the reserve so its ordering relative to
        // replay detection is deterministic, and before any lock is taken.
        if let Err(err) = caller.require(request.required_scope()) {
            tx.rollback().await?;
            return Err(err);
        }

        match self.execute(tx.as_mut(), caller, key, request, prep).await {
            Ok(response) => {
                tx.idempotency_complete(caller.id, key, &Outcome::Ok(response.clone()))
                    .await?;
                tx.commit().await?;
                Ok(response)
            }
            Err(err) if err.is_final() => {
                // Final failures commit: the transaction carries no posting
                // (aside from materialized hold/intent expiry, which must
                // persist) and the failure snapshot makes retries replay it.
                tx.idempotency_complete(caller.id, key, &Outcome::Err(err.clone()))
                    .await?;
                tx.commit().await?;
                Err(err)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// Read-only resolution and ownership checks, before the transaction.
    async fn prepare(&self, caller: &ApiKey, request: &Request) -> Result<Prep, LedgerError> {
        match request {
            Request::Transfer { to, currency, .. } => {
                let payer = self.caller_account(caller, currency).await?;
                let payee = resolve_recipient(self.store.as_ref(), to, currency).await?;
                if payer.id == payee.id {
                    return Err(LedgerError::Validation(
                        "cannot transfer to the initiating account".to_string(),
                    ));
                }
                Ok(Prep::Transfer { payer, payee })
            }
            Request::HoldCreate { currency, .. } => {
                let payer = self.caller_account(caller, currency).await?;
                Ok(Prep::HoldCreate { payer })
            }
            Request::HoldCapture { hold_id, to, .. } => {
                let hold = self.fetch_hold(*hold_id).await?;
                self.require_account_owner(caller, hold.payer_account).await?;
                let payee =
                    resolve_recipient(self.store.as_ref(), to, &hold.currency.code).await?;
                Ok(Prep::HoldCapture { hold, payee })
            }
            Request::HoldRelease { hold_id } => {
                let hold = self.fetch_hold(*hold_id).await?;
                self.require_account_owner(caller, hold.payer_account).await?;
                Ok(Prep::HoldRelease { hold })
            }
            Request::IntentCreate { currency, .. } => {
                let payee = self.caller_account(caller, currency).await?;
                Ok(Prep::IntentCreate { payee })
            }
            Request::IntentPay { intent_id } => {
                let intent = self.fetch_intent(*intent_id).await?;
                let payee_account = self
                    .store
                    .get_account(intent.payee_account)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Storage(format!("account {} missing", intent.payee_account))
                    })?;
                // The intent's creator must not complete their own intent.
                if payee_account.wallet == caller.wallet {
                    return Err(LedgerError::ForbiddenScope);
                }
                let payer = self.caller_account(caller, &intent.currency.code).await?;
                Ok(Prep::IntentPay { intent, payer })
            }
            Request::IntentCancel { intent_id } => {
                let intent = self.fetch_intent(*intent_id).await?;
                self.require_account_owner(caller, intent.payee_account).await?;
                Ok(Prep::IntentCancel { intent })
            }
            Request::Refund {
                capture_entry_id, ..
            } => {
                let (capture, lines) = self
                    .store
                    .get_entry(*capture_entry_id)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Validation(format!(
                            "capture entry {} not found",
                            capture_entry_id
                        ))
                    })?;
                if capture.kind != crate::entry::EntryKind::Capture {
                    return Err(LedgerError::Validation(format!(
                        "entry {} is not a capture",
                        capture.id
                    )));
                }
                // A capture debits the payer's held bucket and credits the
                // payee's available bucket; the refund reverses the pair.
                let debit = lines
                    .iter()
                    .find(|l| l.side == crate::entry::Side::Debit)
                    .ok_or_else(|| LedgerError::Storage("capture entry has no debit".into()))?;
                let credit = lines
                    .iter()
                    .find(|l| l.side == crate::entry::Side::Credit)
                    .ok_or_else(|| LedgerError::Storage("capture entry has no credit".into()))?;

                let refunder = self.fetch_account(credit.account).await?;
                if refunder.wallet != caller.wallet {
                    return Err(LedgerError::ForbiddenScope);
                }
                let recipient = self.fetch_account(debit.account).await?;
                Ok(Prep::Refund {
                    captured: credit.amount,
                    capture,
                    refunder,
                    recipient,
                })
            }
        }
    }

    async fn execute(
        &self,
        tx: &mut dyn StoreTx,
        caller: &ApiKey,
        key: &IdempotencyKey,
        request: &Request,
        prep: Prep,
    ) -> Result<Response, LedgerError> {
        let key_tag = Some(key.as_str().to_string());
        match (request, prep) {
            (
                Request::Transfer {
                    amount,
                    reference,
                    metadata,
                    ..
                },
                Prep::Transfer { payer, payee },
            ) => {
                let (payer, payee) = lock_ordered(tx, payer.id, payee.id).await?;
                require_active(&payer)?;
                require_active(&payee)?;
                self.enforce_spend_limit(tx, caller, &payer, *amount).await?;
                self.require_available(tx, &payer, *amount).await?;

                let posting = posting::transfer(
                    caller.wallet,
                    &payer,
                    &payee,
                    *amount,
                    reference.clone(),
                    metadata.clone().unwrap_or(serde_json::Value::Null),
                    key_tag,
                )?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;
                Ok(Response::Transfer {
                    entry_id: posting.entry.id,
                })
            }

            (
                Request::HoldCreate {
                    amount,
                    expires_in_seconds,
                    ..
                },
                Prep::HoldCreate { payer },
            ) => {
                let payer = tx.lock_account(payer.id).await?;
                require_active(&payer)?;
                self.enforce_spend_limit(tx, caller, &payer, *amount).await?;
                self.require_available(tx, &payer, *amount).await?;

                let posting = posting::hold_create(caller.wallet, &payer, *amount, key_tag)?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;

                let expires_at =
                    Utc::now() + chrono::Duration::seconds(*expires_in_seconds as i64);
                let hold = Hold::new(
                    payer.id,
                    payer.currency.clone(),
                    *amount,
                    expires_at,
                    posting.entry.id,
                );
                tx.insert_hold(&hold).await?;
                Ok(Response::HoldCreate {
                    hold_id: hold.id,
                    expires_at,
                })
            }

            (Request::HoldCapture { amount, .. }, Prep::HoldCapture { hold, payee }) => {
                let (payer, payee) = lock_ordered(tx, hold.payer_account, payee.id).await?;
                // Authoritative re-read now that the payer lock serializes
                // all operations on this hold.
                let mut hold = tx
                    .get_hold(hold.id)
                    .await?
                    .ok_or(LedgerError::HoldNotActive(hold.id))?;

                self.check_hold_open(tx, &payer, &mut hold).await?;

                let capture_amount = (*amount).unwrap_or(hold.remaining);
                if capture_amount > hold.remaining {
                    return Err(LedgerError::Validation(format!(
                        "capture of {} exceeds hold remaining {}",
                        capture_amount, hold.remaining
                    )));
                }
                require_active(&payer)?;
                require_active(&payee)?;

                let posting =
                    posting::hold_capture(caller.wallet, &hold, &payee, capture_amount, key_tag)?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;

                hold.record_capture(capture_amount);
                tx.update_hold(&hold).await?;
                Ok(Response::HoldCapture {
                    entry_id: posting.entry.id,
                    remaining: hold.remaining,
                })
            }

            (Request::HoldRelease { .. }, Prep::HoldRelease { hold }) => {
                let payer = tx.lock_account(hold.payer_account).await?;
                let mut hold = tx
                    .get_hold(hold.id)
                    .await?
                    .ok_or(LedgerError::HoldNotActive(hold.id))?;

                self.check_hold_open(tx, &payer, &mut hold).await?;

                let posting =
                    posting::hold_release(caller.wallet, &hold, hold.remaining, key_tag)?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;

                hold.record_release();
                tx.update_hold(&hold).await?;
                Ok(Response::HoldRelease {
                    entry_id: posting.entry.id,
                })
            }

            (
                Request::IntentCreate {
                    amount,
                    expires_in_seconds,
                    metadata,
                    ..
                },
                Prep::IntentCreate { payee },
            ) => {
                // No money moves at creation; no locks needed.
                let expires_at =
                    Utc::now() + chrono::Duration::seconds(*expires_in_seconds as i64);
                let intent = PaymentIntent::new(
                    payee.id,
                    payee.currency.clone(),
                    *amount,
                    expires_at,
                    metadata.clone().unwrap_or(serde_json::Value::Null),
                );
                tx.insert_intent(&intent).await?;
                Ok(Response::IntentCreate {
                    intent_id: intent.id,
                    expires_at,
                })
            }

            (Request::IntentPay { .. }, Prep::IntentPay { intent, payer }) => {
                let (payer, payee) =
                    lock_ordered(tx, payer.id, intent.payee_account).await?;
                let mut intent = tx
                    .get_intent(intent.id)
                    .await?
                    .ok_or_else(|| LedgerError::Validation("intent not found".to_string()))?;

                self.check_intent_pending(tx, &mut intent).await?;
                require_active(&payer)?;
                require_active(&payee)?;
                self.enforce_spend_limit(tx, caller, &payer, intent.amount).await?;
                self.require_available(tx, &payer, intent.amount).await?;

                let posting = posting::intent_pay(
                    caller.wallet,
                    &payer,
                    &payee,
                    intent.amount,
                    intent.metadata.clone(),
                    key_tag,
                )?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;

                intent.record_payment(posting.entry.id);
                tx.update_intent(&intent).await?;
                Ok(Response::IntentPay {
                    entry_id: posting.entry.id,
                })
            }

            (Request::IntentCancel { .. }, Prep::IntentCancel { intent }) => {
                tx.lock_account(intent.payee_account).await?;
                let mut intent = tx
                    .get_intent(intent.id)
                    .await?
                    .ok_or_else(|| LedgerError::Validation("intent not found".to_string()))?;

                self.check_intent_pending(tx, &mut intent).await?;
                intent.status = IntentStatus::Cancelled;
                tx.update_intent(&intent).await?;
                Ok(Response::IntentCancel {
                    intent_id: intent.id,
                })
            }

            (
                Request::Refund { amount, .. },
                Prep::Refund {
                    capture,
                    captured,
                    refunder,
                    recipient,
                },
            ) => {
                let (refunder, recipient) =
                    lock_ordered(tx, refunder.id, recipient.id).await?;

                // Re-summed under the refunder lock: concurrent refunds of
                // the same capture serialize here.
                let prior = tx.refunded_total(capture.id).await?;
                let refundable = captured.checked_sub(prior).unwrap_or(Amount::ZERO);
                let refund_amount = (*amount).unwrap_or(refundable);
                if refund_amount.is_zero() || refund_amount > refundable {
                    return Err(LedgerError::RefundExceedsCapture(capture.id));
                }

                require_active(&refunder)?;
                require_active(&recipient)?;
                self.enforce_spend_limit(tx, caller, &refunder, refund_amount).await?;
                self.require_available(tx, &refunder, refund_amount).await?;

                let posting = posting::refund(
                    caller.wallet,
                    &capture,
                    &refunder,
                    &recipient,
                    refund_amount,
                    key_tag,
                )?;
                tx.insert_entry(&posting.entry, &posting.lines).await?;

                let refund = Refund::posted(capture.id, refund_amount, posting.entry.id);
                tx.insert_refund(&refund).await?;
                Ok(Response::Refund {
                    refund_id: refund.id,
                    entry_id: posting.entry.id,
                })
            }

            // prepare() and execute() are driven by the same request value.
            _ => Err(LedgerError::Storage("request/prep mismatch".to_string())),
        }
    }

    // === Maintenance ===

    /// Materialize expiry for holds past their deadline. Lazy expiry on
    /// access makes this optional; running it keeps held balances tidy.
    pub async fn sweep_expired_holds(&self, limit: u32) -> Result<u32, LedgerError> {
        let now = Utc::now();
        let due = self.store.expired_active_holds(now, limit).await?;
        let mut swept = 0;

        for hold_id in due {
            let Some(hold) = self.store.get_hold(hold_id).await? else {
                continue;
            };
            let mut tx = self.store.begin().await?;
            let payer = tx.lock_account(hold.payer_account).await?;
            // Re-read under the lock; another request may have expired or
            // captured it meanwhile.
            let Some(mut hold) = tx.get_hold(hold_id).await? else {
                tx.rollback().await?;
                continue;
            };
            if hold.status.is_terminal() || !hold.is_expired(now) || hold.remaining.is_zero() {
                tx.rollback().await?;
                continue;
            }
            self.expire_hold(tx.as_mut(), &payer, &mut hold).await?;
            tx.commit().await?;
            swept += 1;
        }

        Ok(swept)
    }

    // === Helpers ===

    async fn caller_account_any(&self, caller: &ApiKey) -> Result<Account, LedgerError> {
        self.store
            .accounts_for_wallet(caller.wallet)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                LedgerError::Validation(format!("wallet {} has no account", caller.wallet))
            })
    }

    /// The caller's account, which must carry the operation currency.
    async fn caller_account(&self, caller: &ApiKey, currency: &str) -> Result<Account, LedgerError> {
        let account = self.caller_account_any(caller).await?;
        if account.currency.code != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: currency.to_string(),
                found: account.currency.code.clone(),
            });
        }
        Ok(account)
    }

    async fn fetch_hold(&self, id: crate::id::HoldId) -> Result<Hold, LedgerError> {
        self.store
            .get_hold(id)
            .await?
            .ok_or_else(|| LedgerError::Validation(format!("hold {} not found", id)))
    }

    async fn fetch_intent(
        &self,
        id: crate::id::IntentId,
    ) -> Result<PaymentIntent, LedgerError> {
        self.store
            .get_intent(id)
            .await?
            .ok_or_else(|| LedgerError::Validation(format!("intent {} not found", id)))
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| LedgerError::Storage(format!("account {} missing", id)))
    }

    async fn require_account_owner(
        &self,
        caller: &ApiKey,
        account: AccountId,
    ) -> Result<(), LedgerError> {
        let account = self.fetch_account(account).await?;
        if account.wallet != caller.wallet {
            return Err(LedgerError::ForbiddenScope);
        }
        Ok(())
    }

    /// Sufficient-funds check under the payer lock. System accounts may run
    /// negative; user accounts never do.
    async fn require_available(
        &self,
        tx: &mut dyn StoreTx,
        payer: &Account,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if payer.is_system() {
            return Ok(());
        }
        let (available, _) = tx.sum_buckets(payer.id).await?;
        if available < amount.minor_units() as i64 {
            return Err(LedgerError::InsufficientFunds);
        }
        Ok(())
    }

    /// Rolling spend ceiling, evaluated under the payer lock so concurrent
    /// requests cannot slip past it together.
    async fn enforce_spend_limit(
        &self,
        tx: &mut dyn StoreTx,
        caller: &ApiKey,
        payer: &Account,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let Some(limit) = &caller.limit else {
            return Ok(());
        };
        let since = Utc::now() - chrono::Duration::seconds(limit.window.as_secs() as i64);
        let spent = tx.outgoing_debits_since(payer.id, since).await?.max(0) as u64;
        if spent.saturating_add(amount.minor_units()) > limit.ceiling.minor_units() {
            return Err(LedgerError::LimitExceeded);
        }
        Ok(())
    }

    /// Lazy expiry: if the hold's deadline has passed with a remainder
    /// outstanding, post the release now and report the expiry. The caller
    /// commits this transaction even though the operation itself fails.
    async fn check_hold_open(
        &self,
        tx: &mut dyn StoreTx,
        payer: &Account,
        hold: &mut Hold,
    ) -> Result<(), LedgerError> {
        match hold.status {
            s if s.is_terminal() => {
                if s == crate::hold::HoldStatus::Expired {
                    Err(LedgerError::HoldExpired(hold.id))
                } else {
                    Err(LedgerError::HoldNotActive(hold.id))
                }
            }
            _ if hold.is_expired(Utc::now()) => {
                self.expire_hold(tx, payer, hold).await?;
                Err(LedgerError::HoldExpired(hold.id))
            }
            _ => Ok(()),
        }
    }

    async fn expire_hold(
        &self,
        tx: &mut dyn StoreTx,
        payer: &Account,
        hold: &mut Hold,
    ) -> Result<(), LedgerError> {
        let posting = posting::hold_release(payer.wallet, hold, hold.remaining, None)?;
        tx.insert_entry(&posting.entry, &posting.lines).await?;
        hold.record_expiry();
        tx.update_hold(hold).await?;
        tracing::debug!(hold = %hold.id, "materialized lazy hold expiry");
        Ok(())
    }

    /// Lazy intent expiry: past-deadline intents flip to Expired on access.
    /// No lines to post; intents hold no funds.
    async fn check_intent_pending(
        &self,
        tx: &mut dyn StoreTx,
        intent: &mut PaymentIntent,
    ) -> Result<(), LedgerError> {
        match intent.status {
            IntentStatus::Paid => Err(LedgerError::IntentAlreadyPaid(intent.id)),
            IntentStatus::Cancelled => Err(LedgerError::IntentCancelled(intent.id)),
            IntentStatus::Expired => Err(LedgerError::IntentExpired(intent.id)),
            IntentStatus::Pending if intent.is_expired(Utc::now()) => {
                intent.status = IntentStatus::Expired;
                tx.update_intent(intent).await?;
                Err(LedgerError::IntentExpired(intent.id))
            }
            IntentStatus::Pending => Ok(()),
        }
    }
}

fn require_active(account: &Account) -> Result<(), LedgerError> {
    if account.is_active() {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "account {} is frozen",
            account.id
        )))
    }
}

/// Lock both accounts in ascending id order, returning them in call order.
/// The total order over account ids is what makes two-account operations
/// deadlock-free.
async fn lock_ordered(
    tx: &mut dyn StoreTx,
    first: AccountId,
    second: AccountId,
) -> Result<(Account, Account), LedgerError> {
    if first == second {
        let account = tx.lock_account(first).await?;
        return Ok((account.clone(), account));
    }
    if first < second {
        let a = tx.lock_account(first).await?;
        let b = tx.lock_account(second).await?;
        Ok((a, b))
    } else {
        let b = tx.lock_account(second).await?;
        let a = tx.lock_account(first).await?;
        Ok((a, b))
    }
}
