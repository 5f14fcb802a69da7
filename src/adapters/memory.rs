// src/adapters/memory.rs
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::account::{Account, AccountStatus, Wallet};
use crate::entry::{Bucket, JournalEntry, JournalLine, Side};
use crate::error::LedgerError;
use crate::hold::Hold;
use crate::id::{AccountId, ApiKeyId, EntryId, HoldId, IntentId, RefundId, WalletId};
use crate::idempotency::{
    IdempotencyKey, IdempotencyRecord, IdempotencyStatus, Outcome, Reservation,
};
use crate::intent::PaymentIntent;
use crate::money::Amount;
use crate::refund::{Refund, RefundStatus};
use crate::{LedgerStore, StoreTx};

#[derive(Default, Clone)]
struct MemState {
    wallets: HashMap<WalletId, Wallet>,
    accounts: HashMap<AccountId, Account>,
    // BTreeMap keeps entries in id order; v7 ids make that commit order,
    // which pagination walks backwards.
    entries: BTreeMap<EntryId, JournalEntry>,
    lines: Vec<JournalLine>,
    holds: HashMap<HoldId, Hold>,
    intents: HashMap<IntentId, PaymentIntent>,
    refunds: HashMap<RefundId, Refund>,
    idempotency: HashMap<(ApiKeyId, String), IdempotencyRecord>,
}

fn bucket_sums(state: &MemState, account: AccountId) -> (i64, i64) {
    let mut available = 0i64;
    let mut held = 0i64;
    for line in state.lines.iter().filter(|l| l.account == account) {
        let signed = match line.side {
            Side::Credit => line.amount.minor_units() as i64,
            Side::Debit => -(line.amount.minor_units() as i64),
        };
        match line.bucket {
            Bucket::Available => available += signed,
            Bucket::Held => held += signed,
        }
    }
    (available, held)
}

/// In-memory store for tests and examples. A transaction takes the single
/// state mutex for its whole lifetime — the in-memory equivalent of
/// BEGIN / SELECT FOR UPDATE / COMMIT — and mutates a scratch copy that is
/// published at commit, so rollback is just dropping the copy.
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, LedgerError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemTx { guard, work }))
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.state.lock().await.wallets.get(&id).cloned())
    }

    async fn find_wallet_by_handle(&self, handle: &str) -> Result<Option<Wallet>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .wallets
            .values()
            .find(|w| w.handle.as_deref() == Some(handle))
            .cloned())
    }

    async fn find_wallet_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .wallets
            .values()
            .find(|w| w.external_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn find_account(
        &self,
        wallet: WalletId,
        currency: &str,
    ) -> Result<Option<Account>, LedgerError> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .values()
            .find(|a| a.wallet == wallet && a.currency.code == currency)
            .cloned())
    }

    async fn accounts_for_wallet(&self, wallet: WalletId) -> Result<Vec<Account>, LedgerError> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.wallet == wallet)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn balance(&self, account: AccountId) -> Result<(i64, i64), LedgerError> {
        Ok(bucket_sums(&*self.state.lock().await, account))
    }

    async fn get_entry(
        &self,
        id: EntryId,
    ) -> Result<Option<(JournalEntry, Vec<JournalLine>)>, LedgerError> {
        let state = self.state.lock().await;
        let Some(entry) = state.entries.get(&id).cloned() else {
            return Ok(None);
        };
        let lines = state
            .lines
            .iter()
            .filter(|l| l.entry == id)
            .cloned()
            .collect();
        Ok(Some((entry, lines)))
    }

    async fn entries_for_account(
        &self,
        account: AccountId,
        cursor: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        let state = self.state.lock().await;
        let touching: std::collections::HashSet<EntryId> = state
            .lines
            .iter()
            .filter(|l| l.account == account)
            .map(|l| l.entry)
            .collect();

        Ok(state
            .entries
            .values()
            .rev()
            .filter(|e| touching.contains(&e.id))
            .filter(|e| cursor.map_or(true, |c| e.id < c))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_hold(&self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
        Ok(self.state.lock().await.holds.get(&id).cloned())
    }

    async fn get_intent(&self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError> {
        Ok(self.state.lock().await.intents.get(&id).cloned())
    }

    async fn get_refund(&self, id: RefundId) -> Result<Option<Refund>, LedgerError> {
        Ok(self.state.lock().await.refunds.get(&id).cloned())
    }

    async fn expired_active_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HoldId>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .holds
            .values()
            .filter(|h| !h.status.is_terminal() && h.is_expired(now) && !h.remaining.is_zero())
            .take(limit as usize)
            .map(|h| h.id)
            .collect())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(handle) = &wallet.handle {
            if state
                .wallets
                .values()
                .any(|w| w.handle.as_deref() == Some(handle))
            {
                return Err(LedgerError::Conflict(format!("handle @{} taken", handle)));
            }
        }
        if let Some(external_ref) = &wallet.external_ref {
            if state
                .wallets
                .values()
                .any(|w| w.external_ref.as_deref() == Some(external_ref))
            {
                return Err(LedgerError::Conflict(format!(
                    "external ref {} taken",
                    external_ref
                )));
            }
        }
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state
            .accounts
            .values()
            .any(|a| a.wallet == account.wallet && a.currency.code == account.currency.code)
        {
            return Err(LedgerError::Conflict(format!(
                "wallet {} already has a {} account",
                account.wallet, account.currency.code
            )));
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::Storage(format!("account {} not found", id)))?;
        account.status = status;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemTx {
    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        // The state mutex is already held for the whole transaction, so
        // every row is effectively locked; this just reads the row.
        self.work
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::Storage(format!("account {} not found", id)))
    }

    async fn sum_buckets(&mut self, account: AccountId) -> Result<(i64, i64), LedgerError> {
        Ok(bucket_sums(&self.work, account))
    }

    async fn insert_entry(
        &mut self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), LedgerError> {
        crate::entry::check_balanced(entry, lines)?;
        if self.work.entries.contains_key(&entry.id) {
            return Err(LedgerError::Conflict(format!(
                "entry {} already exists",
                entry.id
            )));
        }
        self.work.entries.insert(entry.id, entry.clone());
        self.work.lines.extend_from_slice(lines);
        Ok(())
    }

    async fn get_hold(&mut self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
        Ok(self.work.holds.get(&id).cloned())
    }

    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
        self.work.holds.insert(hold.id, hold.clone());
        Ok(())
    }

    async fn update_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
        self.work.holds.insert(hold.id, hold.clone());
        Ok(())
    }

    async fn get_intent(&mut self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError> {
        Ok(self.work.intents.get(&id).cloned())
    }

    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
        self.work.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn update_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
        self.work.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), LedgerError> {
        self.work.refunds.insert(refund.id, refund.clone());
        Ok(())
    }

    async fn refunded_total(&mut self, capture: EntryId) -> Result<Amount, LedgerError> {
        let mut total = Amount::ZERO;
        for refund in self
            .work
            .refunds
            .values()
            .filter(|r| r.capture_entry == capture && r.status == RefundStatus::Posted)
        {
            total = total.checked_add(refund.amount)?;
        }
        Ok(total)
    }

    async fn outgoing_debits_since(
        &mut self,
        account: AccountId,
        since: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let mut total = 0i64;
        for line in self.work.lines.iter().filter(|l| {
            l.account == account && l.side == Side::Debit && l.bucket == Bucket::Available
        }) {
            let created_at = self
                .work
                .entries
                .get(&line.entry)
                .map(|e| e.created_at)
                .unwrap_or_else(Utc::now);
            if created_at >= since {
                total += line.amount.minor_units() as i64;
            }
        }
        Ok(total)
    }

    async fn idempotency_reserve(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        fingerprint: &str,
    ) -> Result<Reservation, LedgerError> {
        let slot = (scope, key.as_str().to_string());
        match self.work.idempotency.get(&slot) {
            None => {
                self.work.idempotency.insert(
                    slot,
                    IdempotencyRecord {
                        api_key: scope,
                        key: key.clone(),
                        fingerprint: fingerprint.to_string(),
                        status: IdempotencyStatus::InFlight,
                        snapshot: None,
                        created_at: Utc::now(),
                    },
                );
                Ok(Reservation::Fresh)
            }
            Some(record) if record.fingerprint != fingerprint => Ok(Reservation::Conflict),
            Some(record) => match record.status {
                IdempotencyStatus::InFlight => Ok(Reservation::InProgress),
                IdempotencyStatus::Completed | IdempotencyStatus::Failed => {
                    let snapshot = record.snapshot.clone().ok_or_else(|| {
                        LedgerError::Storage("completed record without snapshot".to_string())
                    })?;
                    Ok(Reservation::Replay(snapshot))
                }
            },
        }
    }

    async fn idempotency_complete(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        outcome: &Outcome,
    ) -> Result<(), LedgerError> {
        let slot = (scope, key.as_str().to_string());
        let record = self
            .work
            .idempotency
            .get_mut(&slot)
            .ok_or_else(|| LedgerError::Storage("completing an unreserved key".to_string()))?;
        record.status = outcome.status();
        record.snapshot = Some(outcome.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        // Dropping the scratch copy and the guard is the whole rollback.
        Ok(())
    }
}
