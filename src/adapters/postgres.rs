// src/adapters/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::account::{Account, AccountKind, AccountStatus, Wallet};
use crate::entry::{Bucket, EntryKind, JournalEntry, JournalLine, Side};
use crate::error::LedgerError;
use crate::hold::{Hold, HoldStatus};
use crate::id::{AccountId, ApiKeyId, EntryId, HoldId, IntentId, LineId, RefundId, WalletId};
use crate::idempotency::{IdempotencyKey, IdempotencyStatus, Outcome, Reservation};
use crate::intent::{IntentStatus, PaymentIntent};
use crate::money::{Amount, Currency};
use crate::refund::{Refund, RefundStatus};
use crate::{LedgerStore, StoreTx};

/// Postgres-backed store. Row locks come from `SELECT ... FOR UPDATE`;
/// serialization failures surface as `TransientConflict` so the executor
/// can retry them.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let pool = PgPool::connect(url).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist. Idempotent.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_wallets (
                id UUID PRIMARY KEY,
                handle TEXT UNIQUE,
                external_ref TEXT UNIQUE,
                display_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id UUID PRIMARY KEY,
                wallet UUID NOT NULL REFERENCES ledger_wallets(id),
                currency TEXT NOT NULL,
                currency_decimals SMALLINT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('user', 'system')),
                status TEXT NOT NULL CHECK (status IN ('active', 'frozen')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (wallet, currency)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN
                    ('transfer', 'hold', 'capture', 'release', 'refund', 'intent_pay')),
                initiator UUID NOT NULL,
                currency TEXT NOT NULL,
                reference TEXT,
                metadata JSONB NOT NULL DEFAULT 'null',
                idempotency_key TEXT,
                linked_entry UUID REFERENCES ledger_entries(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_lines (
                id UUID PRIMARY KEY,
                entry UUID NOT NULL REFERENCES ledger_entries(id),
                account UUID NOT NULL REFERENCES ledger_accounts(id),
                side TEXT NOT NULL CHECK (side IN ('debit', 'credit')),
                amount BIGINT NOT NULL CHECK (amount > 0),
                bucket TEXT NOT NULL CHECK (bucket IN ('available', 'held'))
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // The balance derivation reads (account, bucket, side, amount);
        // keep it index-only.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_lines_account_bucket
            ON ledger_lines(account, bucket, side, amount)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_lines_entry
            ON ledger_lines(entry)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_holds (
                id UUID PRIMARY KEY,
                payer_account UUID NOT NULL REFERENCES ledger_accounts(id),
                currency TEXT NOT NULL,
                currency_decimals SMALLINT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                remaining BIGINT NOT NULL CHECK (remaining >= 0),
                status TEXT NOT NULL CHECK (status IN
                    ('active', 'partially_captured', 'captured', 'released', 'expired')),
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                entry UUID NOT NULL REFERENCES ledger_entries(id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_holds_due
            ON ledger_holds(expires_at)
            WHERE status IN ('active', 'partially_captured')
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_intents (
                id UUID PRIMARY KEY,
                payee_account UUID NOT NULL REFERENCES ledger_accounts(id),
                currency TEXT NOT NULL,
                currency_decimals SMALLINT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                status TEXT NOT NULL CHECK (status IN
                    ('pending', 'paid', 'expired', 'cancelled')),
                expires_at TIMESTAMPTZ NOT NULL,
                metadata JSONB NOT NULL DEFAULT 'null',
                paid_entry UUID REFERENCES ledger_entries(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_refunds (
                id UUID PRIMARY KEY,
                capture_entry UUID NOT NULL REFERENCES ledger_entries(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                status TEXT NOT NULL CHECK (status IN ('posted', 'failed')),
                entry UUID NOT NULL REFERENCES ledger_entries(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_refunds_capture
            ON ledger_refunds(capture_entry)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_idempotency_keys (
                api_key UUID NOT NULL,
                key TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('in_flight', 'completed', 'failed')),
                snapshot JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (api_key, key)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, LedgerError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, handle, external_ref, display_name, created_at
             FROM ledger_wallets WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| wallet_from_row(&r)).transpose()
    }

    async fn find_wallet_by_handle(&self, handle: &str) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, handle, external_ref, display_name, created_at
             FROM ledger_wallets WHERE handle = $1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| wallet_from_row(&r)).transpose()
    }

    async fn find_wallet_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, handle, external_ref, display_name, created_at
             FROM ledger_wallets WHERE external_ref = $1",
        )
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| wallet_from_row(&r)).transpose()
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, wallet, currency, currency_decimals, kind, status, created_at
             FROM ledger_accounts WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| account_from_row(&r)).transpose()
    }

    async fn find_account(
        &self,
        wallet: WalletId,
        currency: &str,
    ) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, wallet, currency, currency_decimals, kind, status, created_at
             FROM ledger_accounts WHERE wallet = $1 AND currency = $2",
        )
        .bind(wallet.0)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| account_from_row(&r)).transpose()
    }

    async fn accounts_for_wallet(&self, wallet: WalletId) -> Result<Vec<Account>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, wallet, currency, currency_decimals, kind, status, created_at
             FROM ledger_accounts WHERE wallet = $1 ORDER BY id",
        )
        .bind(wallet.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn balance(&self, account: AccountId) -> Result<(i64, i64), LedgerError> {
        let row = sqlx::query(BUCKET_SUMS_SQL)
            .bind(account.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok((
            row.try_get("available").map_err(db_err)?,
            row.try_get("held").map_err(db_err)?,
        ))
    }

    async fn get_entry(
        &self,
        id: EntryId,
    ) -> Result<Option<(JournalEntry, Vec<JournalLine>)>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, kind, initiator, currency, reference, metadata, idempotency_key,
                    linked_entry, created_at
             FROM ledger_entries WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;

        let line_rows = sqlx::query(
            "SELECT id, entry, account, side, amount, bucket
             FROM ledger_lines WHERE entry = $1",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let lines = line_rows
            .iter()
            .map(line_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((entry, lines)))
    }

    async fn entries_for_account(
        &self,
        account: AccountId,
        cursor: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT e.id, e.kind, e.initiator, e.currency, e.reference, e.metadata,
                   e.idempotency_key, e.linked_entry, e.created_at
            FROM ledger_entries e
            JOIN ledger_lines l ON l.entry = e.id
            WHERE l.account = $1 AND ($2::uuid IS NULL OR e.id < $2)
            ORDER BY e.id DESC
            LIMIT $3
            "#,
        )
        .bind(account.0)
        .bind(cursor.map(|c| c.0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn get_hold(&self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
        let row = sqlx::query(HOLD_SELECT_SQL)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| hold_from_row(&r)).transpose()
    }

    async fn get_intent(&self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError> {
        let row = sqlx::query(INTENT_SELECT_SQL)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| intent_from_row(&r)).transpose()
    }

    async fn get_refund(&self, id: RefundId) -> Result<Option<Refund>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, capture_entry, amount, status, entry, created_at
             FROM ledger_refunds WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| refund_from_row(&r)).transpose()
    }

    async fn expired_active_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HoldId>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM ledger_holds
            WHERE status IN ('active', 'partially_captured')
              AND expires_at <= $1 AND remaining > 0
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| Ok(HoldId(r.try_get::<Uuid, _>("id").map_err(db_err)?)))
            .collect()
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_wallets (id, handle, external_ref, display_name, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(wallet.id.0)
        .bind(&wallet.handle)
        .bind(&wallet.external_ref)
        .bind(&wallet.display_name)
        .bind(wallet.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_accounts
                 (id, wallet, currency, currency_decimals, kind, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(account.id.0)
        .bind(account.wallet.0)
        .bind(&account.currency.code)
        .bind(account.currency.decimals as i16)
        .bind(kind_str(account.kind))
        .bind(status_str(account.status))
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE ledger_accounts SET status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(status_str(status))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::Storage(format!("account {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        let row = sqlx::query(
            "SELECT id, wallet, currency, currency_decimals, kind, status, created_at
             FROM ledger_accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerError::Storage(format!("account {} not found", id)))?;
        account_from_row(&row)
    }

    async fn sum_buckets(&mut self, account: AccountId) -> Result<(i64, i64), LedgerError> {
        let row = sqlx::query(BUCKET_SUMS_SQL)
            .bind(account.0)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok((
            row.try_get("available").map_err(db_err)?,
            row.try_get("held").map_err(db_err)?,
        ))
    }

    async fn insert_entry(
        &mut self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), LedgerError> {
        // The identity is enforced here as well as in the posting builders:
        // no adapter path may append an unbalanced entry.
        crate::entry::check_balanced(entry, lines)?;

        sqlx::query(
            "INSERT INTO ledger_entries
                 (id, kind, initiator, currency, reference, metadata, idempotency_key,
                  linked_entry, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id.0)
        .bind(entry.kind.as_str())
        .bind(entry.initiator.0)
        .bind(&entry.currency)
        .bind(&entry.reference)
        .bind(&entry.metadata)
        .bind(&entry.idempotency_key)
        .bind(entry.linked_entry.map(|e| e.0))
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        for line in lines {
            sqlx::query(
                "INSERT INTO ledger_lines (id, entry, account, side, amount, bucket)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(line.id.0)
            .bind(line.entry.0)
            .bind(line.account.0)
            .bind(side_str(line.side))
            .bind(line.amount.minor_units() as i64)
            .bind(bucket_str(line.bucket))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }

    async fn get_hold(&mut self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
        let row = sqlx::query(HOLD_SELECT_SQL)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.map(|r| hold_from_row(&r)).transpose()
    }

    async fn insert_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_holds
                 (id, payer_account, currency, currency_decimals, amount, remaining,
                  status, expires_at, created_at, entry)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(hold.id.0)
        .bind(hold.payer_account.0)
        .bind(&hold.currency.code)
        .bind(hold.currency.decimals as i16)
        .bind(hold.amount.minor_units() as i64)
        .bind(hold.remaining.minor_units() as i64)
        .bind(hold_status_str(hold.status))
        .bind(hold.expires_at)
        .bind(hold.created_at)
        .bind(hold.entry.0)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
        sqlx::query("UPDATE ledger_holds SET remaining = $2, status = $3 WHERE id = $1")
            .bind(hold.id.0)
            .bind(hold.remaining.minor_units() as i64)
            .bind(hold_status_str(hold.status))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_intent(&mut self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError> {
        let row = sqlx::query(INTENT_SELECT_SQL)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.map(|r| intent_from_row(&r)).transpose()
    }

    async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_intents
                 (id, payee_account, currency, currency_decimals, amount, status,
                  expires_at, metadata, paid_entry, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(intent.id.0)
        .bind(intent.payee_account.0)
        .bind(&intent.currency.code)
        .bind(intent.currency.decimals as i16)
        .bind(intent.amount.minor_units() as i64)
        .bind(intent_status_str(intent.status))
        .bind(intent.expires_at)
        .bind(&intent.metadata)
        .bind(intent.paid_entry.map(|e| e.0))
        .bind(intent.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
        sqlx::query("UPDATE ledger_intents SET status = $2, paid_entry = $3 WHERE id = $1")
            .bind(intent.id.0)
            .bind(intent_status_str(intent.status))
            .bind(intent.paid_entry.map(|e| e.0))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger_refunds (id, capture_entry, amount, status, entry, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(refund.id.0)
        .bind(refund.capture_entry.0)
        .bind(refund.amount.minor_units() as i64)
        .bind(refund_status_str(refund.status))
        .bind(refund.entry.0)
        .bind(refund.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn refunded_total(&mut self, capture: EntryId) -> Result<Amount, LedgerError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT
             FROM ledger_refunds WHERE capture_entry = $1 AND status = 'posted'",
        )
        .bind(capture.0)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(Amount::from_minor_units(total.max(0) as u64))
    }

    async fn outgoing_debits_since(
        &mut self,
        account: AccountId,
        since: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(l.amount), 0)::BIGINT
            FROM ledger_lines l
            JOIN ledger_entries e ON l.entry = e.id
            WHERE l.account = $1 AND l.side = 'debit' AND l.bucket = 'available'
              AND e.created_at >= $2
            "#,
        )
        .bind(account.0)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(total)
    }

    async fn idempotency_reserve(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        fingerprint: &str,
    ) -> Result<Reservation, LedgerError> {
        // The in-flight row lives and dies with this transaction: a crash
        // before commit leaves no record at all.
        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_idempotency_keys
                (api_key, key, fingerprint, status, snapshot, created_at)
            VALUES ($1, $2, $3, 'in_flight', NULL, NOW())
            ON CONFLICT (api_key, key) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(scope.0)
        .bind(key.as_str())
        .bind(fingerprint)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if inserted.is_some() {
            return Ok(Reservation::Fresh);
        }

        let row = sqlx::query(
            "SELECT fingerprint, status, snapshot
             FROM ledger_idempotency_keys WHERE api_key = $1 AND key = $2",
        )
        .bind(scope.0)
        .bind(key.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let stored_fingerprint: String = row.try_get("fingerprint").map_err(db_err)?;
        if stored_fingerprint != fingerprint {
            return Ok(Reservation::Conflict);
        }

        let status: String = row.try_get("status").map_err(db_err)?;
        match parse_idempotency_status(&status)? {
            IdempotencyStatus::InFlight => Ok(Reservation::InProgress),
            IdempotencyStatus::Completed | IdempotencyStatus::Failed => {
                let snapshot: serde_json::Value = row.try_get("snapshot").map_err(db_err)?;
                let outcome: Outcome = serde_json::from_value(snapshot)
                    .map_err(|e| LedgerError::Storage(format!("corrupt snapshot: {}", e)))?;
                Ok(Reservation::Replay(outcome))
            }
        }
    }

    async fn idempotency_complete(
        &mut self,
        scope: ApiKeyId,
        key: &IdempotencyKey,
        outcome: &Outcome,
    ) -> Result<(), LedgerError> {
        let snapshot = serde_json::to_value(outcome)
            .map_err(|e| LedgerError::Storage(format!("unencodable snapshot: {}", e)))?;
        let status = match outcome.status() {
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
            IdempotencyStatus::InFlight => {
                return Err(LedgerError::Storage(
                    "cannot complete a key as in_flight".to_string(),
                ));
            }
        };
        let result = sqlx::query(
            "UPDATE ledger_idempotency_keys SET status = $3, snapshot = $4
             WHERE api_key = $1 AND key = $2 AND status = 'in_flight'",
        )
        .bind(scope.0)
        .bind(key.as_str())
        .bind(status)
        .bind(snapshot)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::Storage(
                "completing an unreserved key".to_string(),
            ));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.rollback().await.map_err(db_err)
    }
}

const BUCKET_SUMS_SQL: &str = r#"
    SELECT
        COALESCE(SUM(CASE WHEN side = 'credit' THEN amount ELSE -amount END)
            FILTER (WHERE bucket = 'available'), 0)::BIGINT AS available,
        COALESCE(SUM(CASE WHEN side = 'credit' THEN amount ELSE -amount END)
            FILTER (WHERE bucket = 'held'), 0)::BIGINT AS held
    FROM ledger_lines
    WHERE account = $1
"#;

const HOLD_SELECT_SQL: &str = "SELECT id, payer_account, currency, currency_decimals, amount, \
     remaining, status, expires_at, created_at, entry FROM ledger_holds WHERE id = $1";

const INTENT_SELECT_SQL: &str = "SELECT id, payee_account, currency, currency_decimals, amount, \
     status, expires_at, metadata, paid_entry, created_at FROM ledger_intents WHERE id = $1";

/// Map driver errors onto the core's error kinds. Serialization failures
/// and deadlocks are retryable; unique violations are conflicts; the rest
/// is opaque storage trouble.
fn db_err(e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code == "40001" || code == "40P01" {
                return LedgerError::TransientConflict;
            }
            if code == "23505" {
                return LedgerError::Conflict(db.message().to_string());
            }
        }
    }
    LedgerError::Storage(e.to_string())
}

fn kind_str(kind: AccountKind) -> &'static str {
    match kind {
        AccountKind::User => "user",
        AccountKind::System => "system",
    }
}

fn status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "active",
        AccountStatus::Frozen => "frozen",
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Debit => "debit",
        Side::Credit => "credit",
    }
}

fn bucket_str(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Available => "available",
        Bucket::Held => "held",
    }
}

fn hold_status_str(status: HoldStatus) -> &'static str {
    match status {
        HoldStatus::Active => "active",
        HoldStatus::PartiallyCaptured => "partially_captured",
        HoldStatus::Captured => "captured",
        HoldStatus::Released => "released",
        HoldStatus::Expired => "expired",
    }
}

fn intent_status_str(status: IntentStatus) -> &'static str {
    match status {
        IntentStatus::Pending => "pending",
        IntentStatus::Paid => "paid",
        IntentStatus::Expired => "expired",
        IntentStatus::Cancelled => "cancelled",
    }
}

fn refund_status_str(status: RefundStatus) -> &'static str {
    match status {
        RefundStatus::Posted => "posted",
        RefundStatus::Failed => "failed",
    }
}

fn parse_err(what: &str, value: &str) -> LedgerError {
    LedgerError::Storage(format!("unknown {}: {}", what, value))
}

fn parse_kind(value: &str) -> Result<AccountKind, LedgerError> {
    match value {
        "user" => Ok(AccountKind::User),
        "system" => Ok(AccountKind::System),
        other => Err(parse_err("account kind", other)),
    }
}

fn parse_status(value: &str) -> Result<AccountStatus, LedgerError> {
    match value {
        "active" => Ok(AccountStatus::Active),
        "frozen" => Ok(AccountStatus::Frozen),
        other => Err(parse_err("account status", other)),
    }
}

fn parse_entry_kind(value: &str) -> Result<EntryKind, LedgerError> {
    match value {
        "transfer" => Ok(EntryKind::Transfer),
        "hold" => Ok(EntryKind::Hold),
        "capture" => Ok(EntryKind::Capture),
        "release" => Ok(EntryKind::Release),
        "refund" => Ok(EntryKind::Refund),
        "intent_pay" => Ok(EntryKind::IntentPay),
        other => Err(parse_err("entry kind", other)),
    }
}

fn parse_side(value: &str) -> Result<Side, LedgerError> {
    match value {
        "debit" => Ok(Side::Debit),
        "credit" => Ok(Side::Credit),
        other => Err(parse_err("line side", other)),
    }
}

fn parse_bucket(value: &str) -> Result<Bucket, LedgerError> {
    match value {
        "available" => Ok(Bucket::Available),
        "held" => Ok(Bucket::Held),
        other => Err(parse_err("line bucket", other)),
    }
}

fn parse_hold_status(value: &str) -> Result<HoldStatus, LedgerError> {
    match value {
        "active" => Ok(HoldStatus::Active),
        "partially_captured" => Ok(HoldStatus::PartiallyCaptured),
        "captured" => Ok(HoldStatus::Captured),
        "released" => Ok(HoldStatus::Released),
        "expired" => Ok(HoldStatus::Expired),
        other => Err(parse_err("hold status", other)),
    }
}

fn parse_intent_status(value: &str) -> Result<IntentStatus, LedgerError> {
    match value {
        "pending" => Ok(IntentStatus::Pending),
        "paid" => Ok(IntentStatus::Paid),
        "expired" => Ok(IntentStatus::Expired),
        "cancelled" => Ok(IntentStatus::Cancelled),
        other => Err(parse_err("intent status", other)),
    }
}

fn parse_refund_status(value: &str) -> Result<RefundStatus, LedgerError> {
    match value {
        "posted" => Ok(RefundStatus::Posted),
        "failed" => Ok(RefundStatus::Failed),
        other => Err(parse_err("refund status", other)),
    }
}

fn parse_idempotency_status(value: &str) -> Result<IdempotencyStatus, LedgerError> {
    match value {
        "in_flight" => Ok(IdempotencyStatus::InFlight),
        "completed" => Ok(IdempotencyStatus::Completed),
        "failed" => Ok(IdempotencyStatus::Failed),
        other => Err(parse_err("idempotency status", other)),
    }
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet, LedgerError> {
    Ok(Wallet {
        id: WalletId(row.try_get("id").map_err(db_err)?),
        handle: row.try_get("handle").map_err(db_err)?,
        external_ref: row.try_get("external_ref").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, LedgerError> {
    let code: String = row.try_get("currency").map_err(db_err)?;
    let decimals: i16 = row.try_get("currency_decimals").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Account {
        id: AccountId(row.try_get("id").map_err(db_err)?),
        wallet: WalletId(row.try_get("wallet").map_err(db_err)?),
        currency: Currency::new(&code, decimals as u8),
        kind: parse_kind(&kind)?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<JournalEntry, LedgerError> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    Ok(JournalEntry {
        id: EntryId(row.try_get("id").map_err(db_err)?),
        kind: parse_entry_kind(&kind)?,
        initiator: WalletId(row.try_get("initiator").map_err(db_err)?),
        currency: row.try_get("currency").map_err(db_err)?,
        reference: row.try_get("reference").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        linked_entry: row
            .try_get::<Option<Uuid>, _>("linked_entry")
            .map_err(db_err)?
            .map(EntryId),
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn line_from_row(row: &PgRow) -> Result<JournalLine, LedgerError> {
    let side: String = row.try_get("side").map_err(db_err)?;
    let bucket: String = row.try_get("bucket").map_err(db_err)?;
    let amount: i64 = row.try_get("amount").map_err(db_err)?;
    Ok(JournalLine {
        id: LineId(row.try_get("id").map_err(db_err)?),
        entry: EntryId(row.try_get("entry").map_err(db_err)?),
        account: AccountId(row.try_get("account").map_err(db_err)?),
        side: parse_side(&side)?,
        amount: Amount::from_minor_units(amount.max(0) as u64),
        bucket: parse_bucket(&bucket)?,
    })
}

fn hold_from_row(row: &PgRow) -> Result<Hold, LedgerError> {
    let code: String = row.try_get("currency").map_err(db_err)?;
    let decimals: i16 = row.try_get("currency_decimals").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let amount: i64 = row.try_get("amount").map_err(db_err)?;
    let remaining: i64 = row.try_get("remaining").map_err(db_err)?;
    Ok(Hold {
        id: HoldId(row.try_get("id").map_err(db_err)?),
        payer_account: AccountId(row.try_get("payer_account").map_err(db_err)?),
        currency: Currency::new(&code, decimals as u8),
        amount: Amount::from_minor_units(amount.max(0) as u64),
        remaining: Amount::from_minor_units(remaining.max(0) as u64),
        status: parse_hold_status(&status)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        entry: EntryId(row.try_get("entry").map_err(db_err)?),
    })
}

fn intent_from_row(row: &PgRow) -> Result<PaymentIntent, LedgerError> {
    let code: String = row.try_get("currency").map_err(db_err)?;
    let decimals: i16 = row.try_get("currency_decimals").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let amount: i64 = row.try_get("amount").map_err(db_err)?;
    Ok(PaymentIntent {
        id: IntentId(row.try_get("id").map_err(db_err)?),
        payee_account: AccountId(row.try_get("payee_account").map_err(db_err)?),
        currency: Currency::new(&code, decimals as u8),
        amount: Amount::from_minor_units(amount.max(0) as u64),
        status: parse_intent_status(&status)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        paid_entry: row
            .try_get::<Option<Uuid>, _>("paid_entry")
            .map_err(db_err)?
            .map(EntryId),
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn refund_from_row(row: &PgRow) -> Result<Refund, LedgerError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let amount: i64 = row.try_get("amount").map_err(db_err)?;
    Ok(Refund {
        id: RefundId(row.try_get("id").map_err(db_err)?),
        capture_entry: EntryId(row.try_get("capture_entry").map_err(db_err)?),
        amount: Amount::from_minor_units(amount.max(0) as u64),
        status: parse_refund_status(&status)?,
        entry: EntryId(row.try_get("entry").map_err(db_err)?),
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
