// src/posting.rs
//! The fixed debit/credit patterns behind each operation. Every builder
//! returns an entry plus its balanced line set; the store re-checks the
//! balance at insert time.

use crate::account::Account;
use crate::entry::{check_balanced, Bucket, EntryKind, JournalEntry, JournalLine, Side};
use crate::error::LedgerError;
use crate::hold::Hold;
use crate::id::WalletId;
use crate::money::Amount;

#[derive(Debug, Clone)]
pub struct Posting {
    pub entry: JournalEntry,
    pub lines: Vec<JournalLine>,
}

impl Posting {
    fn build(entry: JournalEntry, lines: Vec<JournalLine>) -> Result<Self, LedgerError> {
        check_balanced(&entry, &lines)?;
        Ok(Self { entry, lines })
    }
}

/// Transfer: payer available → payee available.
pub fn transfer(
    initiator: WalletId,
    payer: &Account,
    payee: &Account,
    amount: Amount,
    reference: Option<String>,
    metadata: serde_json::Value,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::Transfer, initiator, &payer.currency.code)
        .with_reference(reference)
        .with_metadata(metadata);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, payer.id, Side::Debit, amount, Bucket::Available),
        JournalLine::new(entry.id, payee.id, Side::Credit, amount, Bucket::Available),
    ];
    Posting::build(entry, lines)
}

/// Hold create: payer available → payer held.
pub fn hold_create(
    initiator: WalletId,
    payer: &Account,
    amount: Amount,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::Hold, initiator, &payer.currency.code);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, payer.id, Side::Debit, amount, Bucket::Available),
        JournalLine::new(entry.id, payer.id, Side::Credit, amount, Bucket::Held),
    ];
    Posting::build(entry, lines)
}

/// Capture: payer held → payee available, linked back to the hold's
/// creating entry.
pub fn hold_capture(
    initiator: WalletId,
    hold: &Hold,
    payee: &Account,
    amount: Amount,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::Capture, initiator, &hold.currency.code)
        .with_link(hold.entry);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, hold.payer_account, Side::Debit, amount, Bucket::Held),
        JournalLine::new(entry.id, payee.id, Side::Credit, amount, Bucket::Available),
    ];
    Posting::build(entry, lines)
}

/// Release (explicit or expiry): payer held → payer available for the
/// uncaptured remainder.
pub fn hold_release(
    initiator: WalletId,
    hold: &Hold,
    amount: Amount,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::Release, initiator, &hold.currency.code)
        .with_link(hold.entry);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, hold.payer_account, Side::Debit, amount, Bucket::Held),
        JournalLine::new(entry.id, hold.payer_account, Side::Credit, amount, Bucket::Available),
    ];
    Posting::build(entry, lines)
}

/// Intent pay: payer available → intent payee available.
pub fn intent_pay(
    initiator: WalletId,
    payer: &Account,
    payee: &Account,
    amount: Amount,
    metadata: serde_json::Value,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::IntentPay, initiator, &payer.currency.code)
        .with_metadata(metadata);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, payer.id, Side::Debit, amount, Bucket::Available),
        JournalLine::new(entry.id, payee.id, Side::Credit, amount, Bucket::Available),
    ];
    Posting::build(entry, lines)
}

/// Refund: capture payee available → original payer available, linked back
/// to the capture entry.
pub fn refund(
    initiator: WalletId,
    capture_entry: &JournalEntry,
    refunder: &Account,
    recipient: &Account,
    amount: Amount,
    idempotency_key: Option<String>,
) -> Result<Posting, LedgerError> {
    let mut entry = JournalEntry::new(EntryKind::Refund, initiator, &refunder.currency.code)
        .with_link(capture_entry.id);
    entry.idempotency_key = idempotency_key;

    let lines = vec![
        JournalLine::new(entry.id, refunder.id, Side::Debit, amount, Bucket::Available),
        JournalLine::new(entry.id, recipient.id, Side::Credit, amount, Bucket::Available),
    ];
    Posting::build(entry, lines)
}
