// tests/integration_tests.rs
use std::time::Duration;

use tallybook::adapters::MemoryStore;
use tallybook::{
    Amount, ApiKey, EntryKind, HoldId, HoldStatus, IdempotencyKey, IntentId, IntentStatus,
    LedgerEngine, LedgerError, NewWallet, Request, Response, Scope,
};

struct Env {
    engine: LedgerEngine,
    treasury: ApiKey,
}

async fn setup() -> Env {
    let engine = LedgerEngine::new(Box::new(MemoryStore::new()));
    let (wallet, _) = engine
        .create_wallet(NewWallet::system("USD treasury", "USD"))
        .await
        .unwrap();
    let treasury = ApiKey::unrestricted(wallet.id);
    Env { engine, treasury }
}

async fn user(env: &Env, handle: &str) -> ApiKey {
    let (wallet, _) = env
        .engine
        .create_wallet(NewWallet::user(handle, "USD"))
        .await
        .unwrap();
    ApiKey::unrestricted(wallet.id)
}

fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey::new(raw).unwrap()
}

fn usd(minor_units: u64) -> Amount {
    Amount::from_minor_units(minor_units)
}

fn transfer_to(handle: &str, amount: u64) -> Request {
    Request::Transfer {
        to: format!("@{}", handle),
        amount: usd(amount),
        currency: "USD".to_string(),
        reference: None,
        metadata: None,
    }
}

/// Money enters the ledger as a transfer out of the treasury's system
/// account, which is allowed to run negative.
async fn fund(env: &Env, handle: &str, amount: u64) {
    let k = key(&format!("fund-{}-{}", handle, amount));
    env.engine
        .submit(&env.treasury, &k, transfer_to(handle, amount))
        .await
        .unwrap();
}

async fn available(env: &Env, caller: &ApiKey) -> i64 {
    env.engine.get_balance(caller).await.unwrap().available
}

async fn held(env: &Env, caller: &ApiKey) -> i64 {
    env.engine.get_balance(caller).await.unwrap().held
}

fn entry_id(response: &Response) -> tallybook::EntryId {
    match response {
        Response::Transfer { entry_id }
        | Response::HoldCapture { entry_id, .. }
        | Response::HoldRelease { entry_id }
        | Response::IntentPay { entry_id }
        | Response::Refund { entry_id, .. } => *entry_id,
        other => panic!("response carries no entry id: {:?}", other),
    }
}

async fn create_hold(env: &Env, caller: &ApiKey, amount: u64, expires_in: u64, k: &str) -> HoldId {
    let response = env
        .engine
        .submit(
            caller,
            &key(k),
            Request::HoldCreate {
                amount: usd(amount),
                currency: "USD".to_string(),
                expires_in_seconds: expires_in,
            },
        )
        .await
        .unwrap();
    match response {
        Response::HoldCreate { hold_id, .. } => hold_id,
        other => panic!("unexpected response: {:?}", other),
    }
}

async fn create_intent(env: &Env, caller: &ApiKey, amount: u64, expires_in: u64, k: &str) -> IntentId {
    let response = env
        .engine
        .submit(
            caller,
            &key(k),
            Request::IntentCreate {
                amount: usd(amount),
                currency: "USD".to_string(),
                expires_in_seconds: expires_in,
                metadata: None,
            },
        )
        .await
        .unwrap();
    match response {
        Response::IntentCreate { intent_id, .. } => intent_id,
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn transfer_moves_available_funds() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let response = env
        .engine
        .submit(&alice, &key("t1"), transfer_to("store", 25_00))
        .await
        .unwrap();

    assert_eq!(available(&env, &alice).await, 975_00);
    assert_eq!(available(&env, &store).await, 25_00);

    let (entry, lines) = env
        .engine
        .store()
        .get_entry(entry_id(&response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.kind, EntryKind::Transfer);
    assert_eq!(lines.len(), 2);
}

#[tokio::test]
async fn hold_capture_release_lifecycle() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let hold_id = create_hold(&env, &alice, 100_00, 600, "h1").await;
    assert_eq!(available(&env, &alice).await, 900_00);
    assert_eq!(held(&env, &alice).await, 100_00);

    let response = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: Some(usd(75_00)),
            },
        )
        .await
        .unwrap();
    match response {
        Response::HoldCapture { remaining, .. } => assert_eq!(remaining, usd(25_00)),
        other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(available(&env, &alice).await, 900_00);
    assert_eq!(held(&env, &alice).await, 25_00);
    assert_eq!(available(&env, &store).await, 75_00);

    let hold = env.engine.store().get_hold(hold_id).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::PartiallyCaptured);
    assert_eq!(hold.remaining, usd(25_00));

    env.engine
        .submit(&alice, &key("r1"), Request::HoldRelease { hold_id })
        .await
        .unwrap();

    assert_eq!(available(&env, &alice).await, 925_00);
    assert_eq!(held(&env, &alice).await, 0);
    let hold = env.engine.store().get_hold(hold_id).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Released);
    assert!(hold.remaining.is_zero());
}

#[tokio::test]
async fn insufficient_funds_leaves_no_entry() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 50_00).await;

    let err = env
        .engine
        .submit(&alice, &key("t1"), transfer_to("store", 60_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::InsufficientFunds);

    assert_eq!(available(&env, &alice).await, 50_00);
    // Only the funding entry touches Alice's account.
    let page = env.engine.list_transactions(&alice, None, 100).await.unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn concurrent_transfers_cannot_double_spend() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let left_key = key("left");
    let right_key = key("right");
    let (first, second) = tokio::join!(
        env.engine
            .submit(&alice, &left_key, transfer_to("store", 600_00)),
        env.engine
            .submit(&alice, &right_key, transfer_to("store", 600_00)),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = [first, second].into_iter().find(|r| r.is_err()).unwrap();
    assert_eq!(failure.unwrap_err(), LedgerError::InsufficientFunds);

    assert_eq!(available(&env, &alice).await, 400_00);
}

#[tokio::test]
async fn identical_retry_replays_the_first_response() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let first = env
        .engine
        .submit(&alice, &key("once"), transfer_to("store", 25_00))
        .await
        .unwrap();
    let second = env
        .engine
        .submit(&alice, &key("once"), transfer_to("store", 25_00))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(available(&env, &alice).await, 975_00);

    // One entry in the journal for the recipient, not two.
    let page = env.engine.list_transactions(&store, None, 100).await.unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn reused_key_with_different_body_conflicts() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    env.engine
        .submit(&alice, &key("k"), transfer_to("store", 25_00))
        .await
        .unwrap();
    let err = env
        .engine
        .submit(&alice, &key("k"), transfer_to("store", 26_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::IdempotencyConflict);
    assert_eq!(available(&env, &alice).await, 975_00);
}

#[tokio::test]
async fn failed_request_replays_the_same_failure() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 50_00).await;

    let first = env
        .engine
        .submit(&alice, &key("k"), transfer_to("store", 60_00))
        .await
        .unwrap_err();
    let second = env
        .engine
        .submit(&alice, &key("k"), transfer_to("store", 60_00))
        .await
        .unwrap_err();
    assert_eq!(first, LedgerError::InsufficientFunds);
    assert_eq!(first, second);
}

#[tokio::test]
async fn intent_is_paid_exactly_once() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let intent_id = create_intent(&env, &store, 50_00, 900, "i1").await;

    env.engine
        .submit(&alice, &key("pay1"), Request::IntentPay { intent_id })
        .await
        .unwrap();

    assert_eq!(available(&env, &alice).await, 950_00);
    assert_eq!(available(&env, &store).await, 50_00);
    let intent = env.engine.store().get_intent(intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Paid);
    assert!(intent.paid_entry.is_some());

    let err = env
        .engine
        .submit(&alice, &key("pay2"), Request::IntentPay { intent_id })
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::IntentAlreadyPaid(intent_id));
}

#[tokio::test]
async fn intent_creator_cannot_pay_itself() {
    let env = setup().await;
    let store = user(&env, "store").await;
    fund(&env, "store", 100_00).await;

    let intent_id = create_intent(&env, &store, 50_00, 900, "i1").await;
    let err = env
        .engine
        .submit(&store, &key("self"), Request::IntentPay { intent_id })
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::ForbiddenScope);
}

#[tokio::test]
async fn cancelled_intent_rejects_payment() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let intent_id = create_intent(&env, &store, 50_00, 900, "i1").await;
    env.engine
        .submit(&store, &key("cancel"), Request::IntentCancel { intent_id })
        .await
        .unwrap();

    let err = env
        .engine
        .submit(&alice, &key("pay"), Request::IntentPay { intent_id })
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::IntentCancelled(intent_id));
    assert_eq!(available(&env, &alice).await, 100_00);
}

#[tokio::test]
async fn missing_scope_is_forbidden() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let read_only = ApiKey::new(alice.wallet, [Scope::Read]);
    let err = env
        .engine
        .submit(&read_only, &key("t"), transfer_to("store", 10_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::ForbiddenScope);
}

#[tokio::test]
async fn spend_ceiling_blocks_the_overflowing_request() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    let capped = ApiKey::unrestricted(alice.wallet)
        .with_limit(usd(100_00), Duration::from_secs(3600));

    env.engine
        .submit(&capped, &key("a"), transfer_to("store", 60_00))
        .await
        .unwrap();
    let err = env
        .engine
        .submit(&capped, &key("b"), transfer_to("store", 50_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::LimitExceeded);

    // Still room under the ceiling for a smaller amount.
    env.engine
        .submit(&capped, &key("c"), transfer_to("store", 40_00))
        .await
        .unwrap();
    assert_eq!(available(&env, &alice).await, 900_00);
}

#[tokio::test]
async fn currency_mismatch_is_rejected() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    fund(&env, "alice", 100_00).await;
    env.engine
        .create_wallet(NewWallet::user("bob", "EUR"))
        .await
        .unwrap();

    let err = env
        .engine
        .submit(&alice, &key("t"), transfer_to("bob", 10_00))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
}

#[tokio::test]
async fn unknown_recipient_is_not_found() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    fund(&env, "alice", 100_00).await;

    let err = env
        .engine
        .submit(&alice, &key("t"), transfer_to("nobody", 10_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::RecipientNotFound("@nobody".to_string()));
}

#[tokio::test]
async fn recipients_resolve_by_wallet_id_and_external_ref() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    fund(&env, "alice", 100_00).await;

    let (carol_wallet, _) = env
        .engine
        .create_wallet(NewWallet::user("carol", "USD").with_external_ref("psp-42"))
        .await
        .unwrap();
    let carol = ApiKey::unrestricted(carol_wallet.id);

    env.engine
        .submit(
            &alice,
            &key("by-id"),
            Request::Transfer {
                to: carol_wallet.id.to_string(),
                amount: usd(10_00),
                currency: "USD".to_string(),
                reference: None,
                metadata: None,
            },
        )
        .await
        .unwrap();
    env.engine
        .submit(
            &alice,
            &key("by-ext"),
            Request::Transfer {
                to: "ext:psp-42".to_string(),
                amount: usd(5_00),
                currency: "USD".to_string(),
                reference: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(available(&env, &carol).await, 15_00);
}

#[tokio::test]
async fn frozen_account_blocks_money_movement() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let account = env
        .engine
        .store()
        .accounts_for_wallet(alice.wallet)
        .await
        .unwrap()
        .remove(0);
    env.engine.freeze_account(account.id).await.unwrap();

    let err = env
        .engine
        .submit(&alice, &key("t"), transfer_to("store", 10_00))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    env.engine.unfreeze_account(account.id).await.unwrap();
    env.engine
        .submit(&alice, &key("t2"), transfer_to("store", 10_00))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_hold_releases_on_access() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let hold_id = create_hold(&env, &alice, 40_00, 1, "h1").await;
    assert_eq!(held(&env, &alice).await, 40_00);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let err = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::HoldExpired(hold_id));

    // The lazy expiry release persisted even though the capture failed.
    assert_eq!(available(&env, &alice).await, 100_00);
    assert_eq!(held(&env, &alice).await, 0);
    let hold = env.engine.store().get_hold(hold_id).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Expired);
}

#[tokio::test]
async fn sweeper_materializes_due_expiries() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    fund(&env, "alice", 100_00).await;

    let hold_id = create_hold(&env, &alice, 40_00, 1, "h1").await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let swept = env.engine.sweep_expired_holds(10).await.unwrap();
    assert_eq!(swept, 1);

    assert_eq!(available(&env, &alice).await, 100_00);
    let hold = env.engine.store().get_hold(hold_id).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Expired);

    // Nothing left to sweep.
    assert_eq!(env.engine.sweep_expired_holds(10).await.unwrap(), 0);
}

#[tokio::test]
async fn refunds_are_capped_by_the_capture() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let store = user(&env, "store").await;
    fund(&env, "alice", 200_00).await;

    let hold_id = create_hold(&env, &alice, 100_00, 600, "h1").await;
    let capture = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: None,
            },
        )
        .await
        .unwrap();
    let capture_entry_id = entry_id(&capture);
    assert_eq!(available(&env, &store).await, 100_00);

    // Partial refund from the store back to Alice.
    env.engine
        .submit(
            &store,
            &key("rf1"),
            Request::Refund {
                capture_entry_id,
                amount: Some(usd(30_00)),
            },
        )
        .await
        .unwrap();
    assert_eq!(available(&env, &store).await, 70_00);
    assert_eq!(available(&env, &alice).await, 130_00);

    // Over-refunding the remainder fails.
    let err = env
        .engine
        .submit(
            &store,
            &key("rf2"),
            Request::Refund {
                capture_entry_id,
                amount: Some(usd(80_00)),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::RefundExceedsCapture(capture_entry_id));

    // Defaulting refunds exactly the remainder.
    env.engine
        .submit(
            &store,
            &key("rf3"),
            Request::Refund {
                capture_entry_id,
                amount: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(available(&env, &store).await, 0);
    assert_eq!(available(&env, &alice).await, 200_00);

    let err = env
        .engine
        .submit(
            &store,
            &key("rf4"),
            Request::Refund {
                capture_entry_id,
                amount: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::RefundExceedsCapture(capture_entry_id));
}

#[tokio::test]
async fn only_the_capture_payee_may_refund() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    let mallory = user(&env, "mallory").await;
    fund(&env, "alice", 100_00).await;

    let hold_id = create_hold(&env, &alice, 50_00, 600, "h1").await;
    let capture = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: None,
            },
        )
        .await
        .unwrap();

    let err = env
        .engine
        .submit(
            &mallory,
            &key("rf"),
            Request::Refund {
                capture_entry_id: entry_id(&capture),
                amount: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::ForbiddenScope);
}

#[tokio::test]
async fn pagination_walks_newest_first() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 1000_00).await;

    for i in 0..5u64 {
        env.engine
            .submit(&alice, &key(&format!("t{}", i)), transfer_to("store", 1_00 + i))
            .await
            .unwrap();
    }

    // 5 transfers + 1 funding entry, newest first.
    let first_page = env.engine.list_transactions(&alice, None, 4).await.unwrap();
    assert_eq!(first_page.len(), 4);
    for pair in first_page.windows(2) {
        assert!(pair[0].id > pair[1].id);
    }

    let cursor = first_page.last().unwrap().id;
    let second_page = env
        .engine
        .list_transactions(&alice, Some(cursor), 4)
        .await
        .unwrap();
    assert_eq!(second_page.len(), 2);
    assert!(second_page[0].id < cursor);
}

#[tokio::test]
async fn capture_beyond_remaining_is_rejected() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let hold_id = create_hold(&env, &alice, 50_00, 600, "h1").await;
    let err = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: Some(usd(60_00)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(held(&env, &alice).await, 50_00);
}

#[tokio::test]
async fn released_hold_rejects_further_operations() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 100_00).await;

    let hold_id = create_hold(&env, &alice, 50_00, 600, "h1").await;
    env.engine
        .submit(&alice, &key("r1"), Request::HoldRelease { hold_id })
        .await
        .unwrap();

    let err = env
        .engine
        .submit(
            &alice,
            &key("c1"),
            Request::HoldCapture {
                hold_id,
                to: "@store".to_string(),
                amount: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::HoldNotActive(hold_id));
}

#[tokio::test]
async fn hold_accounting_closes_to_the_original_amount() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    let _store = user(&env, "store").await;
    fund(&env, "alice", 500_00).await;

    let hold_id = create_hold(&env, &alice, 100_00, 600, "h1").await;
    for (i, amount) in [30_00u64, 20_00].iter().enumerate() {
        env.engine
            .submit(
                &alice,
                &key(&format!("c{}", i)),
                Request::HoldCapture {
                    hold_id,
                    to: "@store".to_string(),
                    amount: Some(usd(*amount)),
                },
            )
            .await
            .unwrap();
    }
    env.engine
        .submit(&alice, &key("r1"), Request::HoldRelease { hold_id })
        .await
        .unwrap();

    // Terminal hold: the amounts captured and released against it must sum
    // to the original held amount.
    let hold = env.engine.store().get_hold(hold_id).await.unwrap().unwrap();
    assert!(hold.status.is_terminal());

    let account = env
        .engine
        .store()
        .accounts_for_wallet(alice.wallet)
        .await
        .unwrap()
        .remove(0);
    let entries = env
        .engine
        .store()
        .entries_for_account(account.id, None, 100)
        .await
        .unwrap();

    let mut closed = 0u64;
    for entry in entries
        .iter()
        .filter(|e| e.linked_entry == Some(hold.entry))
        .filter(|e| matches!(e.kind, EntryKind::Capture | EntryKind::Release))
    {
        let (_, lines) = env
            .engine
            .store()
            .get_entry(entry.id)
            .await
            .unwrap()
            .unwrap();
        closed += lines
            .iter()
            .find(|l| l.account == account.id && l.bucket == tallybook::Bucket::Held)
            .unwrap()
            .amount
            .minor_units();
    }
    assert_eq!(closed, hold.amount.minor_units());
    assert_eq!(available(&env, &alice).await, 450_00);
    assert_eq!(held(&env, &alice).await, 0);
}

#[tokio::test]
async fn self_transfer_is_rejected() {
    let env = setup().await;
    let alice = user(&env, "alice").await;
    fund(&env, "alice", 100_00).await;

    let err = env
        .engine
        .submit(&alice, &key("t"), transfer_to("alice", 10_00))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));
}

// ── Retry behavior ──────────────────────────────────────────────────────────

mod flaky {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tallybook::adapters::MemoryStore;
    use tallybook::{
        Account, AccountId, AccountStatus, EntryId, Hold, HoldId, IntentId, JournalEntry,
        JournalLine, LedgerError, LedgerStore, PaymentIntent, Refund, RefundId, StoreTx, Wallet,
        WalletId,
    };

    /// Fails the first `failures` commits with a serialization conflict so
    /// the executor's retry loop gets exercised.
    pub struct FlakyStore {
        pub inner: MemoryStore,
        pub failures: Arc<AtomicU32>,
    }

    struct FlakyTx {
        inner: Box<dyn StoreTx>,
        failures: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, LedgerError> {
            Ok(Box::new(FlakyTx {
                inner: self.inner.begin().await?,
                failures: Arc::clone(&self.failures),
            }))
        }

        async fn get_wallet(&self, id: WalletId) -> Result<Option<Wallet>, LedgerError> {
            self.inner.get_wallet(id).await
        }
        async fn find_wallet_by_handle(
            &self,
            handle: &str,
        ) -> Result<Option<Wallet>, LedgerError> {
            self.inner.find_wallet_by_handle(handle).await
        }
        async fn find_wallet_by_external_ref(
            &self,
            external_ref: &str,
        ) -> Result<Option<Wallet>, LedgerError> {
            self.inner.find_wallet_by_external_ref(external_ref).await
        }
        async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
            self.inner.get_account(id).await
        }
        async fn find_account(
            &self,
            wallet: WalletId,
            currency: &str,
        ) -> Result<Option<Account>, LedgerError> {
            self.inner.find_account(wallet, currency).await
        }
        async fn accounts_for_wallet(
            &self,
            wallet: WalletId,
        ) -> Result<Vec<Account>, LedgerError> {
            self.inner.accounts_for_wallet(wallet).await
        }
        async fn balance(&self, account: AccountId) -> Result<(i64, i64), LedgerError> {
            self.inner.balance(account).await
        }
        async fn get_entry(
            &self,
            id: EntryId,
        ) -> Result<Option<(JournalEntry, Vec<JournalLine>)>, LedgerError> {
            self.inner.get_entry(id).await
        }
        async fn entries_for_account(
            &self,
            account: AccountId,
            cursor: Option<EntryId>,
            limit: u32,
        ) -> Result<Vec<JournalEntry>, LedgerError> {
            self.inner.entries_for_account(account, cursor, limit).await
        }
        async fn get_hold(&self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
            self.inner.get_hold(id).await
        }
        async fn get_intent(&self, id: IntentId) -> Result<Option<PaymentIntent>, LedgerError> {
            self.inner.get_intent(id).await
        }
        async fn get_refund(&self, id: RefundId) -> Result<Option<Refund>, LedgerError> {
            self.inner.get_refund(id).await
        }
        async fn expired_active_holds(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> Result<Vec<HoldId>, LedgerError> {
            self.inner.expired_active_holds(now, limit).await
        }
        async fn insert_wallet(&self, wallet: &Wallet) -> Result<(), LedgerError> {
            self.inner.insert_wallet(wallet).await
        }
        async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
            self.inner.insert_account(account).await
        }
        async fn set_account_status(
            &self,
            id: AccountId,
            status: AccountStatus,
        ) -> Result<(), LedgerError> {
            self.inner.set_account_status(id, status).await
        }
    }

    #[async_trait]
    impl StoreTx for FlakyTx {
        async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
            self.inner.lock_account(id).await
        }
        async fn sum_buckets(&mut self, account: AccountId) -> Result<(i64, i64), LedgerError> {
            self.inner.sum_buckets(account).await
        }
        async fn insert_entry(
            &mut self,
            entry: &JournalEntry,
            lines: &[JournalLine],
        ) -> Result<(), LedgerError> {
            self.inner.insert_entry(entry, lines).await
        }
        async fn get_hold(&mut self, id: HoldId) -> Result<Option<Hold>, LedgerError> {
            self.inner.get_hold(id).await
        }
        async fn insert_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
            self.inner.insert_hold(hold).await
        }
        async fn update_hold(&mut self, hold: &Hold) -> Result<(), LedgerError> {
            self.inner.update_hold(hold).await
        }
        async fn get_intent(
            &mut self,
            id: IntentId,
        ) -> Result<Option<PaymentIntent>, LedgerError> {
            self.inner.get_intent(id).await
        }
        async fn insert_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
            self.inner.insert_intent(intent).await
        }
        async fn update_intent(&mut self, intent: &PaymentIntent) -> Result<(), LedgerError> {
            self.inner.update_intent(intent).await
        }
        async fn insert_refund(&mut self, refund: &Refund) -> Result<(), LedgerError> {
            self.inner.insert_refund(refund).await
        }
        async fn refunded_total(
            &mut self,
            capture: EntryId,
        ) -> Result<tallybook::Amount, LedgerError> {
            self.inner.refunded_total(capture).await
        }
        async fn outgoing_debits_since(
            &mut self,
            account: AccountId,
            since: DateTime<Utc>,
        ) -> Result<i64, LedgerError> {
            self.inner.outgoing_debits_since(account, since).await
        }
        async fn idempotency_reserve(
            &mut self,
            scope: tallybook::ApiKeyId,
            key: &tallybook::IdempotencyKey,
            fingerprint: &str,
        ) -> Result<tallybook::Reservation, LedgerError> {
            self.inner.idempotency_reserve(scope, key, fingerprint).await
        }
        async fn idempotency_complete(
            &mut self,
            scope: tallybook::ApiKeyId,
            key: &tallybook::IdempotencyKey,
            outcome: &tallybook::Outcome,
        ) -> Result<(), LedgerError> {
            self.inner.idempotency_complete(scope, key, outcome).await
        }
        async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
            let this = *self;
            if this
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                this.inner.rollback().await?;
                return Err(LedgerError::TransientConflict);
            }
            this.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
            let this = *self;
            this.inner.rollback().await
        }
    }
}

#[tokio::test]
async fn serialization_conflicts_are_retried_and_succeed() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let failures = Arc::new(AtomicU32::new(0));
    let store = flaky::FlakyStore {
        inner: MemoryStore::new(),
        failures: Arc::clone(&failures),
    };
    let engine = LedgerEngine::new(Box::new(store));

    let (treasury_wallet, _) = engine
        .create_wallet(NewWallet::system("USD treasury", "USD"))
        .await
        .unwrap();
    let treasury = ApiKey::unrestricted(treasury_wallet.id);
    let (alice_wallet, _) = engine
        .create_wallet(NewWallet::user("alice", "USD"))
        .await
        .unwrap();
    let alice = ApiKey::unrestricted(alice_wallet.id);

    engine
        .submit(&treasury, &key("fund"), transfer_to("alice", 100_00))
        .await
        .unwrap();

    // Two conflicted commits, then success on the third attempt.
    failures.store(2, Ordering::SeqCst);
    let (store_wallet, _) = engine
        .create_wallet(NewWallet::user("store", "USD"))
        .await
        .unwrap();
    let store_key = ApiKey::unrestricted(store_wallet.id);

    engine
        .submit(&alice, &key("t"), transfer_to("store", 25_00))
        .await
        .unwrap();
    assert_eq!(engine.get_balance(&alice).await.unwrap().available, 75_00);
    assert_eq!(engine.get_balance(&store_key).await.unwrap().available, 25_00);
}

#[tokio::test]
async fn conflicts_past_the_retry_budget_surface() {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    let failures = Arc::new(AtomicU32::new(100));
    let store = flaky::FlakyStore {
        inner: MemoryStore::new(),
        failures,
    };
    let engine = LedgerEngine::new(Box::new(store));

    let (treasury_wallet, _) = engine
        .create_wallet(NewWallet::system("USD treasury", "USD"))
        .await
        .unwrap();
    let treasury = ApiKey::unrestricted(treasury_wallet.id);
    engine
        .create_wallet(NewWallet::user("alice", "USD"))
        .await
        .unwrap();

    let err = engine
        .submit(&treasury, &key("fund"), transfer_to("alice", 100_00))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::TransientConflict);
}
