//! Integration tests for the account pool and lock manager.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::pool_with;

#[tokio::test]
async fn locked_account_is_never_returned() {
    // No give-up mode: the pool may briefly wait out the release jitter.
    let pool = pool_with(&["alice", "bob"], false).await;
    let future = Utc::now().timestamp() + 3600;
    pool.store()
        .lock_until("alice", "SearchTimeline", future, 0)
        .await
        .unwrap();

    // Only bob is eligible; repeated borrows never see alice.
    for _ in 0..3 {
        let borrow = pool
            .get_for_queue_or_wait("SearchTimeline")
            .await
            .unwrap()
            .expect("bob should be available");
        assert_eq!(borrow.username(), "bob");
        borrow.release(0).await.unwrap();
    }
}

#[tokio::test]
async fn give_up_mode_returns_none_when_everything_is_locked() {
    let pool = pool_with(&["alice"], true).await;
    pool.store()
        .lock_until("alice", "q", Utc::now().timestamp() + 3600, 0)
        .await
        .unwrap();
    assert!(pool.get_for_queue_or_wait("q").await.unwrap().is_none());
}

#[tokio::test]
async fn give_up_mode_returns_none_for_empty_pool() {
    let pool = pool_with(&[], true).await;
    assert!(pool.get_for_queue_or_wait("q").await.unwrap().is_none());
}

#[tokio::test]
async fn borrow_is_exclusive_per_queue() {
    let pool = pool_with(&["alice", "bob"], true).await;

    let first = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    let second = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    assert_ne!(first.username(), second.username());

    // Both borrowed, nothing left for a third caller.
    assert!(pool.get_for_queue_or_wait("q").await.unwrap().is_none());

    // The same account can still serve a different queue.
    let other_queue = pool.get_for_queue_or_wait("other").await.unwrap();
    assert!(other_queue.is_some());
}

#[tokio::test]
async fn waiter_wakes_when_borrow_is_released() {
    let pool = pool_with(&["alice"], false).await;
    let borrow = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();

    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.get_for_queue_or_wait("q").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    borrow.release(0).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should wake after release")
        .unwrap()
        .unwrap()
        .expect("waiter should get the account");
    assert_eq!(got.username(), "alice");
}

#[tokio::test]
async fn dropping_a_borrow_frees_it_without_penalty() {
    let pool = pool_with(&["alice"], true).await;
    let before = Utc::now().timestamp();

    let borrow = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    assert!(pool.is_borrowed("alice", "q"));
    drop(borrow);

    // The in-memory borrow is freed synchronously.
    assert!(!pool.is_borrowed("alice", "q"));

    // The spawned unlock lands shortly after; no penalty window, no charge.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let at = pool.store().unlock_at("alice", "q").await.unwrap();
    assert!(at <= before + 5, "drop must not apply a penalty lock");
    assert_eq!(pool.store().req_count("alice", "q").await.unwrap(), 0);
}

#[tokio::test]
async fn release_until_applies_the_penalty_window() {
    let pool = pool_with(&["alice"], true).await;
    let borrow = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();

    let until = Utc::now().timestamp() + 900;
    borrow.release_until(until, 4).await.unwrap();

    assert!(!pool.is_borrowed("alice", "q"));
    assert_eq!(pool.store().unlock_at("alice", "q").await.unwrap(), until);
    assert_eq!(pool.store().req_count("alice", "q").await.unwrap(), 4);
    assert!(pool.get_for_queue_or_wait("q").await.unwrap().is_none());
}

#[tokio::test]
async fn release_inactive_deactivates_durably() {
    let pool = pool_with(&["alice"], true).await;
    let borrow = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    borrow.release_inactive(Some("(326) denied")).await.unwrap();

    let acc = pool.store().get("alice").await.unwrap().unwrap();
    assert!(!acc.active);
    assert_eq!(acc.error_msg.as_deref(), Some("(326) denied"));
    assert!(pool.get_for_queue_or_wait("q").await.unwrap().is_none());
}

#[tokio::test]
async fn mark_inactive_frees_live_borrows() {
    let pool = pool_with(&["alice"], false).await;
    let _borrow = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    assert!(pool.is_borrowed("alice", "q"));

    pool.mark_inactive("alice", Some("expired")).await.unwrap();
    assert!(!pool.is_borrowed("alice", "q"));
    let acc = pool.store().get("alice").await.unwrap().unwrap();
    assert!(!acc.active);
}

#[tokio::test]
async fn selection_rotates_by_last_used() {
    let pool = pool_with(&["alice", "bob"], true).await;

    let first = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    let first_name = first.username().to_string();
    first.release(1).await.unwrap();

    // The just-released account has the newest last_used; the other one is
    // preferred next.
    let second = pool.get_for_queue_or_wait("q").await.unwrap().unwrap();
    assert_ne!(second.username(), first_name);
    second.release(1).await.unwrap();
}
