//! Integration tests for the resource lock service

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sepa_batch_engine::core::{AdvancingSleeper, ManualClock, SystemClock, ThreadSleeper};
use sepa_batch_engine::lock::{
    batch_resource_key, LockConfig, LockError, LockType, ResourceLockService,
};
use sepa_batch_engine::store::MemoryStore;

fn fast_config() -> LockConfig {
    LockConfig {
        acquisition_timeout: Duration::from_millis(300),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        ..LockConfig::default()
    }
}

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ))
}

#[test]
fn mutual_exclusion_between_sessions() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    let sleeper = Arc::new(AdvancingSleeper::new(Arc::clone(&clock)));

    let session_a = ResourceLockService::new(
        Arc::clone(&store),
        Arc::clone(&clock) as _,
        Arc::clone(&sleeper) as _,
        LockConfig::default(),
        1,
    )
    .with_session("session-a");
    let session_b = ResourceLockService::new(
        Arc::clone(&store),
        Arc::clone(&clock) as _,
        sleeper as _,
        LockConfig::default(),
        2,
    )
    .with_session("session-b");

    let key = batch_resource_key(&["SI-001".to_string(), "SI-002".to_string()]);
    let guard = session_a
        .acquire(&key, LockType::BatchCreation, serde_json::json!({}))
        .unwrap();

    // Second session must not get the same resource while the lease holds
    match session_b.acquire(&key, LockType::BatchCreation, serde_json::json!({})) {
        Err(LockError::Timeout { holder, .. }) => assert_eq!(holder, "session-a"),
        Err(other) => panic!("expected timeout, got {other:?}"),
        Ok(_) => panic!("expected timeout, lock was acquired"),
    }

    // After release the resource is free
    guard.release().unwrap();
    let guard_b = session_b
        .acquire(&key, LockType::BatchCreation, serde_json::json!({}))
        .unwrap();
    guard_b.release().unwrap();
}

#[test]
fn contention_resolves_across_threads() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);

    let make = |name: &str, seed| {
        ResourceLockService::new(
            Arc::clone(&store),
            Arc::clone(&clock) as _,
            Arc::new(ThreadSleeper) as _,
            fast_config(),
            seed,
        )
        .with_session(name)
    };
    let a = make("thread-a", 1);
    let b = make("thread-b", 2);

    // Short hold in one thread; the other should acquire after release
    std::thread::scope(|scope| {
        let handle = scope.spawn(|| {
            let guard = a
                .acquire("shared", LockType::BatchCreation, serde_json::json!({}))
                .unwrap();
            std::thread::sleep(Duration::from_millis(50));
            guard.release().unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        let guard = b
            .acquire("shared", LockType::BatchCreation, serde_json::json!({}))
            .unwrap();
        guard.release().unwrap();
        handle.join().unwrap();
    });
}

#[test]
fn expired_lease_recovers_without_sweeper() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    let sleeper = Arc::new(AdvancingSleeper::new(Arc::clone(&clock)));
    let locks = ResourceLockService::new(
        Arc::clone(&store),
        Arc::clone(&clock) as _,
        sleeper as _,
        LockConfig::default(),
        3,
    );

    let guard = locks
        .acquire("res", LockType::BatchCreation, serde_json::json!({}))
        .unwrap();
    // Simulate a crashed holder: the guard never releases
    std::mem::forget(guard);

    // Batch-creation lease is 600s; one second past it the resource is free
    clock.advance(Duration::from_secs(601));
    let guard = locks
        .acquire("res", LockType::BatchCreation, serde_json::json!({}))
        .unwrap();
    guard.release().unwrap();
}

#[test]
fn status_reflects_holder_and_metadata_lifetime() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    let sleeper = Arc::new(AdvancingSleeper::new(Arc::clone(&clock)));
    let locks = ResourceLockService::new(
        Arc::clone(&store),
        Arc::clone(&clock) as _,
        sleeper as _,
        LockConfig::default(),
        4,
    )
    .with_session("session-x");

    assert!(!locks.lock_status("res").unwrap().locked);

    let guard = locks
        .acquire(
            "res",
            LockType::InvoiceProcessing,
            serde_json::json!({ "invoice_count": 3 }),
        )
        .unwrap();
    let status = locks.lock_status("res").unwrap();
    assert!(status.locked);
    assert_eq!(status.holder.as_deref(), Some("session-x"));
    assert_eq!(status.lock_type, Some(LockType::InvoiceProcessing));

    guard.release().unwrap();
    assert!(!locks.lock_status("res").unwrap().locked);
}

#[test]
fn sweep_reports_expired_and_purged() {
    let store = Arc::new(MemoryStore::new());
    let clock = manual_clock();
    let sleeper = Arc::new(AdvancingSleeper::new(Arc::clone(&clock)));
    let locks = ResourceLockService::new(
        Arc::clone(&store),
        Arc::clone(&clock) as _,
        sleeper as _,
        LockConfig::default(),
        5,
    );

    // One lock left to expire, one released long ago
    let abandoned = locks
        .acquire("res-a", LockType::BatchCreation, serde_json::json!({}))
        .unwrap();
    std::mem::forget(abandoned);
    let released = locks
        .acquire("res-b", LockType::BatchCreation, serde_json::json!({}))
        .unwrap();
    released.release().unwrap();

    clock.advance(Duration::from_secs(25 * 3600));
    let (expired, purged) = locks.sweep().unwrap();
    assert_eq!(expired, 1);
    // Both rows are now inactive and past retention; res-a was just
    // deactivated this sweep so only res-b is old enough to purge
    assert_eq!(purged, 1);
}
