//! Single-Flight Population Tests
//!
//! Concurrent readers of one key share a single population attempt, made
//! with the factory of whichever reader got there first.

mod support;

use depot_cache::{Depot, QueueConfig, SharedFactory, Timeout};
use depot_test_utils::{init_tracing, CancellingFactory, CountingFactory, GatedFactory};
use std::sync::Arc;
use std::time::Duration;
use support::{eventually, within, PATIENCE};

const WAIT: Timeout = Timeout::After(Duration::from_secs(5));

fn bare_depot() -> Depot<u32, String> {
    Depot::builder().timeout(WAIT).build().expect("depot builds")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_factory_wins_for_concurrent_callers() {
    init_tracing();
    let depot = bare_depot();
    let slow = Arc::new(GatedFactory::new(|_: &u32| Some("slow".to_string())));
    let fast = Arc::new(CountingFactory::new(|_: &u32| Some("fast".to_string())));

    let first = {
        let depot = depot.clone();
        let slow: SharedFactory<u32, String> = slow.clone();
        tokio::spawn(async move { depot.get_with(&slow, &7).await })
    };
    within(PATIENCE, slow.wait_started(1)).await;

    let followers: Vec<_> = (0..8)
        .map(|_| {
            let depot = depot.clone();
            let fast: SharedFactory<u32, String> = fast.clone();
            tokio::spawn(async move { depot.get_with(&fast, &7).await })
        })
        .collect();
    // Give the followers time to join the population in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(depot.in_flight(), 1);
    slow.open();

    assert_eq!(
        within(PATIENCE, first).await.unwrap().unwrap(),
        Some("slow".to_string())
    );
    for follower in followers {
        assert_eq!(
            within(PATIENCE, follower).await.unwrap().unwrap(),
            Some("slow".to_string())
        );
    }
    assert_eq!(slow.started(), 1);
    assert_eq!(fast.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retriever_is_released_after_resolution() {
    init_tracing();
    let depot = bare_depot();
    let factory = Arc::new(CountingFactory::new(|k: &u32| Some(k.to_string())));
    let shared: SharedFactory<u32, String> = factory.clone();

    assert_eq!(depot.get_with(&shared, &1).await.unwrap(), Some("1".to_string()));
    assert!(eventually(PATIENCE, || depot.in_flight() == 0).await);

    // A later miss starts a new attempt instead of reusing the settled one.
    depot.invalidate(&1);
    assert_eq!(depot.get_with(&shared, &1).await.unwrap(), Some("1".to_string()));
    assert_eq!(factory.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_resolves_waiters_and_wins_over_factory() {
    init_tracing();
    let depot = bare_depot();
    let gated = Arc::new(GatedFactory::new(|_: &u32| Some("factory".to_string())));

    let waiter = {
        let depot = depot.clone();
        let gated: SharedFactory<u32, String> = gated.clone();
        tokio::spawn(async move { depot.get_with(&gated, &3).await })
    };
    within(PATIENCE, gated.wait_started(1)).await;

    depot.put(3, Some("put".to_string()));
    assert_eq!(
        within(PATIENCE, waiter).await.unwrap().unwrap(),
        Some("put".to_string())
    );

    gated.open();
    assert!(eventually(PATIENCE, || depot.queue_stats().serviced == 1).await);
    let entry = depot.peek_wrapped(&3).expect("entry");
    assert_eq!(entry.value(), Some(&"put".to_string()));
    assert_eq!(entry.version(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_releases_waiters_without_caching() {
    init_tracing();
    let depot = bare_depot();
    let gated = Arc::new(GatedFactory::new(|_: &u32| Some("late".to_string())));

    let waiter = {
        let depot = depot.clone();
        let gated: SharedFactory<u32, String> = gated.clone();
        tokio::spawn(async move { depot.get_with_timeout(&gated, &5, Timeout::Forever).await })
    };
    within(PATIENCE, gated.wait_started(1)).await;

    assert!(depot.cancel(&5));
    assert_eq!(within(PATIENCE, waiter).await.unwrap().unwrap(), None);
    assert!(!depot.cancel(&5));

    gated.open();
    assert!(eventually(PATIENCE, || depot.queue_stats().serviced == 1).await);
    assert!(!depot.contains_key(&5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_releases_waiters_of_queued_job() {
    init_tracing();
    let depot: Depot<u32, String> = Depot::builder()
        .queue(QueueConfig::new().with_workers(1).with_max_queued(1))
        .timeout(WAIT)
        .build()
        .expect("depot builds");
    let busy = Arc::new(GatedFactory::new(|_: &u32| Some("busy".to_string())));
    let busy_shared: SharedFactory<u32, String> = busy.clone();
    depot.get_with_timeout(&busy_shared, &0, Timeout::Immediate).await.unwrap();
    within(PATIENCE, busy.wait_started(1)).await;

    let factory = Arc::new(CountingFactory::new(|k: &u32| Some(k.to_string())));
    let shared: SharedFactory<u32, String> = factory.clone();
    let waiter = {
        let depot = depot.clone();
        let shared = shared.clone();
        tokio::spawn(async move { depot.get_with_timeout(&shared, &1, Timeout::Forever).await })
    };
    assert!(eventually(PATIENCE, || depot.queue_stats().queued == 1).await);

    assert!(depot.cancel(&1));
    assert_eq!(within(PATIENCE, waiter).await.unwrap().unwrap(), None);
    let stats = depot.queue_stats();
    assert_eq!((stats.queued, stats.cancelled), (0, 1));
    assert!(eventually(PATIENCE, || depot.in_flight() == 1).await);

    // A bounded caller for another key takes the freed slot.
    let next = {
        let depot = depot.clone();
        let shared = shared.clone();
        tokio::spawn(async move { depot.get_with(&shared, &2).await })
    };
    assert!(eventually(PATIENCE, || depot.queue_stats().queued == 1).await);
    assert_eq!(depot.queue_stats().rejected, 0);
    busy.open();

    assert_eq!(
        within(PATIENCE, next).await.unwrap().unwrap(),
        Some("2".to_string())
    );
    assert_eq!(factory.calls(), 1);
    assert!(!depot.contains_key(&1));
}

#[tokio::test]
async fn test_cancelled_population_falls_back_to_stale() {
    init_tracing();
    let depot = bare_depot();
    let cancelling = Arc::new(CancellingFactory::new());
    let shared: SharedFactory<u32, String> = cancelling.clone();

    depot.put(9, Some("old".to_string()));
    depot.invalidate(&9);

    assert_eq!(depot.get_with(&shared, &9).await.unwrap(), Some("old".to_string()));
    assert_eq!(cancelling.calls(), 1);
    assert!(depot.invalid_contains_key(&9));

    // Nothing stale to fall back to: the caller gets nothing, and nothing is cached.
    assert_eq!(depot.get_with(&shared, &10).await.unwrap(), None);
    assert!(!depot.contains_key(&10));
}
