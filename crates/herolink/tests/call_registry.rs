//! Integration tests for keyed call orchestration.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use herolink::{
    CacheStore, CallError, CallKey, CallOptions, CallRegistry, CallState, CallStatus,
    call::CANCELLED_MESSAGE,
};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep, timeout};

fn key(name: &str) -> CallKey {
    CallKey::new(name).unwrap()
}

fn record_states<T: Clone + Send + Sync + 'static>(
    registry: &CallRegistry<T>,
    key: &CallKey,
) -> (Arc<Mutex<Vec<CallState<T>>>>, herolink::Subscription) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let sub = registry.subscribe(key, move |state: &CallState<T>| sink.lock().push(state.clone()));
    (states, sub)
}

/// Paused-clock timestamps land on millisecond ticks.
fn assert_elapsed(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual - expected < Duration::from_millis(5),
        "expected ~{expected:?}, got {actual:?}"
    );
}

fn statuses<T>(states: &Mutex<Vec<CallState<T>>>) -> Vec<CallStatus> {
    states.lock().iter().map(|s| s.status).collect()
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_execute_rejected_while_loading() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("daily-reward");
    let calls = Arc::new(AtomicUsize::new(0));

    let first = {
        let registry = registry.clone();
        let k = k.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            registry
                .execute(
                    &k,
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async {
                            sleep(Duration::from_millis(100)).await;
                            Ok(1)
                        }
                    },
                    CallOptions::new(),
                )
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(registry.get_state(&k).status, CallStatus::Loading);

    let second_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&second_calls);
    let second = registry
        .execute(
            &k,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(2) }
            },
            CallOptions::new(),
        )
        .await;

    assert!(matches!(second, Err(CallError::InProgress { .. })));
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.get_state(&k).data, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_run_independently() {
    let registry: CallRegistry<&'static str> = CallRegistry::new();
    let a = key("a");
    let b = key("b");

    let (ra, rb) = tokio::join!(
        registry.execute(
            &a,
            || async {
                sleep(Duration::from_millis(50)).await;
                Ok("a")
            },
            CallOptions::new(),
        ),
        registry.execute(&b, || async { Ok("b") }, CallOptions::new()),
    );
    assert_eq!(ra.unwrap(), "a");
    assert_eq!(rb.unwrap(), "b");
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_and_exhaustion() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("leaderboard");
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    let log = Arc::clone(&attempts);
    let result = registry
        .execute(
            &k,
            move || {
                log.lock().push(start.elapsed());
                async { Err(CallError::network("connection reset")) }
            },
            CallOptions::new(),
        )
        .await;

    let attempts = attempts.lock().clone();
    let expected = [0, 1000, 3000, 7000].map(Duration::from_millis);
    assert_eq!(attempts.len(), expected.len());
    for (actual, expected) in attempts.into_iter().zip(expected) {
        assert_elapsed(actual, expected);
    }

    match result {
        Err(CallError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 4);
            assert!(matches!(*source, CallError::Network { .. }));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let state = registry.get_state(&k);
    assert_eq!(state.status, CallStatus::Error);
    assert_eq!(state.error.as_deref(), Some("connection reset"));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("summon");
    let calls = Arc::new(AtomicUsize::new(0));
    let reported = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&calls);
    let sink = Arc::clone(&reported);
    let result = registry
        .execute(
            &k,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::from_status(403, r#"{"error":"forbidden"}"#)) }
            },
            CallOptions::new().on_error(move |err| *sink.lock() = err.status()),
        )
        .await;

    assert!(matches!(result, Err(CallError::Client { status: 403, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*reported.lock(), Some(403));
    assert_eq!(registry.get_state(&k).error.as_deref(), Some("forbidden"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("profile");
    let (states, _sub) = record_states(&registry, &k);
    let calls = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let counter = Arc::clone(&calls);
    let success_counter = Arc::clone(&successes);
    let result = registry
        .execute(
            &k,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CallError::from_status(500, "busy"))
                    } else {
                        Ok(42)
                    }
                }
            },
            CallOptions::new().on_success(move |_| {
                success_counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_elapsed(start.elapsed(), Duration::from_millis(3000));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    // Retries happen inside Loading; listeners see no intermediate states.
    assert_eq!(
        statuses(&states),
        vec![CallStatus::Idle, CallStatus::Loading, CallStatus::Success]
    );
    assert_eq!(states.lock().last().unwrap().data, Some(42));
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_options() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("inventory");
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let counter = Arc::clone(&calls);
    let result = registry
        .execute(
            &k,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::from_status(502, "")) }
            },
            CallOptions::new()
                .max_retries(1)
                .retry_delay(Duration::from_millis(250)),
        )
        .await;

    assert!(matches!(
        result,
        Err(CallError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_elapsed(start.elapsed(), Duration::from_millis(250));
    assert_eq!(
        registry.get_state(&k).error.as_deref(),
        Some("Unknown error occurred")
    );
}

// ============================================================================
// Cancellation and reset
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("guild");
    let calls = Arc::new(AtomicUsize::new(0));

    let task = {
        let registry = registry.clone();
        let k = k.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            registry
                .execute(
                    &k,
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err(CallError::from_status(500, "")) }
                    },
                    CallOptions::new(),
                )
                .await
        })
    };

    sleep(Duration::from_millis(500)).await;
    assert_eq!(registry.get_state(&k).status, CallStatus::Loading);
    assert!(registry.cancel(&k));

    let result = task.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = registry.get_state(&k);
    assert_eq!(state.status, CallStatus::Idle);
    assert_eq!(state.error.as_deref(), Some("Request cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_late_result_after_cancel_is_discarded() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("mail");
    let (states, _sub) = record_states(&registry, &k);

    let task = {
        let registry = registry.clone();
        let k = k.clone();
        tokio::spawn(async move {
            registry
                .execute(
                    &k,
                    || async {
                        sleep(Duration::from_secs(1)).await;
                        Ok(5)
                    },
                    CallOptions::new(),
                )
                .await
        })
    };

    sleep(Duration::from_millis(500)).await;
    registry.cancel(&k);
    assert!(matches!(task.await.unwrap(), Err(CallError::Cancelled)));

    sleep(Duration::from_secs(2)).await;
    let state = registry.get_state(&k);
    assert_eq!(state.status, CallStatus::Idle);
    assert_eq!(state.data, None);
    assert_eq!(
        statuses(&states),
        vec![CallStatus::Idle, CallStatus::Loading, CallStatus::Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_when_not_loading_is_noop() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("quests");
    let (states, _sub) = record_states(&registry, &k);

    assert!(!registry.cancel(&k));
    assert_eq!(statuses(&states), vec![CallStatus::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_loading_allows_new_execute() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("shop");

    let task = {
        let registry = registry.clone();
        let k = k.clone();
        tokio::spawn(async move {
            registry
                .execute(
                    &k,
                    || async {
                        sleep(Duration::from_secs(1)).await;
                        Ok(1)
                    },
                    CallOptions::new(),
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    registry.reset(&k);
    assert_eq!(registry.get_state(&k), CallState::default());

    let fresh = registry
        .execute(&k, || async { Ok(2) }, CallOptions::new())
        .await;
    assert_eq!(fresh.unwrap(), 2);
    assert!(matches!(task.await.unwrap(), Err(CallError::Cancelled)));
    assert_eq!(registry.get_state(&k).data, Some(2));
}

// ============================================================================
// Cache and refresh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dropped_execute_releases_key() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("profile");
    let (states, _sub) = record_states(&registry, &k);

    let abandoned = timeout(
        Duration::from_millis(10),
        registry.execute(
            &k,
            || async {
                sleep(Duration::from_secs(60)).await;
                Ok(1)
            },
            CallOptions::new(),
        ),
    )
    .await;
    assert!(abandoned.is_err());

    let state = registry.get_state(&k);
    assert_eq!(state.status, CallStatus::Idle);
    assert_eq!(state.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(
        statuses(&states),
        vec![CallStatus::Idle, CallStatus::Loading, CallStatus::Idle]
    );

    let next = registry
        .execute(&k, || async { Ok(2) }, CallOptions::new())
        .await;
    assert_eq!(next.unwrap(), 2);
    assert_eq!(registry.get_state(&k).status, CallStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_bypasses_cache() {
    let cache = Arc::new(CacheStore::new(Duration::from_secs(60)));
    let registry: CallRegistry<u32> = CallRegistry::with_cache(Arc::clone(&cache));
    let k = key("heroes");
    let fetches = Arc::new(AtomicUsize::new(0));

    let work = |registry: CallRegistry<u32>, fetches: Arc<AtomicUsize>| {
        move || {
            let registry = registry.clone();
            let fetches = Arc::clone(&fetches);
            async move {
                registry
                    .cache()
                    .get_or_fetch("heroes", || async {
                        Ok::<_, CallError>(fetches.fetch_add(1, Ordering::SeqCst) as u32 + 10)
                    })
                    .await
            }
        }
    };

    let first = registry
        .execute(&k, work(registry.clone(), Arc::clone(&fetches)), CallOptions::new())
        .await
        .unwrap();
    let cached = registry
        .execute(&k, work(registry.clone(), Arc::clone(&fetches)), CallOptions::new())
        .await
        .unwrap();
    assert_eq!((first, cached), (10, 10));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let refreshed = registry
        .refresh(&k, work(registry.clone(), Arc::clone(&fetches)), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(refreshed, 11);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get("heroes"), Some(11));
}

#[tokio::test(start_paused = true)]
async fn test_listener_order_is_registration_order() {
    let registry: CallRegistry<u32> = CallRegistry::new();
    let k = key("arena");
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&log);
    let _a = registry.subscribe(&k, move |s: &CallState<u32>| first.lock().push(("a", s.status)));
    let second = Arc::clone(&log);
    let _b = registry.subscribe(&k, move |s: &CallState<u32>| second.lock().push(("b", s.status)));

    registry
        .execute(&k, || async { Ok(1) }, CallOptions::new())
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            ("a", CallStatus::Idle),
            ("b", CallStatus::Idle),
            ("a", CallStatus::Loading),
            ("b", CallStatus::Loading),
            ("a", CallStatus::Success),
            ("b", CallStatus::Success),
        ]
    );
}
