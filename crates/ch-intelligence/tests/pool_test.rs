//! Backend pool behaviour: registration, eligibility, single and parallel
//! execution, stats bookkeeping and retry backoff.

use std::sync::Arc;
use std::time::Duration;

use ch_core::config::BackendConfig;
use ch_intelligence::capability::{Backend, GenerationError, GenerationParams};
use ch_intelligence::mock::{MockBackend, MockReply};
use ch_intelligence::pool::{BackendPool, PoolError, Targets};

fn config(name: &str) -> BackendConfig {
    BackendConfig::new(name, format!("mock-{name}")).with_retry(1, Duration::from_millis(1))
}

fn ok_mock(name: &str) -> Arc<MockBackend> {
    Arc::new(MockBackend::new(config(name)))
}

fn failing_mock(name: &str) -> Arc<MockBackend> {
    Arc::new(MockBackend::new(config(name)).failing("provider unavailable"))
}

async fn pool_with(mocks: &[Arc<MockBackend>]) -> BackendPool {
    let pool = BackendPool::new();
    for mock in mocks {
        pool.register(mock.clone()).await.unwrap();
    }
    pool
}

// ===========================================================================
// Registration
// ===========================================================================

#[tokio::test]
async fn register_and_list_alphabetically() {
    let pool = pool_with(&[ok_mock("gamma"), ok_mock("alpha"), ok_mock("beta")]).await;
    assert_eq!(pool.list_backends(false).await, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn register_invalid_config_fails_before_insertion() {
    let pool = BackendPool::new();
    let bad = Arc::new(MockBackend::new(
        BackendConfig::new("bad", "m").with_limits(1000, 4000),
    ));
    let err = pool.register(bad).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    assert!(pool.list_backends(false).await.is_empty());
    assert!(matches!(
        pool.stats("bad").await,
        Err(PoolError::UnknownBackend(_))
    ));
}

#[tokio::test]
async fn register_empty_name_fails() {
    let pool = BackendPool::new();
    let err = pool
        .register(Arc::new(MockBackend::new(BackendConfig::new("", "m"))))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

#[tokio::test]
async fn register_duplicate_name_fails() {
    let pool = pool_with(&[ok_mock("a")]).await;
    let err = pool.register(ok_mock("a")).await.unwrap_err();
    assert!(matches!(err, PoolError::DuplicateBackend(name) if name == "a"));
    assert_eq!(pool.list_backends(false).await.len(), 1);
}

#[tokio::test]
async fn backend_wrapper_validates_eagerly() {
    let adapter = Arc::new(MockBackend::new(BackendConfig::new("x", " ")));
    assert!(Backend::new(adapter).is_err());
}

#[tokio::test]
async fn unregister_discards_stats() {
    let pool = pool_with(&[ok_mock("a")]).await;
    pool.execute_single("a", "p", &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(pool.stats("a").await.unwrap().total_requests, 1);

    pool.unregister("a").await.unwrap();
    assert!(matches!(
        pool.stats("a").await,
        Err(PoolError::UnknownBackend(_))
    ));

    // Re-registering starts from zero.
    pool.register(ok_mock("a")).await.unwrap();
    assert_eq!(pool.stats("a").await.unwrap().total_requests, 0);
}

#[tokio::test]
async fn unregister_unknown_fails() {
    let pool = BackendPool::new();
    assert!(matches!(
        pool.unregister("ghost").await,
        Err(PoolError::UnknownBackend(_))
    ));
}

// ===========================================================================
// Enable / disable
// ===========================================================================

#[tokio::test]
async fn disabled_backend_is_not_eligible() {
    let a = ok_mock("a");
    let b = ok_mock("b");
    let pool = pool_with(&[a.clone(), b.clone()]).await;
    pool.disable("b").await.unwrap();

    assert!(!pool.is_enabled("b").await.unwrap());
    assert_eq!(pool.list_backends(true).await, vec!["a"]);
    assert_eq!(pool.list_backends(false).await, vec!["a", "b"]);

    let err = pool
        .execute_single("b", "p", &GenerationParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::BackendDisabled(_)));

    let result = pool
        .execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(result.responses.len(), 1);
    assert_eq!(b.call_count(), 0);

    pool.enable("b").await.unwrap();
    assert_eq!(pool.list_backends(true).await, vec!["a", "b"]);
}

#[tokio::test]
async fn disabled_by_config_starts_ineligible() {
    let pool = BackendPool::new();
    let mut cfg = config("off");
    cfg.enabled = false;
    pool.register(Arc::new(MockBackend::new(cfg))).await.unwrap();
    assert!(!pool.is_enabled("off").await.unwrap());
}

#[tokio::test]
async fn unknown_backend_errors() {
    let pool = BackendPool::new();
    assert!(matches!(
        pool.execute_single("ghost", "p", &GenerationParams::default())
            .await,
        Err(PoolError::UnknownBackend(_))
    ));
    assert!(matches!(
        pool.disable("ghost").await,
        Err(PoolError::UnknownBackend(_))
    ));
}

// ===========================================================================
// execute_single
// ===========================================================================

#[tokio::test]
async fn execute_single_success_updates_stats_and_usage() {
    let mock = Arc::new(
        MockBackend::new(config("a"))
            .with_reply(MockReply::new("hello").with_tokens(60, 40).with_cost(0.01)),
    );
    let pool = pool_with(&[mock.clone()]).await;

    let response = pool
        .execute_single("a", "prompt", &GenerationParams::default())
        .await
        .unwrap();
    assert!(response.success());
    assert_eq!(response.content, "hello");
    assert_eq!(response.backend, "a");
    assert_eq!(response.total_tokens(), 100);

    let stats = pool.stats("a").await.unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.total_tokens(), 100);
    assert!((stats.total_cost - 0.01).abs() < 1e-9);

    let usage = pool.backend("a").await.unwrap().usage();
    assert_eq!(usage.requests, 1);
    assert_eq!(usage.total_tokens(), 100);
    assert_eq!(mock.calls()[0].prompt, "prompt");
}

#[tokio::test]
async fn execute_single_failure_is_captured() {
    let pool = pool_with(&[failing_mock("down")]).await;
    let response = pool
        .execute_single("down", "p", &GenerationParams::default())
        .await
        .expect("backend failure is data, not an error");

    assert!(!response.success());
    assert!(!response.error.as_deref().unwrap_or_default().is_empty());
    assert_eq!(response.total_tokens(), 0);
    assert_eq!(response.cost, 0.0);

    let stats = pool.stats("down").await.unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.successful_requests, 0);

    // Backend-level usage only counts successes.
    assert_eq!(pool.backend("down").await.unwrap().usage().requests, 0);
}

// ===========================================================================
// execute_parallel
// ===========================================================================

#[tokio::test]
async fn parallel_all_enabled_returns_every_backend_in_order() {
    let pool = pool_with(&[ok_mock("c"), ok_mock("a"), ok_mock("b")]).await;
    let result = pool
        .execute_parallel("prompt", &Targets::AllEnabled, &GenerationParams::default())
        .await
        .unwrap();

    let names: Vec<_> = result.responses.iter().map(|r| r.backend.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(result.responses.iter().all(|r| r.success()));
    assert_eq!(result.prompt, "prompt");
    assert!(result.completed_at >= result.started_at);
}

#[tokio::test]
async fn parallel_named_subset_keeps_request_order() {
    let pool = pool_with(&[ok_mock("a"), ok_mock("b"), ok_mock("c")]).await;
    pool.disable("b").await.unwrap();

    let result = pool
        .execute_parallel(
            "p",
            &Targets::named(["c", "b", "ghost", "a", "c"]),
            &GenerationParams::default(),
        )
        .await
        .unwrap();
    let names: Vec<_> = result.responses.iter().map(|r| r.backend.as_str()).collect();
    assert_eq!(names, vec!["c", "a"]);
}

#[tokio::test]
async fn parallel_with_no_eligible_backends_fails() {
    let pool = BackendPool::new();
    assert!(matches!(
        pool.execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
            .await,
        Err(PoolError::NoEnabledBackends)
    ));

    let pool = pool_with(&[ok_mock("a")]).await;
    pool.disable("a").await.unwrap();
    assert!(matches!(
        pool.execute_parallel("p", &Targets::named(["a"]), &GenerationParams::default())
            .await,
        Err(PoolError::NoEnabledBackends)
    ));
}

#[tokio::test]
async fn failing_backend_does_not_affect_siblings() {
    let pool = pool_with(&[ok_mock("a"), failing_mock("b"), ok_mock("c")]).await;
    let result = pool
        .execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
        .await
        .unwrap();

    assert_eq!(result.responses.len(), 3);
    assert!(result.responses[0].success());
    assert!(!result.responses[1].success());
    assert!(result.responses[1]
        .error
        .as_deref()
        .unwrap()
        .contains("provider unavailable"));
    assert!(result.responses[2].success());

    let b = pool.stats("b").await.unwrap();
    assert_eq!(b.failed_requests, 1);
    assert_eq!(b.successful_requests, 0);
    let a = pool.stats("a").await.unwrap();
    assert_eq!(a.successful_requests, 1);
    assert_eq!(a.failed_requests, 0);
}

#[tokio::test]
async fn end_to_end_totals_cover_successes_only() {
    let a = Arc::new(
        MockBackend::new(config("A"))
            .with_reply(MockReply::new("scene text").with_tokens(70, 30).with_cost(0.01)),
    );
    let b = failing_mock("B");
    let pool = pool_with(&[a, b]).await;

    let result = pool
        .execute_parallel("p", &Targets::named(["A", "B"]), &GenerationParams::default())
        .await
        .unwrap();

    assert!(result.responses[0].success());
    assert!(!result.responses[1].success());
    assert!((result.total_cost - 0.01).abs() < 1e-9);
    assert_eq!(result.total_tokens, 100);

    let stats = pool.all_stats().await;
    assert_eq!(stats.aggregate.total_requests, 2);
    assert_eq!(stats.aggregate.successful_requests, 1);
    assert_eq!(stats.aggregate.failed_requests, 1);
    assert!((stats.aggregate.total_cost - 0.01).abs() < 1e-9);
    assert!((stats.aggregate.success_rate() - 0.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn parallel_runs_backends_concurrently() {
    let slow = |name: &str| {
        Arc::new(MockBackend::new(config(name)).with_delay(Duration::from_millis(500)))
    };
    let pool = pool_with(&[slow("a"), slow("b"), slow("c")]).await;

    let started = tokio::time::Instant::now();
    let result = pool
        .execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(result.success_count(), 3);
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn stats_stay_consistent_under_concurrent_fanouts() {
    let pool = Arc::new(pool_with(&[ok_mock("a"), failing_mock("b")]).await);
    let mut handles = Vec::new();
    for _ in 0..20 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            pool.execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.all_stats().await;
    for s in stats.backends.values() {
        assert_eq!(s.total_requests, 20);
        assert_eq!(s.successful_requests + s.failed_requests, s.total_requests);
    }
    assert_eq!(stats.backends["a"].successful_requests, 20);
    assert_eq!(stats.backends["b"].failed_requests, 20);
}

// ===========================================================================
// Stats reset
// ===========================================================================

#[tokio::test]
async fn reset_single_and_all_stats() {
    let pool = pool_with(&[ok_mock("a"), ok_mock("b")]).await;
    pool.execute_parallel("p", &Targets::AllEnabled, &GenerationParams::default())
        .await
        .unwrap();

    pool.reset_stats("a").await.unwrap();
    assert_eq!(pool.stats("a").await.unwrap().total_requests, 0);
    assert_eq!(pool.stats("b").await.unwrap().total_requests, 1);

    pool.reset_all_stats().await;
    assert_eq!(pool.all_stats().await.aggregate.total_requests, 0);
    assert!(matches!(
        pool.reset_stats("ghost").await,
        Err(PoolError::UnknownBackend(_))
    ));
}

// ===========================================================================
// Retry with backoff
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn retry_exhausts_after_configured_attempts_with_growing_delay() {
    let mock = Arc::new(
        MockBackend::new(
            BackendConfig::new("flaky", "m").with_retry(3, Duration::from_millis(100)),
        )
        .failing("503 from provider"),
    );
    let backend = Backend::new(mock.clone()).unwrap();

    let err = backend
        .generate_with_retry("p", &GenerationParams::default())
        .await
        .unwrap_err();
    match err {
        GenerationError::RetryExhausted {
            backend,
            attempts,
            last,
        } => {
            assert_eq!(backend, "flaky");
            assert_eq!(attempts, 3);
            assert!(last.to_string().contains("503"));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].at - calls[0].at;
    let second_gap = calls[2].at - calls[1].at;
    assert_eq!(first_gap, Duration::from_millis(100));
    assert_eq!(second_gap, Duration::from_millis(200));
    assert!(second_gap > first_gap);
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failure() {
    let mock = Arc::new(
        MockBackend::new(
            BackendConfig::new("flaky", "m").with_retry(3, Duration::from_millis(50)),
        )
        .with_error(GenerationError::RateLimited {
            retry_after_secs: Some(1),
        })
        .with_reply(MockReply::new("second time lucky")),
    );
    let backend = Backend::new(mock.clone()).unwrap();

    let result = backend
        .generate_with_retry("p", &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(result.content, "second time lucky");
    assert_eq!(mock.call_count(), 2);
    assert_eq!(backend.usage().requests, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_hits_configured_timeout() {
    let mut cfg = BackendConfig::new("slow", "m").with_retry(1, Duration::from_millis(1));
    cfg.timeout_secs = 1;
    let mock = Arc::new(MockBackend::new(cfg).with_delay(Duration::from_secs(5)));
    let backend = Backend::new(mock).unwrap();

    let err = backend
        .generate("p", &GenerationParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::Timeout));
}
