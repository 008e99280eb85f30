use std::sync::Arc;
use std::time::Duration;

use flagsync_core::{CacheState, Clock, FlagPatch};
use flagsync_engine::{EngineConfig, EngineError, GatewayError, RetryPolicy};
use flagsync_harness::{settle, TestOrigin};
use tokio::time::Instant;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn transport() -> GatewayError {
    GatewayError::Transport("503 service unavailable".into())
}

// ============================================================================
// Staleness window
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fresh_snapshot_is_served_without_a_fetch() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();

    let first = tab.client.refresh(false).await?;
    assert_eq!(first.state(), CacheState::Idle);
    assert_eq!(first.fetched_at(), Some(origin.clock.now()));
    assert_eq!(tab.gateway.fetch_calls(), 1);

    origin.clock.advance(Duration::from_secs(10));
    let second = tab.client.refresh(false).await?;
    let third = tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));

    tab.client.refresh(true).await?;
    assert_eq!(tab.gateway.fetch_calls(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_is_refetched() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    origin.clock.advance(Duration::from_millis(29_999));
    tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 1);

    origin.clock.advance(Duration::from_millis(1));
    tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn marking_stale_forces_the_next_refresh() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    tab.client.cache().mark_stale();
    tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 2);

    tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 2);
    Ok(())
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_request() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.gateway.hold_fetches();

    let mut calls = Vec::new();
    for force in [false, true, false, true] {
        let client = tab.client.clone();
        calls.push(tokio::spawn(async move { client.refresh(force).await }));
    }
    settle().await;
    assert_eq!(tab.gateway.fetch_calls(), 1);
    assert!(tab.client.cache().is_fetching());
    assert_eq!(tab.client.snapshot().state(), CacheState::Loading);

    tab.gateway.release_fetches(1);
    let mut results = Vec::new();
    for call in calls {
        results.push(call.await??);
    }
    for snapshot in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], snapshot));
    }
    assert_eq!(results[0].len(), 4);
    assert!(!tab.client.cache().is_fetching());
    assert_eq!(tab.gateway.fetch_calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refresh_after_stale_mark_does_not_settle_for_an_older_request() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    tab.gateway.hold_fetches();
    let client = tab.client.clone();
    let early = tokio::spawn(async move { client.refresh(true).await });
    settle().await;

    // The server changes after the in-flight request was issued.
    origin
        .service
        .update_flag("analytics", &FlagPatch::enabled(true))?;
    tab.client.cache().mark_stale();
    let client = tab.client.clone();
    let late = tokio::spawn(async move { client.refresh(true).await });
    settle().await;

    tab.gateway.resume_fetches();
    let early = early.await??;
    let late = late.await??;
    assert!(early.get("analytics").ok_or("missing")?.enabled);
    assert!(late.get("analytics").ok_or("missing")?.enabled);
    assert_eq!(tab.gateway.fetch_calls(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn snapshot_reads_never_wait_on_a_fetch() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    tab.gateway.hold_fetches();
    let client = tab.client.clone();
    let pending = tokio::spawn(async move { client.refresh(true).await });
    settle().await;

    let during = tab.client.snapshot();
    assert_eq!(during.state(), CacheState::Refreshing);
    assert_eq!(during.len(), 4);
    assert!(tab.client.is_enabled("betaSearch"));

    tab.gateway.resume_fetches();
    pending.await??;
    assert_eq!(tab.client.snapshot().state(), CacheState::Idle);
    Ok(())
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.gateway.fail_fetches(2, transport());

    let started = Instant::now();
    let snapshot = tab.client.refresh(false).await?;
    let elapsed = started.elapsed();

    assert_eq!(tab.gateway.fetch_calls(), 3);
    assert!(elapsed >= Duration::from_secs(3), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waited {elapsed:?}");
    assert_eq!(snapshot.state(), CacheState::Idle);
    assert!(snapshot.error().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_is_visible_while_a_retry_is_scheduled() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;
    tab.gateway.fail_fetches(1, transport());

    let client = tab.client.clone();
    let call = tokio::spawn(async move { client.refresh(true).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let between = tab.client.snapshot();
    assert_eq!(between.state(), CacheState::Error);
    assert!(between.error().is_some());
    assert_eq!(between.len(), 4);

    call.await??;
    assert_eq!(tab.client.snapshot().state(), CacheState::Idle);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_keep_the_last_good_snapshot() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;
    tab.gateway.fail_fetches(4, transport());

    let started = Instant::now();
    let err = tab.client.refresh(true).await.err().ok_or("expected failure")?;
    assert!(matches!(err, EngineError::Gateway(GatewayError::Transport(_))));
    // 1s + 2s + 4s between the four attempts.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(tab.gateway.fetch_calls(), 5);

    let snapshot = tab.client.snapshot();
    assert_eq!(snapshot.state(), CacheState::Error);
    assert_eq!(snapshot.len(), 4);
    assert!(!snapshot.get("fileUpload").ok_or("missing")?.enabled);

    // The next refresh starts from a clean slate.
    tab.client.refresh(true).await?;
    assert_eq!(tab.client.snapshot().state(), CacheState::Idle);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn permission_failures_are_not_retried() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.gateway
        .fail_fetches(1, GatewayError::Permission("session expired".into()));

    let err = tab.client.refresh(false).await.err().ok_or("expected failure")?;
    assert!(matches!(err, EngineError::Gateway(GatewayError::Permission(_))));
    assert_eq!(tab.gateway.fetch_calls(), 1);
    assert_eq!(tab.client.snapshot().state(), CacheState::Error);
    assert!(tab.client.snapshot().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_policy_comes_from_config() -> TestResult {
    let config = EngineConfig {
        retry: RetryPolicy::none(),
        ..EngineConfig::default()
    };
    let origin = TestOrigin::standard(config)?;
    let tab = origin.open_tab();
    tab.gateway.fail_fetches(1, transport());

    assert!(tab.client.refresh(false).await.is_err());
    assert_eq!(tab.gateway.fetch_calls(), 1);
    Ok(())
}

// ============================================================================
// Garbage collection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn idle_snapshot_is_dropped_and_reloaded() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    origin.clock.advance(Duration::from_secs(299));
    assert!(!tab.client.cache().collect_garbage());

    origin.clock.advance(Duration::from_secs(1));
    assert!(tab.client.cache().collect_garbage());
    let dropped = tab.client.snapshot();
    assert!(dropped.is_empty());
    assert!(dropped.fetched_at().is_none());

    tab.client.refresh(false).await?;
    assert_eq!(tab.gateway.fetch_calls(), 2);
    assert_eq!(tab.client.snapshot().len(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reads_keep_the_snapshot_alive() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    for _ in 0..4 {
        origin.clock.advance(Duration::from_secs(120));
        assert!(tab.client.is_enabled("betaSearch"));
    }
    assert!(!tab.client.cache().collect_garbage());
    assert_eq!(tab.client.snapshot().len(), 4);
    Ok(())
}

// ============================================================================
// Responses that predate a write
// ============================================================================

#[tokio::test(start_paused = true)]
async fn response_read_before_a_commit_never_reverts_it() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    // This response reads fileUpload=false now and is delivered later.
    tab.gateway.read_fetches_on_arrival();
    tab.gateway.hold_fetches();
    let client = tab.client.clone();
    let early = tokio::spawn(async move { client.refresh(true).await });
    settle().await;
    assert_eq!(tab.gateway.fetch_calls(), 2);

    assert!(tab.client.toggle("fileUpload").await?.enabled);
    settle().await;

    // Deliver the old response only; the refetch it triggers stays parked.
    tab.gateway.release_fetches(1);
    settle().await;
    assert_eq!(tab.gateway.fetch_calls(), 3);
    let between = tab.client.snapshot();
    assert!(between.get("fileUpload").ok_or("missing")?.enabled);

    tab.gateway.resume_fetches();
    let settled = early.await??;
    assert!(settled.get("fileUpload").ok_or("missing")?.enabled);
    assert!(tab.is_enabled("fileUpload"));
    assert_eq!(tab.client.snapshot().state(), CacheState::Idle);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_refetch_after_a_discarded_response_keeps_the_commit() -> TestResult {
    let origin = TestOrigin::standard(EngineConfig::default())?;
    let tab = origin.open_tab();
    tab.client.refresh(false).await?;

    tab.gateway.read_fetches_on_arrival();
    tab.gateway.hold_fetches();
    let client = tab.client.clone();
    let early = tokio::spawn(async move { client.refresh(true).await });
    settle().await;

    assert!(tab.client.toggle("fileUpload").await?.enabled);
    tab.gateway.fail_fetches(4, transport());
    tab.gateway.resume_fetches();

    assert!(early.await?.is_err());
    // Initial load, the discarded response, four failed refetches.
    assert_eq!(tab.gateway.fetch_calls(), 6);
    let snapshot = tab.client.snapshot();
    assert_eq!(snapshot.state(), CacheState::Error);
    assert!(snapshot.get("fileUpload").ok_or("missing")?.enabled);
    Ok(())
}
