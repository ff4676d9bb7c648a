//! Owns the end-to-end build sequence. Grounded on the teacher's
//! `IndexWorker::run`/`backfill_tablet` (loop over missing work, transition
//! lifecycle in a dedicated final transaction) and `IndexWorker::new`'s
//! outer retry-with-backoff-and-report wrapper for unexpected failures.
use std::sync::Arc;

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::stream::{
    self,
    StreamExt,
};
use store_api::{
    Clock,
    Interval,
    IndexLifecycle,
    TransactionalStore,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigLoader,
    gate::{
        self,
        GateDecision,
    },
    keyspace,
    lease::{
        current_version,
        LeaseHandle,
        SessionLease,
    },
    strategy::{
        by_index::ByIndexStrategy,
        by_records::ByRecordsStrategy,
        BuildStrategy,
        Common,
        EntryDeriver,
        Strategy,
    },
    throttled_runner::{
        commit_bookkeeping,
        ThrottledRunner,
    },
};

/// What `build_index` actually did, surfaced to the caller for logging.
#[derive(Debug, Eq, PartialEq)]
pub enum BuildReport {
    Built,
    NoOp(&'static str),
}

/// Where an unexpected build failure goes before it's handed back to the
/// caller, trimmed from the teacher's `report_error` (Sentry reporting,
/// PII-stripping, metric counters) down to the one thing left once there's
/// no Sentry project to report into: a structured log line.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &anyhow::Error);
}

pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &anyhow::Error) {
        tracing::error!("online index build failed: {err:#}");
        tracing::debug!("{err:?}");
    }
}

pub struct Orchestrator<'s> {
    store: &'s dyn TransactionalStore,
    clock: &'s dyn Clock,
    config_loader: &'s dyn ConfigLoader,
    index: String,
    record_types: Vec<String>,
    deriver: Arc<EntryDeriver>,
    cancel: CancellationToken,
    error_reporter: Arc<dyn ErrorReporter>,
    /// Set for the duration of a synchronized build (from lease acquisition
    /// to release), so every bookkeeping/chunk transaction issued in between
    /// renews it.
    active_lease: Option<LeaseHandle>,
}

impl<'s> Orchestrator<'s> {
    pub fn new(
        store: &'s dyn TransactionalStore,
        clock: &'s dyn Clock,
        config_loader: &'s dyn ConfigLoader,
        index: impl Into<String>,
        record_types: Vec<String>,
        deriver: Arc<EntryDeriver>,
    ) -> Self {
        Self {
            store,
            clock,
            config_loader,
            index: index.into(),
            record_types,
            deriver,
            cancel: CancellationToken::new(),
            error_reporter: Arc::new(TracingErrorReporter),
            active_lease: None,
        }
    }

    /// Overrides the default `TracingErrorReporter`, e.g. to plug in an
    /// application's own alerting sink.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn common(&self) -> Common<'s> {
        Common {
            store: self.store,
            clock: self.clock,
            config_loader: self.config_loader,
            index: self.index.clone(),
            record_types: self.record_types.clone(),
            deriver: self.deriver.clone(),
            lease: self.active_lease,
        }
    }

    /// `(index, handle)` for `commit_bookkeeping`'s `lease` parameter,
    /// `None` when no session is active (or `use_synchronized_session` is
    /// off).
    fn lease_arg(&self) -> Option<(&str, LeaseHandle)> {
        self.active_lease.map(|handle| (self.index.as_str(), handle))
    }

    async fn read_version(&self) -> u64 {
        current_version(self.clock)
    }

    /// The 8-step sequence: gate, lease, strategy selection, endpoints,
    /// build loop (with By-Index-to-By-Records fallback on validation
    /// failure), final lifecycle transition and lease release. Any error
    /// that survives `ThrottledRunner`/`commit_bookkeeping`'s local retries
    /// is reported via `error_reporter` before propagating.
    pub async fn build_index(&mut self, policy: BuildIndexPolicy) -> anyhow::Result<BuildReport> {
        let result = self.build_index_inner(policy).await;
        if let Err(e) = &result {
            self.error_reporter.report(e);
        }
        result
    }

    async fn build_index_inner(&mut self, policy: BuildIndexPolicy) -> anyhow::Result<BuildReport> {
        self.active_lease = None;
        let config = self.config_loader.load();

        let index = self.index.clone();
        let lifecycle = commit_bookkeeping(self.store, self.clock, self.config_loader, None, move |tx| {
            let index = index.clone();
            Box::pin(async move { tx.get_index_lifecycle(&index).await })
        })
        .await?;

        let decision = gate::evaluate(config.index_state_precondition, lifecycle);
        match decision {
            GateDecision::NoOp(reason) => return Ok(BuildReport::NoOp(reason)),
            GateDecision::Fail => return Err(gate::gate_error(config.index_state_precondition, lifecycle)),
            GateDecision::Build { clear } => {
                let index = self.index.clone();
                commit_bookkeeping(self.store, self.clock, self.config_loader, None, move |tx| {
                    let index = index.clone();
                    Box::pin(async move {
                        tx.set_index_lifecycle(&index, IndexLifecycle::WriteOnly).await?;
                        if clear {
                            tx.clear_index_data(&index).await?;
                            // A fresh start; the previous build's strategy
                            // marker (if any) no longer applies.
                            tx.put_subspace(&index, keyspace::TYPE, Vec::new()).await?;
                        }
                        Ok(())
                    })
                })
                .await?;
            },
            GateDecision::Rebuild => {
                let index = self.index.clone();
                commit_bookkeeping(self.store, self.clock, self.config_loader, None, move |tx| {
                    let index = index.clone();
                    Box::pin(async move {
                        tx.clear_index_data(&index).await?;
                        tx.put_subspace(&index, keyspace::TYPE, Vec::new()).await
                    })
                })
                .await?;
            },
            GateDecision::Continue => {},
        }

        if config.use_synchronized_session {
            let read_version = self.read_version().await;
            let index = self.index.clone();
            let lease_length_millis = config.lease_length_millis;
            let lease = commit_bookkeeping(self.store, self.clock, self.config_loader, None, move |tx| {
                let index = index.clone();
                Box::pin(async move { SessionLease::start(tx, &index, read_version, lease_length_millis).await })
            })
            .await?;
            self.active_lease = Some(LeaseHandle::new(lease, lease_length_millis));
        }

        let mut strategy = self.select_strategy(&config, policy);
        self.check_and_record_strategy_marker(&strategy, true).await?;

        let range = strategy.build_endpoints().await?;

        loop {
            let mut runner = ThrottledRunner::with_cancellation(self.store, self.clock, self.config_loader, self.cancel.clone());
            if let Some(handle) = self.active_lease {
                runner = runner.with_lease(self.index.clone(), handle);
            }
            let by_records_fallback_allowed = matches!(&strategy, Strategy::ByIndex(_)) && config.index_from_index_policy.allow_record_scan;

            let needs_parallel_split = config.parallelism > 1 && matches!(&strategy, Strategy::ByRecords(_));
            let result = self.validate_then_build(&mut strategy, &config, &mut runner, &range, needs_parallel_split).await;

            match result {
                Ok(()) => break,
                Err(e) if e.is_validation() && by_records_fallback_allowed => {
                    tracing::warn!(index = %self.index, "By-Index validation failed, falling back to By-Records");
                    strategy = Strategy::ByRecords(ByRecordsStrategy::new(self.common()));
                    self.check_and_record_strategy_marker(&strategy, false).await?;
                    continue;
                },
                Err(e) => return Err(e),
            }
        }

        {
            let index = self.index.clone();
            commit_bookkeeping(self.store, self.clock, self.config_loader, self.lease_arg(), move |tx| {
                let index = index.clone();
                Box::pin(async move { tx.set_index_lifecycle(&index, IndexLifecycle::Readable).await })
            })
            .await?;
        }
        if self.active_lease.is_some() {
            let index = self.index.clone();
            commit_bookkeeping(self.store, self.clock, self.config_loader, None, move |tx| {
                let index = index.clone();
                Box::pin(async move { SessionLease::end_any(tx, &index).await })
            })
            .await?;
            self.active_lease = None;
        }

        Ok(BuildReport::Built)
    }

    /// Runs the By-Index strategy's mandatory pre-flight validation (source
    /// readable, idempotent, covers the target's record types) before
    /// letting it touch a single chunk; By-Records has no such gate.
    /// Validation failures flow through the same `Err` path `build_range`
    /// would, so the By-Index-to-By-Records fallback above catches both.
    async fn validate_then_build(
        &self,
        strategy: &mut Strategy<'s>,
        config: &crate::config::BuildConfig,
        runner: &mut ThrottledRunner<'s>,
        range: &Interval,
        needs_parallel_split: bool,
    ) -> anyhow::Result<()> {
        if let Strategy::ByIndex(by_index) = strategy {
            by_index
                .validate(
                    config.index_from_index_policy.source_is_idempotent,
                    &config.index_from_index_policy.source_record_types,
                )
                .await?;
        }
        if needs_parallel_split {
            self.build_range_parallel(strategy, range, config.parallelism).await
        } else {
            strategy.build_range(runner, range.clone()).await
        }
    }

    /// Detects a build resuming with a different strategy than the one that
    /// produced the range set currently on disk — By-Records and By-Index
    /// persist range-set boundaries in different key spaces (primary keys
    /// vs. source-index keys), so silently switching would corrupt
    /// resumption. `enforce_match` is `false` for the orchestrator's own
    /// intra-build fallback, which is a legitimate transition that should
    /// just overwrite the marker.
    async fn check_and_record_strategy_marker(&self, strategy: &Strategy<'s>, enforce_match: bool) -> anyhow::Result<()> {
        let index = self.index.clone();
        let marker = strategy_marker(strategy);
        commit_bookkeeping(self.store, self.clock, self.config_loader, self.lease_arg(), move |tx| {
            let index = index.clone();
            Box::pin(async move {
                let existing = tx.get_subspace(&index, keyspace::TYPE).await?;
                if enforce_match {
                    if let Some(existing) = &existing {
                        if !existing.is_empty() && existing.as_slice() != marker {
                            return Err(ErrorMetadata::state_mismatch(format!(
                                "index {index} is already mid-build with a different strategy than the one requested"
                            ))
                            .into());
                        }
                    }
                }
                tx.put_subspace(&index, keyspace::TYPE, marker.to_vec()).await
            })
        })
        .await
    }

    fn select_strategy(&self, config: &crate::config::BuildConfig, policy: BuildIndexPolicy) -> Strategy<'s> {
        match (&config.index_from_index_policy.source_index, policy) {
            (Some(source), BuildIndexPolicy::PreferByIndex) => Strategy::ByIndex(ByIndexStrategy::new(self.common(), source.clone())),
            _ => Strategy::ByRecords(ByRecordsStrategy::new(self.common())),
        }
    }

    /// Runs `parallelism` independent `ThrottledRunner` loops over disjoint
    /// sub-ranges of the still-missing domain, matching the teacher's
    /// `perform_backfill`'s `try_for_each_concurrent` shape.
    async fn build_range_parallel(&self, strategy: &Strategy<'s>, range: &Interval, parallelism: u32) -> anyhow::Result<()> {
        let Strategy::ByRecords(by_records) = strategy else {
            unreachable!("caller only requests a parallel split for the By-Records strategy");
        };
        let partitions = by_records.split_index_build_range(range, 1, parallelism).await?;
        if partitions.is_empty() {
            return Ok(());
        }
        let index = self.index.clone();
        let active_lease = self.active_lease;
        let results: Vec<anyhow::Result<()>> = stream::iter(partitions.into_iter().map(|partition| {
            let common = self.common();
            let store = self.store;
            let clock = self.clock;
            let config_loader = self.config_loader;
            let cancel = self.cancel.clone();
            let index = index.clone();
            async move {
                let mut strategy = ByRecordsStrategy::new(common);
                let mut runner = ThrottledRunner::with_cancellation(store, clock, config_loader, cancel);
                if let Some(handle) = active_lease {
                    runner = runner.with_lease(index, handle);
                }
                strategy.build_range(&mut runner, partition).await
            }
        }))
        .buffer_unordered(parallelism as usize)
        .collect()
        .await;
        results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;
        Ok(())
    }
}

/// Which strategy the caller wants tried first, when the configuration
/// names a source index. By-Records is always used when no source index is
/// configured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildIndexPolicy {
    PreferByIndex,
    ByRecordsOnly,
}

/// Administrative stop: release the lease unconditionally and broadcast
/// cancellation, matching the concurrency model's "cancellation... takes
/// effect at the next suspension" description.
pub async fn stop_ongoing_online_index_build(
    store: &dyn TransactionalStore,
    clock: &dyn Clock,
    config_loader: &dyn ConfigLoader,
    index: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let index = index.to_string();
    commit_bookkeeping(store, clock, config_loader, None, move |tx| {
        let index = index.clone();
        Box::pin(async move { SessionLease::end_any(tx, &index).await })
    })
    .await?;
    cancel.cancel();
    Ok(())
}

/// Persisted marker distinguishing which strategy built the range set
/// currently on disk (the two strategies key it by different domains).
fn strategy_marker(strategy: &Strategy) -> &'static [u8] {
    match strategy {
        Strategy::ByRecords(_) => b"by_records",
        Strategy::ByIndex(_) => b"by_index",
    }
}
