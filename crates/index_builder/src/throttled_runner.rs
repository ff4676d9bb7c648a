use std::time::{
    Duration,
    Instant,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use store_api::{
    Clock,
    CommitError,
    Key,
    Priority,
    StoreTransaction,
    TransactionalStore,
};

use crate::{
    backoff::Backoff,
    config::ConfigLoader,
    lease::{
        current_version,
        LeaseHandle,
    },
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// What a chunk operation is allowed to consume before it must stop early
/// and report where it got to.
#[derive(Clone, Copy, Debug)]
pub struct ChunkBudget {
    pub limit_records: u32,
    pub limit_bytes: u64,
}

/// What one successful chunk attempt accomplished, before commit.
#[derive(Clone, Debug, Default)]
pub struct ChunkOutcome {
    pub records: u32,
    pub bytes: u64,
    /// `true` if the budget was exhausted before the whole requested range
    /// was processed (i.e. the caller should invoke `run_chunk` again to
    /// make further progress on what's left).
    pub partial: bool,
    /// Where a partial chunk left off, so the caller can resume from there.
    /// `None` when `partial` is `false`.
    pub resume_key: Option<Key>,
}

pub type ChunkFuture<'a> = BoxFuture<'a, anyhow::Result<ChunkOutcome>>;

/// Generalizes the teacher's `Database::execute_with_retries` (a
/// closure-based retry loop keyed off an `is_retriable` predicate) into the
/// single unified loop the chunk-shrinking and store-retry concerns share:
/// one loop, one error taxonomy, `L_eff` feedback folded in alongside the
/// back-off instead of layered as a second loop around it.
pub struct ThrottledRunner<'s> {
    store: &'s dyn TransactionalStore,
    clock: &'s dyn Clock,
    config_loader: &'s dyn ConfigLoader,
    cancel: CancellationToken,
    l_eff: u32,
    consecutive_successes: u32,
    /// Set when the caller is a lease-holder; renewed at the top of every
    /// chunk attempt's transaction, in the same commit as the chunk's own
    /// work, so a stolen lease aborts the chunk instead of silently letting
    /// it through.
    lease: Option<(String, LeaseHandle)>,
}

impl<'s> ThrottledRunner<'s> {
    pub fn new(store: &'s dyn TransactionalStore, clock: &'s dyn Clock, config_loader: &'s dyn ConfigLoader) -> Self {
        Self::with_cancellation(store, clock, config_loader, CancellationToken::new())
    }

    /// As `new`, but cooperative cancellation is checked at the top of every
    /// chunk attempt (the runner's only suspension boundary between chunks),
    /// matching the "takes effect at the next suspension" model.
    pub fn with_cancellation(
        store: &'s dyn TransactionalStore,
        clock: &'s dyn Clock,
        config_loader: &'s dyn ConfigLoader,
        cancel: CancellationToken,
    ) -> Self {
        let max_limit = config_loader.load().max_limit;
        Self {
            store,
            clock,
            config_loader,
            cancel,
            l_eff: max_limit.max(1),
            consecutive_successes: 0,
            lease: None,
        }
    }

    /// Renew `handle` at the top of every subsequent chunk attempt's
    /// transaction, aborting with `SessionLost` if it's been stolen.
    pub fn with_lease(mut self, index: impl Into<String>, handle: LeaseHandle) -> Self {
        self.lease = Some((index.into(), handle));
        self
    }

    pub fn l_eff(&self) -> u32 {
        self.l_eff
    }

    /// Run `f` to completion against fresh transactions, retrying
    /// same-chunk on transient failures and shrinking `l_eff` on
    /// too-large/too-many-conflicts failures, until `f` reports it made
    /// full progress on the requested budget or a non-retriable error
    /// propagates.
    pub async fn run_chunk<F>(&mut self, mut f: F) -> anyhow::Result<ChunkOutcome>
    where
        F: for<'a> FnMut(&'a mut dyn StoreTransaction, ChunkBudget) -> ChunkFuture<'a>,
    {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        loop {
            if self.cancel.is_cancelled() {
                return Err(anyhow::anyhow!("build cancelled"));
            }
            let config = self.config_loader.load();
            if backoff.failures() >= config.max_retries {
                return Err(ErrorMetadata::max_retries_exceeded(format!(
                    "exceeded {} retries at l_eff={}",
                    config.max_retries, self.l_eff
                ))
                .into());
            }
            let mut tx = self.store.open_transaction(Priority::Batch).await?;
            let budget = ChunkBudget {
                limit_records: self.l_eff,
                limit_bytes: config.max_write_limit_bytes,
            };
            let attempt_start = Instant::now();
            let attempt = async {
                if let Some((index, handle)) = &self.lease {
                    handle.renew(tx.as_mut(), index, current_version(self.clock)).await?;
                }
                let outcome = f(tx.as_mut(), budget).await?;
                tx.commit().await.map_err(classify_commit_error)?;
                Ok::<_, anyhow::Error>(outcome)
            }
            .await;

            match attempt {
                Ok(outcome) => {
                    self.consecutive_successes += 1;
                    if config.increase_limit_after >= 0
                        && self.consecutive_successes as i64 >= config.increase_limit_after
                        && config.increase_limit_after > 0
                    {
                        self.l_eff = (self.l_eff + 1).min(config.max_limit);
                    }
                    self.pace(outcome.records, config.records_per_second, attempt_start).await;
                    return Ok(outcome);
                },
                Err(e) if e.is_retriable_same_chunk() => {
                    tracing::warn!(error = %e, l_eff = self.l_eff, "retrying chunk after transient error");
                    let delay = backoff.fail(self.clock.rand_f64());
                    self.clock.wait(delay).await;
                },
                Err(e) if e.is_retriable_smaller_chunk() => {
                    self.l_eff = (self.l_eff / 2).max(1);
                    self.consecutive_successes = 0;
                    tracing::warn!(error = %e, l_eff = self.l_eff, "shrinking chunk after error");
                    let delay = backoff.fail(self.clock.rand_f64());
                    self.clock.wait(delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn pace(&self, records_in_txn: u32, records_per_second: u32, attempt_start: Instant) {
        if records_per_second == 0 || records_in_txn == 0 {
            return;
        }
        let target_millis = (records_in_txn as f64 / records_per_second as f64) * 1000.0;
        let elapsed_millis = attempt_start.elapsed().as_secs_f64() * 1000.0;
        let sleep_millis = (target_millis - elapsed_millis).max(0.0);
        if sleep_millis > 0.0 {
            self.clock.wait(Duration::from_secs_f64(sleep_millis / 1000.0)).await;
        }
    }
}

/// Retries a one-shot bookkeeping transaction — a gate transition, a lease
/// operation, endpoint marking, the final promotion to `Readable` — on the
/// same locally-retriable errors a chunk would retry. There's no chunk
/// budget to shrink here: these transactions touch a handful of metadata
/// keys, not a caller-sized slice of records, so `TooLarge` is treated the
/// same as any other retriable error rather than triggering a resize.
pub async fn commit_bookkeeping<F, T>(
    store: &dyn TransactionalStore,
    clock: &dyn Clock,
    config_loader: &dyn ConfigLoader,
    lease: Option<(&str, LeaseHandle)>,
    mut f: F,
) -> anyhow::Result<T>
where
    F: for<'a> FnMut(&'a mut dyn StoreTransaction) -> BoxFuture<'a, anyhow::Result<T>>,
{
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    loop {
        let config = config_loader.load();
        if backoff.failures() >= config.max_retries {
            return Err(ErrorMetadata::max_retries_exceeded(format!(
                "exceeded {} retries on a bookkeeping transaction",
                config.max_retries
            ))
            .into());
        }
        let mut tx = store.open_transaction(Priority::Default).await?;
        let attempt = async {
            if let Some((index, handle)) = lease {
                handle.renew(tx.as_mut(), index, current_version(clock)).await?;
            }
            let result = f(tx.as_mut()).await?;
            tx.commit().await.map_err(classify_commit_error)?;
            Ok::<_, anyhow::Error>(result)
        }
        .await;
        match attempt {
            Ok(result) => return Ok(result),
            Err(e) if e.is_locally_retriable() => {
                tracing::warn!(error = %e, "retrying bookkeeping transaction after transient error");
                let delay = backoff.fail(clock.rand_f64());
                clock.wait(delay).await;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Single mapping point: normalize the store's commit-failure taxonomy into
/// the builder's own `RetriableSameChunk`/`RetriableSmallerChunk`/propagate
/// classification.
fn classify_commit_error(e: CommitError) -> anyhow::Error {
    match e {
        CommitError::Conflict(msg) | CommitError::ReadVersionUnavailable(msg) | CommitError::CommitUnknownResult(msg) => {
            ErrorMetadata::retriable_same_chunk(msg).into()
        },
        CommitError::TransactionTooLarge(msg) | CommitError::WriteTooLarge(msg) | CommitError::TooManyConflicts(msg) => {
            ErrorMetadata::retriable_smaller_chunk(msg).into()
        },
        CommitError::DeadlineExceeded => {
            ErrorMetadata::retriable_smaller_chunk("transaction deadline exceeded").into()
        },
        CommitError::Other(e) => e,
    }
}
