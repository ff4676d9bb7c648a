//! Drives a build by scanning an already-readable source index's key space
//! instead of the target's primary-key space. Grounded on the teacher's
//! `IndexSelector`/index-registry pattern in `index_worker.rs` of driving
//! work from one index's metadata to mutate another.
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use store_api::{
    End,
    Interval,
    Start,
};

use super::{
    Common,
    DerivedEntry,
};
use crate::{
    progress::ProgressTracker,
    range_set_codec,
    throttled_runner::{
        commit_bookkeeping,
        ChunkOutcome,
        ThrottledRunner,
    },
};

pub struct ByIndexStrategy<'s> {
    common: Common<'s>,
    source_index: String,
}

impl<'s> ByIndexStrategy<'s> {
    pub fn new(common: Common<'s>, source_index: String) -> Self {
        Self { common, source_index }
    }

    /// Asserts the source index is readable, idempotent, and covers every
    /// record type the target does. `idempotent` is carried by the caller
    /// (the source index's own metadata, outside this crate's model) since
    /// `store_api` has no notion of index idempotence.
    pub async fn validate(&self, source_is_idempotent: bool, source_record_types: &[String]) -> anyhow::Result<()> {
        let source_index = self.source_index.clone();
        let lifecycle = commit_bookkeeping(self.common.store, self.common.clock, self.common.config_loader, self.common.lease_arg(), move |tx| {
            let source_index = source_index.clone();
            Box::pin(async move { tx.get_index_lifecycle(&source_index).await })
        })
        .await?;
        if lifecycle != store_api::IndexLifecycle::Readable {
            return Err(ErrorMetadata::validation(format!(
                "source index {} is not readable (currently {lifecycle})",
                self.source_index
            ))
            .into());
        }
        if !source_is_idempotent {
            return Err(ErrorMetadata::validation(format!("source index {} is not idempotent", self.source_index)).into());
        }
        let covers_target = self.common.record_types.iter().all(|t| source_record_types.contains(t));
        if !covers_target {
            return Err(ErrorMetadata::validation(format!(
                "source index {} does not cover every record type {:?} requires",
                self.source_index, self.common.record_types
            ))
            .into());
        }
        Ok(())
    }

    /// By-Index builds have no outer-boundary marking step: iteration
    /// covers the full source-index key space from the start.
    pub async fn build_endpoints(&mut self) -> anyhow::Result<Interval> {
        Ok(Interval::all())
    }

    /// Iterates the source index's key space; each source entry is used to
    /// look up the base record it points at, which is then fed through the
    /// target's entry-derivation function. The range set persisted under
    /// the target index uses source-index keys as boundaries, so resumption
    /// works against the ordering actually being scanned.
    pub async fn build_range(&mut self, runner: &mut ThrottledRunner<'_>, range: Interval) -> anyhow::Result<()> {
        'outer: loop {
            let index = self.common.index.clone();
            let range_for_read = range.clone();
            let missing = commit_bookkeeping(self.common.store, self.common.clock, self.common.config_loader, self.common.lease_arg(), move |tx| {
                let index = index.clone();
                let range = range_for_read.clone();
                Box::pin(async move {
                    let set = range_set_codec::load(tx, &index).await?;
                    Ok(set.missing_ranges(&range).collect::<Vec<_>>())
                })
            })
            .await?;
            if missing.is_empty() {
                return Ok(());
            }
            for sub in missing {
                let mut lo = sub.start.0.clone();
                loop {
                    let remaining = Interval {
                        start: Start(lo.clone()),
                        end: sub.end.clone(),
                    };
                    if remaining.is_empty() {
                        break;
                    }
                    match self.build_unbuilt_range_chunk(runner, &remaining).await {
                        Ok(outcome) if outcome.partial => {
                            lo = outcome.resume_key.expect("partial chunk must report a resumption key");
                        },
                        Ok(_) => break,
                        Err(e) if e.is_range_already_built() => continue 'outer,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn build_unbuilt_range_chunk(
        &mut self,
        runner: &mut ThrottledRunner<'_>,
        range: &Interval,
    ) -> anyhow::Result<ChunkOutcome> {
        let index = self.common.index.clone();
        let source_index = self.source_index.clone();
        let deriver = self.common.deriver.clone();
        let track_progress = self.common.config_loader.load().track_progress;
        let range = range.clone();
        let outcome = runner
            .run_chunk(move |tx, budget| {
                let index = index.clone();
                let source_index = source_index.clone();
                let deriver = deriver.clone();
                let range = range.clone();
                Box::pin(async move {
                    let source_entries = tx.scan_index_keys(&source_index, &range, budget.limit_records).await?;
                    let mut bytes = 0u64;
                    let mut entries: Vec<DerivedEntry> = Vec::new();
                    for (_, primary_key) in &source_entries {
                        if let Some(record) = tx.get_by_primary_key(primary_key).await? {
                            bytes += record.bytes.len() as u64;
                            entries.extend((deriver)(&record));
                        }
                    }
                    for (key, value) in &entries {
                        tx.save_index_entry(&index, key, value.clone()).await?;
                    }
                    let last_processed = source_entries.last().map(|(source_key, _)| source_key.clone());
                    let built_end = match &last_processed {
                        Some(last) => End::after_prefix(last),
                        None => range.end.clone(),
                    };
                    let built = Interval {
                        start: range.start.clone(),
                        end: built_end.clone(),
                    };
                    let mut set = range_set_codec::load(tx, &index).await?;
                    if let Some(overlap_at) = set.insert_range_conditional(built) {
                        return Err(ErrorMetadata::range_already_built(format!(
                            "index {index} already has an entry at source key overlapping {overlap_at:?}"
                        ))
                        .into());
                    }
                    range_set_codec::store(tx, &index, &set).await?;
                    if track_progress {
                        ProgressTracker::record_chunk(tx, &index, source_entries.len() as u64).await?;
                    }
                    let partial = built_end < range.end;
                    let resume_key = match (partial, &built_end) {
                        (true, End::Excluded(k)) => Some(k.clone()),
                        _ => None,
                    };
                    Ok(ChunkOutcome {
                        records: source_entries.len() as u32,
                        bytes,
                        partial,
                        resume_key,
                    })
                })
            })
            .await?;
        Ok(outcome)
    }

    pub async fn rebuild_index_transactionally(&mut self) -> anyhow::Result<()> {
        Err(ErrorMetadata::validation(
            "By-Index strategy does not support single-transaction rebuild; use By-Records",
        )
        .into())
    }
}
