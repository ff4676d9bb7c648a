//! Drives a build by scanning the target's own primary-key space. Grounded
//! on the teacher's `IndexWriter::backfill_exact_snapshot_of_table` (scan,
//! derive, write, mark built) and `IndexBackfillModel` for the resumable
//! cursor persisted alongside the scan.
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
        ChunkBudget,
        ChunkOutcome,
        ThrottledRunner,
    },
};

pub struct ByRecordsStrategy<'s> {
    common: Common<'s>,
}

impl<'s> ByRecordsStrategy<'s> {
    pub fn new(common: Common<'s>) -> Self {
        Self { common }
    }

    pub async fn build_endpoints(&mut self) -> anyhow::Result<Interval> {
        let index = self.common.index.clone();
        let bounds = commit_bookkeeping(self.common.store, self.common.clock, self.common.config_loader, self.common.lease_arg(), move |tx| {
            let index = index.clone();
            Box::pin(async move {
                let bounds = tx.store_key_bounds().await?;
                let Some((first, last)) = bounds else {
                    return Ok(None);
                };
                let mut set = range_set_codec::load(tx, &index).await?;
                set.add(Interval {
                    start: Start(store_api::Key::min()),
                    end: End::Excluded(first.clone()),
                });
                // `last.increment()` is `None` only when `last` has no finite
                // successor in this key space, meaning there's nothing beyond
                // it to mark built.
                if let Some(after_last) = last.increment() {
                    set.add(Interval {
                        start: Start(after_last),
                        end: End::Unbounded,
                    });
                }
                range_set_codec::store(tx, &index, &set).await?;
                Ok(Some((first, last)))
            })
        })
        .await?;
        let Some((first, last)) = bounds else {
            return Ok(Interval::empty());
        };
        Ok(Interval {
            start: Start(first),
            end: End::after_prefix(&last),
        })
    }

    /// Idempotent: builds every sub-range of `range` not yet marked built,
    /// re-consulting the persisted range set whenever a chunk reports
    /// `RangeAlreadyBuilt` instead of escalating.
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
        let record_types = self.common.record_types.clone();
        let deriver = self.common.deriver.clone();
        let track_progress = self.common.config_loader.load().track_progress;
        let range = range.clone();
        let outcome = runner
            .run_chunk(move |tx, budget: ChunkBudget| {
                let index = index.clone();
                let record_types = record_types.clone();
                let deriver = deriver.clone();
                let range = range.clone();
                Box::pin(async move {
                    let records = tx
                        .scan_records(&range, budget.limit_records, &record_types)
                        .await?;
                    let mut bytes = 0u64;
                    let mut entries: Vec<DerivedEntry> = Vec::new();
                    for record in &records {
                        bytes += record.bytes.len() as u64;
                        entries.extend((deriver)(record));
                    }
                    for (key, value) in &entries {
                        tx.save_index_entry(&index, key, value.clone()).await?;
                    }
                    let last_processed = records.last().map(|r| r.primary_key.clone());
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
                            "index {index} already has an entry at key overlapping {overlap_at:?}"
                        ))
                        .into());
                    }
                    range_set_codec::store(tx, &index, &set).await?;
                    if track_progress {
                        ProgressTracker::record_chunk(tx, &index, records.len() as u64).await?;
                    }
                    let partial = built_end < range.end;
                    let resume_key = match (partial, &built_end) {
                        (true, End::Excluded(k)) => Some(k.clone()),
                        _ => None,
                    };
                    Ok(ChunkOutcome {
                        records: records.len() as u32,
                        bytes,
                        partial,
                        resume_key,
                    })
                })
            })
            .await?;
        Ok(outcome)
    }

    /// Produces up to `max_split` disjoint ranges covering the current
    /// missing set within `range.all()`, balancing by interpolating the key
    /// domain. Never fewer than `min_split` unless infeasible, in which case
    /// the single full range is returned.
    pub async fn split_index_build_range(&self, domain: &Interval, min_split: u32, max_split: u32) -> anyhow::Result<Vec<Interval>> {
        let index = self.common.index.clone();
        let domain_for_read = domain.clone();
        let missing: Vec<Interval> = commit_bookkeeping(self.common.store, self.common.clock, self.common.config_loader, self.common.lease_arg(), move |tx| {
            let index = index.clone();
            let domain = domain_for_read.clone();
            Box::pin(async move {
                let set = range_set_codec::load(tx, &index).await?;
                Ok(set.missing_ranges(&domain).collect::<Vec<_>>())
            })
        })
        .await?;
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let min_split = min_split.max(1);
        let max_split = max_split.max(min_split);

        let mut ranges = missing;
        while (ranges.len() as u32) < min_split {
            let Some((idx, _)) = ranges
                .iter()
                .enumerate()
                .filter(|(_, i)| splittable(i))
                .max_by_key(|(_, i)| span_hint(i))
            else {
                break;
            };
            let interval = ranges.remove(idx);
            match split_in_half(&interval) {
                Some((a, b)) => {
                    ranges.insert(idx, b);
                    ranges.insert(idx, a);
                },
                None => {
                    ranges.insert(idx, interval);
                    break;
                },
            }
        }
        while (ranges.len() as u32) > max_split {
            // Merge the two adjacent ranges with the smallest combined span.
            ranges.sort_by(|a, b| a.start.cmp(&b.start));
            if ranges.len() < 2 {
                break;
            }
            let merge_at = (0..ranges.len() - 1)
                .min_by_key(|&i| span_hint(&ranges[i]).saturating_add(span_hint(&ranges[i + 1])))
                .unwrap();
            let b = ranges.remove(merge_at + 1);
            let a = ranges.remove(merge_at);
            ranges.insert(
                merge_at,
                Interval {
                    start: a.start,
                    end: b.end,
                },
            );
        }
        ranges.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(ranges)
    }

    /// Single-transaction reset: clear the index's entries and range set,
    /// then scan and derive every record. Only viable for small stores.
    pub async fn rebuild_index_transactionally(&mut self) -> anyhow::Result<()> {
        let index = self.common.index.clone();
        let record_types = self.common.record_types.clone();
        let deriver = self.common.deriver.clone();
        let track_progress = self.common.config_loader.load().track_progress;
        commit_bookkeeping(self.common.store, self.common.clock, self.common.config_loader, self.common.lease_arg(), move |tx| {
            let index = index.clone();
            let record_types = record_types.clone();
            let deriver = deriver.clone();
            Box::pin(async move {
                tx.clear_index_data(&index).await?;
                let mut set = range_set::RangeSet::new();
                let mut lo = store_api::Key::min();
                loop {
                    let remaining = Interval {
                        start: Start(lo.clone()),
                        end: End::Unbounded,
                    };
                    let records = tx.scan_records(&remaining, u32::MAX, &record_types).await?;
                    if records.is_empty() {
                        break;
                    }
                    for record in &records {
                        for (key, value) in (deriver)(record) {
                            tx.save_index_entry(&index, &key, value).await?;
                        }
                    }
                    let last = records.last().unwrap().primary_key.clone();
                    if track_progress {
                        ProgressTracker::record_chunk(tx, &index, records.len() as u64).await?;
                    }
                    lo = match last.increment() {
                        Some(next) => next,
                        None => break,
                    };
                }
                set.add(Interval::all());
                range_set_codec::store(tx, &index, &set).await?;
                Ok(())
            })
        })
        .await
    }
}

fn splittable(interval: &Interval) -> bool {
    !interval.is_empty()
}

fn span_hint(interval: &Interval) -> u64 {
    match &interval.end {
        End::Unbounded => u64::MAX,
        End::Excluded(end) => {
            let lo = interval.start.0.as_slice();
            let hi = end.as_slice();
            if hi.len() != lo.len() {
                return (hi.len() as u64).saturating_sub(lo.len() as u64).saturating_add(1) << 32;
            }
            lo.iter()
                .zip(hi.iter())
                .find(|(a, b)| a != b)
                .map(|(a, b)| (*b as u64).saturating_sub(*a as u64))
                .unwrap_or(0)
        },
    }
}

/// Splits `[lo, hi)` at the byte-interpolated midpoint, for ranges with a
/// finite, non-adjacent endpoint. `None` if the range can't be meaningfully
/// split further (e.g. `hi` is `lo`'s immediate successor).
fn split_in_half(interval: &Interval) -> Option<(Interval, Interval)> {
    let End::Excluded(hi) = &interval.end else {
        return None;
    };
    let lo = interval.start.0.as_slice();
    let hi_bytes = hi.as_slice();
    let mid = midpoint(lo, hi_bytes);
    let mid_key = store_api::Key::from(mid);
    if mid_key <= interval.start.0 || &mid_key >= hi {
        return None;
    }
    Some((
        Interval {
            start: interval.start.clone(),
            end: End::Excluded(mid_key.clone()),
        },
        Interval {
            start: Start(mid_key),
            end: interval.end.clone(),
        },
    ))
}

/// Big-endian byte-string average of `lo` and `hi`, treating each as a
/// base-256 fixed-point value right-padded with zeros to equal length.
fn midpoint(lo: &[u8], hi: &[u8]) -> Vec<u8> {
    let len = lo.len().max(hi.len());
    let mut sum = vec![0u16; len + 1];
    for i in 0..len {
        sum[i + 1] = *lo.get(i).unwrap_or(&0) as u16 + *hi.get(i).unwrap_or(&0) as u16;
    }
    for i in (1..=len).rev() {
        if sum[i] > 255 {
            sum[i] -= 256;
            sum[i - 1] += 1;
        }
    }
    let mut out = vec![0u8; len + 1];
    let mut carry = 0u16;
    for i in 0..=len {
        let cur = carry * 256 + sum[i];
        out[i] = (cur / 2) as u8;
        carry = cur % 2;
    }
    out
}
