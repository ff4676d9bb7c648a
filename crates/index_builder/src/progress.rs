use store_api::{
    IndexLifecycle,
    StoreTransaction,
};

use crate::keyspace;

/// A read of the builder's durable progress, combining the scanned-record
/// counter with the index's current lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub scanned: u64,
    pub lifecycle: IndexLifecycle,
    pub percent: Option<f64>,
}

/// Durable monotonic scanned-record counter, grounded on the teacher's
/// `IndexBackfillModel` pattern of a progress document updated inside the
/// same transaction as the chunk's other mutations. Unlike
/// `IndexBackfillModel`, which read-modify-writes `num_docs_indexed`, this
/// uses the store's atomic-add primitive so a concurrent read-only probe or
/// `endAny()` administrator never serializes against every chunk commit.
pub struct ProgressTracker;

impl ProgressTracker {
    /// Record that `delta` more records were scanned and committed in this
    /// chunk. Must be called in the same transaction as the chunk's
    /// range-set mutation.
    pub async fn record_chunk(
        tx: &mut dyn StoreTransaction,
        index: &str,
        delta: u64,
    ) -> anyhow::Result<()> {
        if delta == 0 {
            return Ok(());
        }
        tx.atomic_add_scanned(index, delta).await
    }

    pub async fn scanned(tx: &mut dyn StoreTransaction, index: &str) -> anyhow::Result<u64> {
        let bytes = tx.get_subspace(index, keyspace::SCANNED).await?;
        Ok(match bytes {
            Some(bytes) if bytes.len() == 8 => u64::from_le_bytes(bytes.try_into().unwrap()),
            _ => 0,
        })
    }

    pub async fn snapshot(
        tx: &mut dyn StoreTransaction,
        index: &str,
        total_estimate: Option<u64>,
    ) -> anyhow::Result<ProgressSnapshot> {
        let scanned = Self::scanned(tx, index).await?;
        let lifecycle = tx.get_index_lifecycle(index).await?;
        let percent = total_estimate.map(|total| {
            if total == 0 {
                100.0
            } else {
                (scanned.min(total) as f64 / total as f64) * 100.0
            }
        });
        Ok(ProgressSnapshot {
            scanned,
            lifecycle,
            percent,
        })
    }
}
