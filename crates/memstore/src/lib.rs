//! In-memory reference `TransactionalStore`, grounded on the teacher's
//! `testing::test_persistence::TestPersistence` idiom: a `Mutex`-guarded
//! `BTreeMap`-backed fake, shared across handles via `Arc` so multiple
//! "worker" instances can race against the same backing state in tests.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use store_api::{
    Clock,
    CommitError,
    IndexLifecycle,
    Interval,
    Key,
    Priority,
    StoreTransaction,
    StoredRecord,
    TransactionalStore,
};

/// Matches `index_builder::keyspace::SCANNED`; `get_subspace` special-cases
/// this name so reads see what `atomic_add_scanned` wrote without this
/// crate depending on `index_builder`.
const SCANNED_SUBSPACE: &str = "scanned";

/// Matches `index_builder::keyspace::RANGE`; `clear_index_data` only wipes
/// this subspace key, leaving `lock`/`type` entries untouched since they
/// aren't index data, they're bookkeeping about the build itself.
const RANGE_SUBSPACE: &str = "range";

/// Injectable failure behavior, so tests can exercise the chunk-shrinking
/// and same-chunk-retry paths without a real store's flakiness.
#[derive(Clone, Default)]
pub struct FaultInjector {
    /// Commit fails with `TransactionTooLarge` if the transaction's own
    /// `scan_records`/`scan_index_keys` calls returned more than this many
    /// records in total.
    pub max_records_per_commit: Option<u32>,
    /// The next N commits fail with `Conflict` before succeeding; decrements
    /// on every commit attempt, including ones that hit the line above.
    pub conflicts_remaining: Arc<AtomicU32>,
    /// Every Nth commit attempt (1-indexed) fails with `TransactionTooLarge`
    /// instead of committing, forever. Used to exercise the chunk-shrinking
    /// path against a flaky-but-not-failing store.
    pub fail_every_nth_commit: Option<u32>,
    commit_attempts: Arc<AtomicU32>,
}

impl FaultInjector {
    pub fn fail_next_n_commits_with_conflict(n: u32) -> Self {
        Self {
            max_records_per_commit: None,
            conflicts_remaining: Arc::new(AtomicU32::new(n)),
            fail_every_nth_commit: None,
            commit_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_every_nth_commit_with_too_large(n: u32) -> Self {
        Self {
            max_records_per_commit: None,
            conflicts_remaining: Arc::new(AtomicU32::new(0)),
            fail_every_nth_commit: Some(n),
            commit_attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<Key, StoredRecord>,
    index_entries: BTreeMap<String, BTreeMap<Key, Vec<u8>>>,
    lifecycle: BTreeMap<String, IndexLifecycle>,
    subspace: BTreeMap<(String, String), Vec<u8>>,
    scanned: BTreeMap<String, u64>,
}

pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
    fault: FaultInjector,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fault: FaultInjector::default(),
        }
    }

    pub fn with_fault(fault: FaultInjector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fault,
        }
    }

    /// A second handle onto the same backing state, the way two racing
    /// workers each hold their own `TransactionalStore` over one database.
    pub fn handle(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            fault: self.fault.clone(),
        }
    }

    pub fn seed_record(&self, primary_key: Key, record_type: impl Into<String>, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.records.insert(
            primary_key.clone(),
            StoredRecord {
                primary_key,
                record_type: record_type.into(),
                bytes,
            },
        );
    }

    pub fn seed_index_lifecycle(&self, index: &str, state: IndexLifecycle) {
        self.inner.lock().lifecycle.insert(index.to_string(), state);
    }

    pub fn index_entry_count(&self, index: &str) -> usize {
        self.inner.lock().index_entries.get(index).map_or(0, |m| m.len())
    }

    pub fn index_entries(&self, index: &str) -> Vec<(Key, Vec<u8>)> {
        self.inner
            .lock()
            .index_entries
            .get(index)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionalStore for MemStore {
    async fn open_transaction(&self, _priority: Priority) -> anyhow::Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemTransaction {
            inner: self.inner.clone(),
            fault: self.fault.clone(),
            staged_index_entries: Vec::new(),
            staged_lifecycle: Vec::new(),
            staged_subspace: Vec::new(),
            staged_atomic_add: Vec::new(),
            staged_clear: Vec::new(),
            records_returned: 0,
        }))
    }
}

struct MemTransaction {
    inner: Arc<Mutex<Inner>>,
    fault: FaultInjector,
    staged_index_entries: Vec<(String, Key, Vec<u8>)>,
    staged_lifecycle: Vec<(String, IndexLifecycle)>,
    staged_subspace: Vec<(String, String, Vec<u8>)>,
    staged_atomic_add: Vec<(String, u64)>,
    staged_clear: Vec<String>,
    records_returned: u32,
}

#[async_trait]
impl StoreTransaction for MemTransaction {
    async fn get_by_primary_key(&mut self, key: &Key) -> anyhow::Result<Option<StoredRecord>> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    async fn scan_records(&mut self, interval: &Interval, limit: u32, record_types: &[String]) -> anyhow::Result<Vec<StoredRecord>> {
        let inner = self.inner.lock();
        let records = inner
            .records
            .range(interval.start.0.clone()..)
            .take_while(|(k, _)| interval.contains(k.as_slice()))
            .map(|(_, v)| v)
            .filter(|r| record_types.is_empty() || record_types.contains(&r.record_type))
            .take(limit as usize)
            .cloned()
            .collect::<Vec<_>>();
        self.records_returned += records.len() as u32;
        Ok(records)
    }

    async fn save_index_entry(&mut self, index: &str, key: &Key, value: Vec<u8>) -> anyhow::Result<()> {
        self.staged_index_entries.push((index.to_string(), key.clone(), value));
        Ok(())
    }

    async fn set_index_lifecycle(&mut self, index: &str, state: IndexLifecycle) -> anyhow::Result<IndexLifecycle> {
        let previous = self
            .inner
            .lock()
            .lifecycle
            .get(index)
            .copied()
            .unwrap_or(IndexLifecycle::Disabled);
        self.staged_lifecycle.push((index.to_string(), state));
        Ok(previous)
    }

    async fn get_index_lifecycle(&mut self, index: &str) -> anyhow::Result<IndexLifecycle> {
        Ok(self.inner.lock().lifecycle.get(index).copied().unwrap_or(IndexLifecycle::Disabled))
    }

    async fn clear_index_data(&mut self, index: &str) -> anyhow::Result<()> {
        self.staged_clear.push(index.to_string());
        Ok(())
    }

    async fn get_subspace(&mut self, index: &str, subspace: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        if subspace == SCANNED_SUBSPACE {
            return Ok(inner.scanned.get(index).map(|n| n.to_le_bytes().to_vec()));
        }
        Ok(inner.subspace.get(&(index.to_string(), subspace.to_string())).cloned())
    }

    async fn put_subspace(&mut self, index: &str, subspace: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.staged_subspace.push((index.to_string(), subspace.to_string(), value));
        Ok(())
    }

    async fn atomic_add_scanned(&mut self, index: &str, delta: u64) -> anyhow::Result<()> {
        self.staged_atomic_add.push((index.to_string(), delta));
        Ok(())
    }

    async fn store_key_bounds(&mut self) -> anyhow::Result<Option<(Key, Key)>> {
        let inner = self.inner.lock();
        let first = inner.records.keys().next().cloned();
        let last = inner.records.keys().next_back().cloned();
        Ok(first.zip(last))
    }

    async fn scan_index_keys(&mut self, index: &str, interval: &Interval, limit: u32) -> anyhow::Result<Vec<(Key, Key)>> {
        let inner = self.inner.lock();
        let entries = inner
            .index_entries
            .get(index)
            .into_iter()
            .flat_map(|m| m.range(interval.start.0.clone()..))
            .take_while(|(k, _)| interval.contains(k.as_slice()))
            .take(limit as usize)
            .map(|(source_key, value)| (source_key.clone(), Key::from(value.clone())))
            .collect::<Vec<_>>();
        self.records_returned += entries.len() as u32;
        Ok(entries)
    }

    async fn commit(self: Box<Self>) -> Result<(), CommitError> {
        let attempt = self.fault.commit_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(n) = self.fault.fail_every_nth_commit {
            if n > 0 && attempt.is_multiple_of(n) {
                tracing::debug!(attempt, n, "memstore: injecting periodic transaction-too-large");
                return Err(CommitError::TransactionTooLarge(format!(
                    "injected periodic failure on commit attempt {attempt}"
                )));
            }
        }
        if self.fault.conflicts_remaining.load(Ordering::SeqCst) > 0 {
            self.fault.conflicts_remaining.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("memstore: injecting conflict on commit");
            return Err(CommitError::Conflict("injected test conflict".to_string()));
        }
        if let Some(max) = self.fault.max_records_per_commit {
            if self.records_returned > max {
                tracing::debug!(records = self.records_returned, max, "memstore: injecting transaction-too-large");
                return Err(CommitError::TransactionTooLarge(format!(
                    "transaction touched {} records, over the injected limit of {max}",
                    self.records_returned
                )));
            }
        }
        let mut inner = self.inner.lock();
        for index in self.staged_clear {
            inner.index_entries.remove(&index);
            inner.scanned.remove(&index);
            inner.subspace.remove(&(index.clone(), RANGE_SUBSPACE.to_string()));
        }
        for (index, key, value) in self.staged_index_entries {
            inner.index_entries.entry(index).or_default().insert(key, value);
        }
        for (index, state) in self.staged_lifecycle {
            inner.lifecycle.insert(index, state);
        }
        for (index, subspace, value) in self.staged_subspace {
            inner.subspace.insert((index, subspace), value);
        }
        for (index, delta) in self.staged_atomic_add {
            *inner.scanned.entry(index).or_insert(0) += delta;
        }
        Ok(())
    }
}

/// Real-clock `Clock` implementation for tests and the demo binary, using
/// `tokio::time::sleep` for `wait` and the OS RNG for `rand_f64`.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn rand_f64(&self) -> f64 {
        use std::sync::OnceLock;

        use parking_lot::Mutex as PMutex;
        static SEED: OnceLock<PMutex<u64>> = OnceLock::new();
        let cell = SEED.get_or_init(|| PMutex::new(0x2545_f491_4f6c_dd1d));
        let mut state = cell.lock();
        // xorshift64*, adequate for jitter, not cryptographic use.
        *state ^= *state >> 12;
        *state ^= *state << 25;
        *state ^= *state >> 27;
        let next = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
        (next >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use store_api::{
        End,
        Start,
        TransactionalStore,
    };

    use super::*;

    fn k(n: u8) -> Key {
        Key::from(vec![n])
    }

    #[tokio::test]
    async fn round_trips_a_record_and_index_entry() {
        let store = MemStore::new();
        store.seed_record(k(1), "doc", vec![9, 9]);

        let mut tx = store.open_transaction(Priority::Batch).await.unwrap();
        let found = tx.get_by_primary_key(&k(1)).await.unwrap().unwrap();
        assert_eq!(found.bytes, vec![9, 9]);
        tx.save_index_entry("by_doc", &k(1), vec![1]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.index_entry_count("by_doc"), 1);
    }

    #[tokio::test]
    async fn injected_conflict_fails_commit_without_applying_writes() {
        let store = MemStore::with_fault(FaultInjector::fail_next_n_commits_with_conflict(1));
        let mut tx = store.open_transaction(Priority::Batch).await.unwrap();
        tx.save_index_entry("idx", &k(1), vec![1]).await.unwrap();
        let result = tx.commit().await;
        assert!(matches!(result, Err(CommitError::Conflict(_))));
        assert_eq!(store.index_entry_count("idx"), 0);
    }

    #[tokio::test]
    async fn too_large_fault_trips_once_limit_exceeded() {
        let store = MemStore::with_fault(FaultInjector {
            max_records_per_commit: Some(1),
            conflicts_remaining: Arc::new(AtomicU32::new(0)),
            fail_every_nth_commit: None,
            commit_attempts: Arc::new(AtomicU32::new(0)),
        });
        store.seed_record(k(1), "doc", vec![]);
        store.seed_record(k(2), "doc", vec![]);

        let mut tx = store.open_transaction(Priority::Batch).await.unwrap();
        let domain = Interval {
            start: Start(k(0)),
            end: End::Unbounded,
        };
        let records = tx.scan_records(&domain, 10, &[]).await.unwrap();
        assert_eq!(records.len(), 2);
        let result = tx.commit().await;
        assert!(matches!(result, Err(CommitError::TransactionTooLarge(_))));
    }

    #[tokio::test]
    async fn store_key_bounds_reflects_seeded_records() {
        let store = MemStore::new();
        store.seed_record(k(5), "doc", vec![]);
        store.seed_record(k(1), "doc", vec![]);
        store.seed_record(k(9), "doc", vec![]);
        let mut tx = store.open_transaction(Priority::Batch).await.unwrap();
        let (first, last) = tx.store_key_bounds().await.unwrap().unwrap();
        assert_eq!(first, k(1));
        assert_eq!(last, k(9));
    }
}
