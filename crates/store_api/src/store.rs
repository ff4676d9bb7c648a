use async_trait::async_trait;

use crate::{
    bounds::Interval,
    key::Key,
    lifecycle::IndexLifecycle,
};

/// Transaction priority. The builder always opens transactions at `Batch`,
/// the lowest priority, so that foreground traffic is never starved by
/// backfill I/O.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    Batch,
    Default,
}

/// Why a transaction failed to commit, normalized at the single mapping
/// point the store boundary is responsible for. Everything downstream reads
/// this enum rather than re-deriving a classification from the store's own
/// error type.
#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    #[error("transient conflict: {0}")]
    Conflict(String),
    #[error("read version no longer available: {0}")]
    ReadVersionUnavailable(String),
    #[error("commit result unknown: {0}")]
    CommitUnknownResult(String),
    #[error("transaction too large: {0}")]
    TransactionTooLarge(String),
    #[error("write too large: {0}")]
    WriteTooLarge(String),
    #[error("too many conflicts: {0}")]
    TooManyConflicts(String),
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single record as seen by the builder: an opaque primary key and an
/// opaque record type tag used to filter which records a strategy derives
/// index entries from.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub primary_key: Key,
    pub record_type: String,
    pub bytes: Vec<u8>,
}

/// One transactional view onto the store, scoped to a single attempt of a
/// single chunk. Every store-touching operation the builder performs goes
/// through this trait; the builder has no other I/O surface.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get_by_primary_key(&mut self, key: &Key) -> anyhow::Result<Option<StoredRecord>>;

    /// Scan records with primary keys in `interval`, in ascending key order,
    /// yielding at most `limit` records whose type is in `record_types` (an
    /// empty slice means no type filter).
    async fn scan_records(
        &mut self,
        interval: &Interval,
        limit: u32,
        record_types: &[String],
    ) -> anyhow::Result<Vec<StoredRecord>>;

    async fn save_index_entry(
        &mut self,
        index: &str,
        key: &Key,
        value: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Set the index's lifecycle state, returning the previous one.
    async fn set_index_lifecycle(
        &mut self,
        index: &str,
        state: IndexLifecycle,
    ) -> anyhow::Result<IndexLifecycle>;

    async fn get_index_lifecycle(&mut self, index: &str) -> anyhow::Result<IndexLifecycle>;

    /// Delete the index's entries, range set, and scanned counter.
    async fn clear_index_data(&mut self, index: &str) -> anyhow::Result<()>;

    /// Read the raw bytes of a well-known subkey under `<index>/...`.
    async fn get_subspace(&mut self, index: &str, subspace: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Overwrite the raw bytes of a well-known subkey under `<index>/...`.
    async fn put_subspace(
        &mut self,
        index: &str,
        subspace: &str,
        value: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Atomically add `delta` to the little-endian 64-bit counter at
    /// `<index>/scanned`, without reading its current value.
    async fn atomic_add_scanned(&mut self, index: &str, delta: u64) -> anyhow::Result<()>;

    /// The first and last primary keys present across the whole store, used
    /// by the By-Records strategy's `buildEndpoints`.
    async fn store_key_bounds(&mut self) -> anyhow::Result<Option<(Key, Key)>>;

    /// Scan a readable source index's own key space in ascending order,
    /// yielding at most `limit` `(index_key, primary_key)` pairs with
    /// `index_key` in `interval`. Used by the By-Index strategy, which
    /// iterates a source index instead of the primary-key space and looks
    /// up each referenced base record by the embedded primary key.
    async fn scan_index_keys(&mut self, index: &str, interval: &Interval, limit: u32) -> anyhow::Result<Vec<(Key, Key)>>;

    async fn commit(self: Box<Self>) -> Result<(), CommitError>;
}

/// Opens transactions against the underlying store. This is the sole entry
/// point the builder needs from the record-store façade the rest of this
/// crate treats as an external collaborator.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn open_transaction(&self, priority: Priority) -> anyhow::Result<Box<dyn StoreTransaction>>;
}
