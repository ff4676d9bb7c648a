pub mod by_index;
pub mod by_records;

use std::sync::Arc;

use store_api::{
    Clock,
    Interval,
    Key,
    StoredRecord,
    TransactionalStore,
};

pub use self::{
    by_index::ByIndexStrategy,
    by_records::ByRecordsStrategy,
};
use crate::{
    config::ConfigLoader,
    lease::LeaseHandle,
    throttled_runner::ThrottledRunner,
};

/// One (key, value) index entry a record maps onto. A record may derive
/// zero or more entries (e.g. a synthetic index fans one base record out to
/// several).
pub type DerivedEntry = (Key, Vec<u8>);

/// Maps a record onto the index entries it contributes. Out of scope per
/// the purpose statement (it's the synthetic-from-base-index planner), so
/// it's injected rather than implemented here.
pub type EntryDeriver = dyn Fn(&StoredRecord) -> Vec<DerivedEntry> + Send + Sync;

/// Everything both strategies need: which index they're building, which
/// record types qualify, and how to turn a record into entries. Owned by
/// the orchestrator and handed to whichever strategy variant is active for
/// the duration of one build, per the "non-owning handle" design note.
pub struct Common<'s> {
    pub store: &'s dyn TransactionalStore,
    pub clock: &'s dyn Clock,
    pub config_loader: &'s dyn ConfigLoader,
    pub index: String,
    pub record_types: Vec<String>,
    pub deriver: Arc<EntryDeriver>,
    /// Set for the duration of a synchronized build; threaded into every
    /// bookkeeping transaction a strategy issues on its own (endpoint
    /// marking, missing-range reads, pre-flight validation) so a stolen
    /// lease is caught there too, not just inside `ThrottledRunner`.
    pub lease: Option<LeaseHandle>,
}

impl<'s> Common<'s> {
    /// `(index, handle)` shaped for `commit_bookkeeping`'s `lease` parameter.
    pub fn lease_arg(&self) -> Option<(&str, LeaseHandle)> {
        self.lease.map(|handle| (self.index.as_str(), handle))
    }
}

/// Shared behavior between the By-Records and By-Index strategies. A tagged
/// variant (`Strategy`), not a trait-object hierarchy: there are exactly two
/// variants and a fallback, not an open set of implementations.
#[async_trait::async_trait]
pub trait BuildStrategy {
    /// Mark the outer, not-yet-written boundary of the domain as built and
    /// return the interior range the main build phase should cover. Called
    /// once, before the main loop; By-Index strategies skip this (return
    /// the full domain unchanged).
    async fn build_endpoints(&mut self) -> anyhow::Result<Interval>;

    /// Idempotent: build every still-missing sub-range of `range`, via the
    /// throttled runner, re-consulting the persisted range set whenever a
    /// chunk reports `RangeAlreadyBuilt`.
    async fn build_range(&mut self, runner: &mut ThrottledRunner<'_>, range: Interval) -> anyhow::Result<()>;

    /// Single-transaction reset: clear the index's data and range set, then
    /// scan and write every entry. Only appropriate for small stores/tests;
    /// fails with transaction-too-large on anything bigger.
    async fn rebuild_index_transactionally(&mut self) -> anyhow::Result<()>;
}

/// Tagged sum of the two strategies, replaceable mid-build (the By-Index to
/// By-Records fallback on `Validation` failure).
pub enum Strategy<'s> {
    ByRecords(ByRecordsStrategy<'s>),
    ByIndex(ByIndexStrategy<'s>),
}

#[async_trait::async_trait]
impl<'s> BuildStrategy for Strategy<'s> {
    async fn build_endpoints(&mut self) -> anyhow::Result<Interval> {
        match self {
            Strategy::ByRecords(s) => s.build_endpoints().await,
            Strategy::ByIndex(s) => s.build_endpoints().await,
        }
    }

    async fn build_range(&mut self, runner: &mut ThrottledRunner<'_>, range: Interval) -> anyhow::Result<()> {
        match self {
            Strategy::ByRecords(s) => s.build_range(runner, range).await,
            Strategy::ByIndex(s) => s.build_range(runner, range).await,
        }
    }

    async fn rebuild_index_transactionally(&mut self) -> anyhow::Result<()> {
        match self {
            Strategy::ByRecords(s) => s.rebuild_index_transactionally().await,
            Strategy::ByIndex(s) => s.rebuild_index_transactionally().await,
        }
    }
}
