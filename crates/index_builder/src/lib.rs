//! The online index builder: a cross-transaction coordinator that
//! populates a secondary index on a transactional, ordered key-value store
//! without taking it offline.
pub mod backoff;
pub mod config;
pub mod gate;
pub mod keyspace;
pub mod lease;
pub mod orchestrator;
pub mod progress;
pub mod range_set_codec;
pub mod strategy;
pub mod throttled_runner;

pub use orchestrator::{
    stop_ongoing_online_index_build,
    BuildIndexPolicy,
    BuildReport,
    ErrorReporter,
    Orchestrator,
    TracingErrorReporter,
};
pub use strategy::{
    BuildStrategy,
    Common,
    DerivedEntry,
    EntryDeriver,
    Strategy,
};
