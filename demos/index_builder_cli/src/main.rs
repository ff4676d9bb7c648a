//! Manual-verification harness: builds a small identity index over a seeded
//! `memstore::MemStore` and prints progress. Not a shipped product surface.
use std::sync::Arc;

use index_builder::{
    config::{
        BuildConfig,
        ConfigLoader,
    },
    orchestrator::BuildIndexPolicy,
    progress::ProgressTracker,
    Orchestrator,
};
use memstore::{
    MemStore,
    SystemClock,
};
use store_api::{
    Priority,
    TransactionalStore,
};

struct FixedConfig(BuildConfig);

impl ConfigLoader for FixedConfig {
    fn load(&self) -> BuildConfig {
        self.0.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let store = MemStore::new();
    for n in 0u8..50 {
        store.seed_record(store_api::Key::from(vec![n]), "doc", vec![n; 4]);
    }

    let clock = SystemClock;
    let config_loader = FixedConfig(BuildConfig {
        max_limit: 7,
        ..BuildConfig::default()
    });
    let deriver: Arc<index_builder::EntryDeriver> = Arc::new(|record| vec![(record.primary_key.clone(), record.bytes.clone())]);

    let mut orchestrator = Orchestrator::new(&store, &clock, &config_loader, "by_value", vec!["doc".to_string()], deriver);
    let report = orchestrator.build_index(BuildIndexPolicy::ByRecordsOnly).await?;
    tracing::info!(?report, "build finished");

    let mut tx = store.open_transaction(Priority::Default).await?;
    let snapshot = ProgressTracker::snapshot(tx.as_mut(), "by_value", Some(50)).await?;
    tracing::info!(?snapshot, entries = store.index_entry_count("by_value"), "final state");
    Ok(())
}
