use std::sync::Arc;

use cellbtree::config::InspectConfig;
use cellbtree::storage::{AtomicOperationsManager, BufferPool, FilePageStore};
use cellbtree::types::{CompositeKeySerializer, Key};
use cellbtree::{KeyDefinition, MultiValueIndexEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Index id used when the index is only read.
const INSPECT_INDEX_ID: u32 = 0;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cellbtree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match InspectConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Inspecting index {} in {}",
        config.index_name,
        config.data_directory.display()
    );

    if let Err(e) = inspect(&config) {
        tracing::error!("Failed to inspect index {}: {e}", config.index_name);
        std::process::exit(1);
    }
}

fn inspect(config: &InspectConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FilePageStore::open(
        &config.data_directory,
        BufferPool::new(cellbtree::storage::buffer_pool::DEFAULT_POOL_CAPACITY),
    )?;
    let manager = Arc::new(AtomicOperationsManager::new(Arc::new(store)));
    let engine = MultiValueIndexEngine::<Key, CompositeKeySerializer>::load(
        manager,
        INSPECT_INDEX_ID,
        &config.index_name,
        KeyDefinition::new(CompositeKeySerializer, config.key_size),
        config.tree,
    )?;

    let stats = engine.tree().stats()?;
    tracing::info!(
        "size={} depth={} file_pages={} bucket_pages={} null_pages={}",
        stats.size,
        stats.depth,
        stats.file_pages,
        stats.pages_size,
        stats.null_pages
    );
    tracing::info!(
        "distinct_keys={} first_key={:?} last_key={:?}",
        engine.distinct_key_count()?,
        engine.first_key()?,
        engine.last_key()?
    );

    engine.close()?;
    Ok(())
}
