pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::proxy::cache::{Cache, DiskCache, EvictionConfig, NullCache};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let cache: Arc<dyn Cache> = match &settings.cache_dir {
        Some(dir) => {
            let config = EvictionConfig {
                low_water: settings.cache_low_water,
                high_water: settings.cache_high_water,
                prune_chunk_size: settings.cache_prune_chunk_size,
            };
            let cache = DiskCache::open(dir, config)
                .with_context(|| format!("cannot open cache in {}", dir.display()))?;
            info!(dir = %dir.display(), "persistent cache opened");
            Arc::new(cache)
        }
        None => {
            info!("no cache directory configured; caching disabled");
            Arc::new(NullCache)
        }
    };

    let app = proxy::AppContext::new(settings, cache.clone())?;

    tokio::select! {
        result = proxy::run(app) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cache.close().await;
            Ok(())
        }
    }
}
