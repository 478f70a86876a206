pub mod backends;
pub mod batch;
pub mod fanout;
pub mod index;
pub mod query;

use std::sync::Arc;

use anyhow::Context;
use ch_core::config::{expand_home, Config};
use ch_intelligence::providers::ProviderBuildError;
use ch_intelligence::{
    build_backend, credentials_available, BackendPool, HttpAnalyticalSource, KnowledgeRouter,
    QueryCache, SqliteFtsIndex,
};
use tracing::{info, warn};

/// Register every buildable backend in `config`.
///
/// Custom adapters and cloud backends whose key env var is unset are
/// skipped with a warning; the remaining backends still form a pool.
pub async fn build_pool(config: &Config) -> anyhow::Result<Arc<BackendPool>> {
    let pool = Arc::new(BackendPool::new());
    for backend in &config.backends {
        if !credentials_available(backend) {
            warn!(backend = %backend.name, "credentials not available, skipping backend");
            continue;
        }
        match build_backend(backend) {
            Ok(adapter) => pool
                .register(adapter)
                .await
                .with_context(|| format!("failed to register backend '{}'", backend.name))?,
            Err(ProviderBuildError::CustomAdapter(name)) => {
                warn!(backend = %name, "custom adapters are not built from config, skipping");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let registered = pool.list_backends(false).await;
    if registered.is_empty() {
        anyhow::bail!("no usable backends configured (check `chorus backends`)");
    }
    info!(backends = ?registered, "backend pool ready");
    Ok(pool)
}

pub async fn open_index(config: &Config) -> anyhow::Result<SqliteFtsIndex> {
    let path = expand_home(&config.knowledge.index_path);
    SqliteFtsIndex::open(&path)
        .await
        .with_context(|| format!("failed to open knowledge index at {}", path.display()))
}

pub async fn build_router(config: &Config) -> anyhow::Result<KnowledgeRouter> {
    let index = open_index(config).await?;
    let mut router = KnowledgeRouter::new(Arc::new(index), QueryCache::from_config(&config.cache));
    if let Some(source) = HttpAnalyticalSource::from_config(&config.knowledge) {
        router = router.with_analytical(Arc::new(source), config.knowledge.analytical_enabled);
    }
    Ok(router)
}
