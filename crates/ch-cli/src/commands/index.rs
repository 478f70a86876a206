use std::path::Path;

use anyhow::Context;
use ch_core::config::Config;

/// Run the `index` subcommand: (re)index reference documents under `dir`.
pub async fn run(config: &Config, dir: &Path) -> anyhow::Result<()> {
    let index = super::open_index(config).await?;
    let indexed = index
        .index_directory(dir)
        .await
        .with_context(|| format!("failed to index {}", dir.display()))?;
    let total = index.document_count().await?;
    println!("Indexed {indexed} document(s) from {} ({total} in index)", dir.display());
    Ok(())
}
