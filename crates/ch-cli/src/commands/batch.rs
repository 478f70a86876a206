use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ch_core::config::{expand_home, Config};
use ch_intelligence::{
    BatchInput, BatchOrchestrator, BatchSummary, CritiqueService, ExecutionMode, FanOutProcessor,
};

/// Run the `batch` subcommand. Returns the process exit code.
pub async fn run(
    config: &Config,
    input_path: &Path,
    parallel: Option<usize>,
    output: Option<PathBuf>,
    critique: bool,
) -> anyhow::Result<i32> {
    let input = BatchInput::load(input_path)
        .await
        .with_context(|| format!("failed to read batch input {}", input_path.display()))?;

    let pool = super::build_pool(config).await?;
    let mut processor = FanOutProcessor::new(Arc::clone(&pool));
    if critique {
        let service = CritiqueService::from_config(Arc::clone(&pool), &config.critique)
            .context("--critique requires critique.critic to name a backend")?;
        processor = processor.with_critique(Arc::new(service));
    }

    let mode = execution_mode(config, parallel);
    let output_dir = output.unwrap_or_else(|| expand_home(&config.batch.output_dir));
    let orchestrator = BatchOrchestrator::new(Arc::new(processor), mode, output_dir);

    let summary = orchestrator.run(&input).await?;
    print_summary(&summary, orchestrator.output_dir());
    Ok(summary.exit_code())
}

fn execution_mode(config: &Config, parallel: Option<usize>) -> ExecutionMode {
    match parallel {
        Some(workers) => ExecutionMode::Parallel {
            workers: workers.max(1),
        },
        None => ExecutionMode::from(&config.batch),
    }
}

fn print_summary(summary: &BatchSummary, output_dir: &Path) {
    let meta = &summary.metadata;
    println!("batch {}  ({})", meta.chapter_id, meta.mode);
    println!("{}", "-".repeat(40));
    println!("Items:       {}", meta.total_items);
    println!("Processed:   {}", meta.processed);
    println!("Failed:      {}", meta.failed);
    println!("Total cost:  ${:.4}", summary.cost.total);
    println!("Avg / item:  ${:.4}", summary.cost.average_per_item);
    for (metric, value) in &summary.quality.averages {
        println!("Avg {metric}: {value:.2}");
    }
    for failed in &summary.failed_items {
        println!("  failed {}: {}", failed.item_id, failed.error);
    }
    println!("Artifacts:   {}", output_dir.display());
}
