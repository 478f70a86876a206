use ch_core::config::Config;
use ch_intelligence::KnowledgeSourceKind;

/// Run the `query` subcommand against the configured knowledge sources.
pub async fn run(
    config: &Config,
    text: &str,
    max_results: Option<usize>,
    source: Option<KnowledgeSourceKind>,
) -> anyhow::Result<()> {
    let router = super::build_router(config).await?;
    let max_results = max_results.unwrap_or(config.knowledge.default_max_results);

    let result = router.query(text, max_results, source).await?;
    println!("[{}] confidence {:.2}", result.source, result.confidence);
    println!("{}", result.answer);
    if !result.references.is_empty() {
        println!("\nReferences:");
        for reference in &result.references {
            println!("  - {reference}");
        }
    }
    Ok(())
}
