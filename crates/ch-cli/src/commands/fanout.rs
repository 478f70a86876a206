use ch_core::config::Config;
use ch_intelligence::{GenerationParams, Targets};

/// Run the `fanout` subcommand: one parallel request, printed as JSON.
pub async fn run(config: &Config, prompt: &str, backends: Vec<String>) -> anyhow::Result<()> {
    let pool = super::build_pool(config).await?;
    let targets = targets_for(backends);

    let result = pool
        .execute_parallel(prompt, &targets, &GenerationParams::default())
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success_count() == 0 {
        anyhow::bail!("every backend failed");
    }
    Ok(())
}

fn targets_for(backends: Vec<String>) -> Targets {
    if backends.is_empty() {
        Targets::AllEnabled
    } else {
        Targets::named(backends)
    }
}
