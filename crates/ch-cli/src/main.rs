//! chorus -- fan prompts out to several LLM backends, critique the results,
//! and answer reference questions from a local knowledge index.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use ch_core::config::Config;
use ch_intelligence::KnowledgeSourceKind;
use ch_telemetry::logging::LogFormat;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "chorus", version, about)]
struct Cli {
    /// Config file (defaults to ~/.chorus/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate every scene of a chapter input file.
    Batch {
        /// Chapter input JSON.
        input: PathBuf,
        /// Run with this many concurrent workers instead of the configured mode.
        #[arg(long)]
        parallel: Option<usize>,
        /// Artifact directory (overrides batch.output_dir).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Critique each scene's variants with the configured critic.
        #[arg(long)]
        critique: bool,
    },

    /// Send one prompt to several backends and print every response.
    Fanout {
        prompt: String,
        /// Restrict to these backends (repeatable). Defaults to all enabled.
        #[arg(short, long = "backend")]
        backends: Vec<String>,
    },

    /// Answer a question from the knowledge sources.
    Query {
        text: String,
        #[arg(short = 'n', long)]
        max_results: Option<usize>,
        /// Skip routing and ask this source first.
        #[arg(long)]
        source: Option<KnowledgeSourceKind>,
    },

    /// (Re)index a directory of reference documents.
    Index { dir: PathBuf },

    /// List configured backends and whether their credentials resolve.
    Backends,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    ch_telemetry::logging::init(
        "chorus",
        &config.general.log_level,
        LogFormat::from_json_flag(config.general.log_json),
    );

    match cli.command {
        Commands::Batch {
            input,
            parallel,
            output,
            critique,
        } => {
            let code = commands::batch::run(&config, &input, parallel, output, critique).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Fanout { prompt, backends } => {
            commands::fanout::run(&config, &prompt, backends).await?;
        }
        Commands::Query {
            text,
            max_results,
            source,
        } => {
            commands::query::run(&config, &text, max_results, source).await?;
        }
        Commands::Index { dir } => {
            commands::index::run(&config, &dir).await?;
        }
        Commands::Backends => {
            commands::backends::run(&config);
        }
    }

    Ok(())
}
