//! Delve CLI: run one research session from the terminal.

mod progress;

use clap::Parser;
use delve_core::providers::{
    MockModelProvider, MockSearchProvider, ModelProvider, SearchProvider, create_model_provider,
    create_search_provider,
};
use delve_core::{DelveConfig, ResearchEngine, ResearchResult};
use progress::ProgressPrinter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Delve: recursive, budget-bounded deep research
#[derive(Parser, Debug)]
#[command(name = "delve", version, about, long_about = None)]
struct Cli {
    /// Research question
    query: String,

    /// Levels of follow-up research (defaults to research.default_depth)
    #[arg(short, long)]
    depth: Option<usize>,

    /// Queries per level (defaults to research.default_breadth)
    #[arg(short, long)]
    breadth: Option<usize>,

    /// Soft token cap for the session
    #[arg(long)]
    budget: Option<u64>,

    /// Source preferences, e.g. "avoid SEO farms, prefer primary sources"
    #[arg(short, long)]
    preferences: Option<String>,

    /// Print the result as JSON instead of a markdown report
    #[arg(long)]
    json: bool,

    /// Also save the result as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Use deterministic in-process providers (no network, no API keys)
    #[arg(long)]
    offline: bool,

    /// Workspace directory holding .delve/config.toml
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "delve", "delve")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "delve.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let config = delve_core::load_config(Some(&cli.workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if !cli.quiet {
        for warning in config.validate() {
            eprintln!("  warning: {warning}");
        }
    }

    let (model, search) = providers(&config, cli.offline)?;
    let engine = ResearchEngine::from_config(&config, model, search)?
        .with_callback(Arc::new(ProgressPrinter::new(cli.quiet)));

    let depth = cli.depth.unwrap_or(config.research.default_depth);
    let breadth = cli.breadth.unwrap_or(config.research.default_breadth);
    let result = engine
        .conduct_research(
            &cli.query,
            depth,
            breadth,
            cli.budget,
            cli.preferences.as_deref(),
        )
        .await?;

    if let Some(path) = &cli.output {
        save(&result, path)?;
        if !cli.quiet {
            eprintln!("  saved to {}", path.display());
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.to_markdown());
    }
    Ok(())
}

fn providers(
    config: &DelveConfig,
    offline: bool,
) -> anyhow::Result<(Arc<dyn ModelProvider>, Arc<dyn SearchProvider>)> {
    if offline {
        return Ok((
            Arc::new(MockModelProvider::offline()),
            Arc::new(MockSearchProvider::synthetic()),
        ));
    }
    let model = create_model_provider(&config.model)
        .map_err(|e| anyhow::anyhow!("Model provider: {}", e))?;
    let search = create_search_provider(&config.search, config.dispatcher.search_timeout())
        .map_err(|e| anyhow::anyhow!("Search provider: {}", e))?;
    Ok((model, search))
}

fn save(result: &ResearchResult, path: &Path) -> anyhow::Result<()> {
    result
        .save(path)
        .map_err(|e| anyhow::anyhow!("Failed to save result to {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "delve",
            "rust async runtimes",
            "--depth",
            "3",
            "-b",
            "2",
            "--budget",
            "50000",
            "--preferences",
            "primary sources",
            "--json",
            "--offline",
        ])
        .unwrap();
        assert_eq!(cli.query, "rust async runtimes");
        assert_eq!(cli.depth, Some(3));
        assert_eq!(cli.breadth, Some(2));
        assert_eq!(cli.budget, Some(50_000));
        assert_eq!(cli.preferences.as_deref(), Some("primary sources"));
        assert!(cli.json && cli.offline);
        assert!(cli.output.is_none());
    }

    #[test]
    fn test_query_is_required() {
        assert!(Cli::try_parse_from(["delve"]).is_err());
    }

    #[tokio::test]
    async fn test_offline_session_runs_end_to_end() {
        let config = DelveConfig::default();
        let (model, search) = providers(&config, true).unwrap();
        let engine = ResearchEngine::from_config(&config, model, search).unwrap();
        let result = engine
            .conduct_research("offline topic", 1, 2, None, None)
            .await
            .unwrap();
        assert!(!result.learnings.is_empty());
        assert_eq!(result.stats.queries_failed, 0);
    }
}
