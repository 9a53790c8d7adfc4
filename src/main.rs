//! Mock API rule engine - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mockapi_engine::{Engine, IncomingRequest, RuleSetConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mockapi-engine",
    about = "Mock API rule engine - resolve requests against mock rules",
    version
)]
struct Args {
    /// Path to rule document (YAML, or JSON for .json files)
    #[arg(short, long, default_value = "rules.yaml")]
    rules: PathBuf,

    /// Path to a JSON request to resolve
    #[arg(long, value_name = "FILE")]
    request: Option<PathBuf>,

    /// Resolve without holding the response for its delay
    #[arg(long)]
    no_delay: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example rule document and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the rule document and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the result
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-rules.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    info!(path = ?args.rules, "Loading rule document");
    let config = RuleSetConfig::from_file(&args.rules)
        .with_context(|| format!("Failed to load rules from {:?}", args.rules))?;

    if args.validate {
        println!(
            "Rule document is valid ({} rules, {} active)",
            config.rules.len(),
            config.active_rules().len()
        );
        return Ok(());
    }

    let Some(request_path) = args.request else {
        anyhow::bail!("No request given; pass --request <FILE> or --validate");
    };
    let content = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("Failed to read request {:?}", request_path))?;
    let request: IncomingRequest =
        serde_json::from_str(&content).context("Invalid request document")?;

    let engine = Engine::from_config(config);
    let dispatch = if args.no_delay {
        engine.dispatch(&request).await
    } else {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        match engine.respond_until(&request, ctrl_c).await {
            Some(dispatch) => dispatch,
            None => anyhow::bail!("Interrupted"),
        }
    };

    println!("{}", serde_json::to_string_pretty(&dispatch)?);
    Ok(())
}
