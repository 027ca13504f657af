use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

use watchpost::agent;
use watchpost::config::{load_agent_options, AgentOptions};
use watchpost::logging;

const DEFAULT_CONFIG: &str = "agent.conf";

#[derive(Parser)]
#[command(name = "watchpost")]
#[command(about = "Host monitoring agent serving passive and active checks")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the agent in foreground
    #[arg(short, long, default_value_t = true, action = ArgAction::Set)]
    foreground: bool,

    /// Test specified item and exit
    #[arg(short, long, value_name = "ITEM_KEY", conflicts_with = "print")]
    test: Option<String>,

    /// Print known items and exit
    #[arg(short, long)]
    print: bool,
}

/// Load configuration; a missing default file falls back to built-in defaults
fn load_options(cli: &Cli) -> Result<(AgentOptions, PathBuf)> {
    match &cli.config {
        Some(path) => Ok((load_agent_options(path)?, path.clone())),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                Ok((load_agent_options(&path)?, path))
            } else {
                Ok((AgentOptions::default(), path))
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (options, config_path) = match load_options(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    if cli.test.is_some() || cli.print {
        if let Err(e) = logging::init_console(LevelFilter::WARN) {
            eprintln!("Cannot initialize logger: {:#}", e);
            std::process::exit(1);
        }

        if let Err(e) = agent::run_checks(&options, cli.test.as_deref()).await {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    if let Err(e) = logging::init(&options) {
        eprintln!("Cannot initialize logger: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = agent::run(options, &config_path, cli.foreground).await {
        tracing::error!("{:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
