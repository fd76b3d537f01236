//! kouri - KouriChat Memory CLI
//!
//! Operator tooling for the conversation memory engine: record turns,
//! preview reply contexts, force compression and keep the index healthy.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod commands;
mod config;

use cli::{Cli, Commands};

const DEFAULT_LOG_FILTER: &str = "kouri=info,kouri_memory=info";

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays pipeable
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Commands::Version = cli.command {
        println!("kouri {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;

    // Execute command
    match cli.command {
        Commands::Record(args) => commands::record::execute(args, &config).await,
        Commands::Context {
            conversation,
            query,
            json,
        } => commands::context::execute(&conversation, &query, json, &config).await,
        Commands::Summarize { conversation } => {
            commands::maintenance::summarize(&conversation, &config).await
        }
        Commands::Reindex => commands::maintenance::reindex(&config).await,
        Commands::Verify { conversation, json } => {
            commands::admin::verify(&conversation, json, &config).await
        }
        Commands::Repair { conversation } => commands::admin::repair(&conversation, &config).await,
        Commands::Forget { conversation, yes } => {
            commands::admin::forget(&conversation, yes, &config).await
        }
        Commands::Stats { conversation, json } => {
            commands::admin::stats(conversation.as_deref(), json, &config).await
        }
        Commands::Version => Ok(()),
    }
}
