//! Print the reply context the memory engine would hand to the model.

use anyhow::{Context, Result};
use colored::Colorize;

use super::open_service;
use crate::config::Config;

/// Execute context command.
pub async fn execute(conversation: &str, query: &str, json: bool, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let context = service
        .get_reply_context(conversation, query)
        .await
        .context("Failed to assemble reply context")?;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&context)?);
        return Ok(());
    }

    println!("{}", context.text);
    eprintln!();
    eprintln!(
        "{} {} tokens (limit {}), {} summaries, {} turns{}",
        "ℹ".cyan(),
        context.token_count.to_string().bold(),
        config.memory.assembler.max_context_tokens,
        context.summaries_included,
        context.turns_included,
        if context.core_memory_included { ", core memory" } else { "" }
    );
    if context.truncated {
        eprintln!(
            "{} Context truncated: dropped {} summaries and {} turns",
            "⚠".yellow(),
            context.summaries_dropped,
            context.turns_dropped
        );
    }

    Ok(())
}
