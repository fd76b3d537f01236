//! Forced compression and index rebuild.

use anyhow::{Context, Result};
use colored::Colorize;

use super::{open_service, preview};
use crate::config::Config;

/// Summarize the oldest eligible block of a conversation.
pub async fn summarize(conversation: &str, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let summary = service
        .summarize_now(conversation)
        .await
        .context("Failed to summarize conversation")?;
    service.shutdown().await;

    match summary {
        Some(summary) => {
            println!(
                "{} Summarized turns {}..{} ({} turns)",
                "✓".green(),
                summary.start_turn_id,
                summary.end_turn_id,
                summary.turn_count
            );
            println!("  {}", preview(&summary.text, 200));
        }
        None => {
            println!(
                "{} Nothing to summarize: the newest {} turns always stay raw",
                "⚠".yellow(),
                config.memory.summarizer.keep_recent_turns
            );
        }
    }
    Ok(())
}

/// Rebuild the embedding index.
pub async fn reindex(config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    // Opening already rebuilt the cache; this pass reports the final state
    let report = service
        .rebuild_index()
        .await
        .context("Failed to rebuild index")?;
    service.shutdown().await;

    println!("{} Index rebuilt", "✓".green());
    println!("  Loaded:          {}", report.loaded);
    println!("  Orphans removed: {}", report.orphans_removed);
    println!("  Stale replaced:  {}", report.stale);
    println!("  Embedded:        {}", report.embedded);
    if report.failed > 0 {
        println!(
            "  Failed:          {} {}",
            report.failed.to_string().red(),
            "(capability unavailable, rerun later)".dimmed()
        );
    }
    Ok(())
}
