//! Administrative commands: verify, repair, forget, stats.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use kouri_memory::{InvariantReport, MemoryStats};

use super::open_service;
use crate::config::Config;

/// Check a conversation's invariants.
pub async fn verify(conversation: &str, json: bool, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let report = service
        .verify_conversation(conversation)
        .await
        .with_context(|| format!("Failed to verify {conversation}"))?;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_clean() {
        bail!("Conversation {} is inconsistent", conversation);
    }
    Ok(())
}

/// Purge orphaned index rows and lift the halt when consistent.
pub async fn repair(conversation: &str, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let report = service
        .repair_conversation(conversation)
        .await
        .with_context(|| format!("Failed to repair {conversation}"))?;
    service.shutdown().await;

    print_report(&report);
    if report.is_clean() {
        println!("{} {} is consistent and writable", "✓".green(), conversation.bold());
        Ok(())
    } else {
        bail!("Coverage problems remain; {} stays halted", conversation)
    }
}

/// Delete a conversation.
pub async fn forget(conversation: &str, yes: bool, config: &Config) -> Result<()> {
    if !yes {
        bail!(
            "Refusing to delete {} without --yes (turns, summaries and core memory are removed permanently)",
            conversation
        );
    }

    let service = open_service(config).await?;
    let deleted = service
        .delete_conversation(conversation)
        .await
        .with_context(|| format!("Failed to delete {conversation}"))?;
    service.shutdown().await;

    if deleted.turns == 0 && deleted.summaries == 0 {
        println!("{} Conversation not found: {}", "⚠".yellow(), conversation);
        return Ok(());
    }
    println!(
        "{} Deleted {}: {} turns, {} summaries, {} index entries",
        "✓".green(),
        conversation.bold(),
        deleted.turns,
        deleted.summaries,
        deleted.index_entries
    );
    Ok(())
}

/// Show memory statistics.
pub async fn stats(conversation: Option<&str>, json: bool, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let stats = service
        .stats(conversation)
        .await
        .context("Failed to get memory stats")?;
    service.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    print_stats(conversation, &stats);
    Ok(())
}

fn print_stats(conversation: Option<&str>, stats: &MemoryStats) {
    match conversation {
        Some(id) => println!("{} Memory Statistics for {}", "📊".cyan(), id.bold()),
        None => println!("{} Memory Statistics", "📊".cyan()),
    }
    println!();
    println!("  Conversations:  {}", stats.conversations.to_string().bold());
    println!("  Turns:          {}", stats.turns);
    println!("    Active:       {}", stats.active_turns.to_string().cyan());
    println!("  Summaries:      {}", stats.summaries.to_string().green());
    println!("  Index entries:  {}", stats.index_entries);
    println!("  Core memories:  {}", stats.core_memories);
    if stats.halted_conversations > 0 {
        println!(
            "  Halted:         {}",
            stats.halted_conversations.to_string().red()
        );
    }
}

fn print_report(report: &InvariantReport) {
    let status = if report.is_clean() {
        "consistent".green()
    } else {
        "inconsistent".red()
    };
    println!("{} [{}]", report.conversation_id.bold(), status);
    println!(
        "  Turns: {} total, {} active, {} summaries",
        report.total_turns, report.active_turns, report.summaries
    );
    print_ids("Uncovered turns", &report.uncovered_turns);
    print_ids("Overlapping turns", &report.overlapping_turns);
    print_ids("Summarized active turns", &report.summarized_active_turns);
    if !report.orphan_index_entries.is_empty() {
        let orphans: Vec<String> = report
            .orphan_index_entries
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  Orphan index entries: {}", orphans.join(", ").yellow());
    }
    if report.halted {
        println!(
            "  {} {}",
            "Halted:".red(),
            report.halt_reason.as_deref().unwrap_or("no reason recorded")
        );
    }
}

fn print_ids(label: &str, ids: &[i64]) {
    if ids.is_empty() {
        return;
    }
    let shown: Vec<String> = ids.iter().take(20).map(ToString::to_string).collect();
    let more = if ids.len() > 20 {
        format!(" (+{} more)", ids.len() - 20)
    } else {
        String::new()
    };
    println!("  {}: {}{}", label, shown.join(", ").yellow(), more);
}
