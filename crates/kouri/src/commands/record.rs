//! Record a turn and run the maintenance it makes due.

use anyhow::{Context, Result};
use colored::Colorize;
use kouri_memory::{Attachment, Role};

use super::open_service;
use crate::cli::RecordArgs;
use crate::config::Config;

/// Execute record command.
pub async fn execute(args: RecordArgs, config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let role = Role::from(args.role);
    let attachment = args.image.map(|reference| Attachment {
        description: args.image_description,
        ..Attachment::image(reference)
    });

    let turn_id = service
        .record_turn(&args.conversation, role, &args.text, attachment)
        .await
        .context("Failed to record turn")?;
    println!(
        "{} Recorded {} turn #{} in {}",
        "✓".green(),
        role.to_string().cyan(),
        turn_id,
        args.conversation.bold()
    );

    // No workers run in the CLI, so do the maintenance inline
    match service.maintain(&args.conversation).await {
        Ok(report) => {
            for summary in &report.summaries {
                println!(
                    "  Summarized turns {}..{} ({} turns)",
                    summary.start_turn_id, summary.end_turn_id, summary.turn_count
                );
            }
            if report.core_memory_updated {
                println!("  Core memory updated");
            }
        }
        Err(e) if e.is_transient() => {
            println!(
                "{} Maintenance postponed, capability unavailable: {}",
                "⚠".yellow(),
                e
            );
        }
        Err(e) => {
            service.shutdown().await;
            return Err(e).context("Maintenance failed");
        }
    }

    service.shutdown().await;
    Ok(())
}
