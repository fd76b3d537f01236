//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kouri_memory::Role;

/// KouriChat memory CLI
///
/// Inspect and maintain the conversation memory of persona chats.
/// Conversations are addressed as `avatar:user`.
#[derive(Parser, Debug)]
#[command(name = "kouri")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Config file (defaults to ~/.kouri/config.toml)
    #[arg(long, global = true, env = "KOURI_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record one turn, then run due maintenance
    Record(RecordArgs),

    /// Print the reply context for a query
    Context {
        /// Conversation key (avatar:user)
        conversation: String,

        /// The live user message
        query: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Summarize the oldest eligible block now
    Summarize {
        /// Conversation key (avatar:user)
        conversation: String,
    },

    /// Rebuild the embedding index from stored turns and summaries
    Reindex,

    /// Check coverage and index consistency of a conversation
    Verify {
        /// Conversation key (avatar:user)
        conversation: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Remove orphaned index rows and lift a halt if consistent
    Repair {
        /// Conversation key (avatar:user)
        conversation: String,
    },

    /// Delete a conversation and everything derived from it
    Forget {
        /// Conversation key (avatar:user)
        conversation: String,

        /// Skip the confirmation check
        #[arg(short, long)]
        yes: bool,
    },

    /// Show memory statistics
    Stats {
        /// Limit to one conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show version
    Version,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Conversation key (avatar:user)
    pub conversation: String,

    /// Turn text
    pub text: String,

    /// Speaker
    #[arg(short, long, value_enum, default_value_t = RoleArg::User)]
    pub role: RoleArg,

    /// Image reference attached to the turn
    #[arg(long)]
    pub image: Option<String>,

    /// Description of the attached image
    #[arg(long, requires = "image")]
    pub image_description: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    User,
    Assistant,
    System,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => Role::User,
            RoleArg::Assistant => Role::Assistant,
            RoleArg::System => Role::System,
        }
    }
}
