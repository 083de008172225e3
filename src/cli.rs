use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Hybrid passage retrieval over a local document folder"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Document root to index (defaults to ingestion.root, then the current directory)
    #[arg(long, global = true, env = "DOCRAG_ROOT")]
    pub root: Option<PathBuf>,

    /// ColBERT model ID or local path, or "hashing" for the offline backend
    #[arg(long, global = true, env = "DOCRAG_MODEL")]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index new and changed documents under the root
    Reindex(ReindexArgs),
    /// Retrieve the passages most relevant to a query
    Retrieve(RetrieveArgs),
    /// Show index and cache statistics
    Status(StatusArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct ReindexArgs {
    /// Empty every cache and index first, reprocessing all documents
    #[arg(long)]
    pub clear_cache: bool,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RetrieveArgs {
    /// The question or keywords
    pub query: String,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}
