//! Command-line entry points. Mirrors the teacher's `Cli`/`Commands`
//! subcommand shape (`src/main.rs`): a default action plus named
//! subcommands for the alternate run modes.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "context-runtime")]
#[command(about = "A local, single-user context store and self-improvement loop for AI agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the stdio MCP tool-call surface on stdin/stdout (default).
    Mcp,
    /// Serve the REST API and the periodic improvement tick.
    Serve {
        /// Host to bind to.
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one improvement tick immediately and exit.
    Tick,
}
