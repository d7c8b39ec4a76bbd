use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tandem_core::models::ResolutionKind;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Keep records in step across your devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local store file
    #[arg(long, global = true, value_name = "PATH", env = "TANDEM_STORE_PATH")]
    pub store: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update a record locally
    #[command(alias = "set")]
    Put {
        /// Record data type (e.g. `user_preferences`)
        data_type: String,
        /// Record id within the data type
        id: String,
        /// JSON payload
        json: String,
        /// Server version this edit is based on (defaults to the cached version)
        #[arg(long, value_name = "N")]
        base_version: Option<u64>,
        /// Sync right away
        #[arg(long)]
        now: bool,
    },
    /// Delete a record locally
    #[command(alias = "rm")]
    Delete {
        data_type: String,
        id: String,
        /// Sync right away
        #[arg(long)]
        now: bool,
    },
    /// Show the cached copy of a record
    Get {
        data_type: String,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull remote changes and push local ones
    Sync {
        /// Ignore the watermark and pull everything
        #[arg(long)]
        full: bool,
    },
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts seen by this device
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        conflict_id: String,
        #[arg(value_enum)]
        resolution: ResolutionArg,
        /// Resolved JSON payload (required for `manual`)
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },
    /// Sync in the background and print events until Ctrl-C
    Watch,
    /// Drop cached records, the watermark and unsent changes
    Reset,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    Merge,
    Override,
    Manual,
}

impl From<ResolutionArg> for ResolutionKind {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::Merge => Self::Merge,
            ResolutionArg::Override => Self::Override,
            ResolutionArg::Manual => Self::Manual,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}

impl From<CompletionShell> for Shell {
    fn from(value: CompletionShell) -> Self {
        match value {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::Fish => Self::Fish,
            CompletionShell::PowerShell => Self::PowerShell,
        }
    }
}
