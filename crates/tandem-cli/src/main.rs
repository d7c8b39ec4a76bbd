//! Tandem CLI - keep records in step across devices from the terminal

mod cli;
mod commands;
mod error;
mod session;

#[cfg(test)]
mod tests;

use clap::Parser;
use tandem_core::client::HttpTransport;

use crate::cli::{Cli, Commands};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::records::{run_delete, run_get, run_put};
use crate::commands::sync::{run_reset, run_status, run_sync, run_watch};
use crate::error::CliError;
use crate::session::{resolve_store_path, Session};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tandem=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let store_path = resolve_store_path(cli.store)?;
    let session = Session::open(&store_path)?;
    let outcome = dispatch(&session, cli.command).await;
    session.save()?;
    outcome
}

async fn dispatch(session: &Session<HttpTransport>, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Put {
            data_type,
            id,
            json,
            base_version,
            now,
        } => run_put(session, &data_type, &id, &json, base_version, now).await,
        Commands::Delete { data_type, id, now } => run_delete(session, &data_type, &id, now).await,
        Commands::Get {
            data_type,
            id,
            json,
        } => run_get(session, &data_type, &id, json),
        Commands::Sync { full } => run_sync(session, full).await.map(|_| ()),
        Commands::Status { json } => run_status(session, json),
        Commands::Conflicts { json } => run_conflicts(session, json),
        Commands::Resolve {
            conflict_id,
            resolution,
            data,
        } => run_resolve(session, &conflict_id, resolution.into(), data.as_deref()).await,
        Commands::Watch => run_watch(session).await,
        Commands::Reset => run_reset(session),
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
    }
}
