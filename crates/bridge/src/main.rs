mod cli;
mod shutdown;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use solver_bridge_core::{BoardState, load_settings, save_settings};
use solver_bridge_engine::{ExecutionCoordinator, open_bridge};

use crate::cli::{Cli, Command};
use crate::shutdown::interrupted;

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_puzzle(puzzle: &str) -> anyhow::Result<BoardState> {
    BoardState::parse(puzzle).context("invalid puzzle")
}

async fn run_command(bridge: &ExecutionCoordinator, command: &Command) -> anyhow::Result<Value> {
    let value = match command {
        Command::Version => serde_json::to_value(bridge.get_version().await?)?,
        Command::Hint { puzzle } => {
            let board = parse_puzzle(puzzle)?;
            serde_json::to_value(bridge.find_next_move(&board).await?)?
        }
        Command::Solve { puzzle } => {
            let board = parse_puzzle(puzzle)?;
            serde_json::to_value(bridge.solve_all(&board).await?)?
        }
        Command::Validate { puzzle } => {
            let board = parse_puzzle(puzzle)?;
            serde_json::to_value(bridge.validate_board(&board).await?)?
        }
        Command::Status => {
            bridge.initialize().await?;
            serde_json::to_value(bridge.status())?
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let saved = match load_settings() {
        Ok(Some(settings)) => settings,
        Ok(None) => Default::default(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to read settings, using defaults");
            Default::default()
        }
    };

    let (config, effective) = cli::resolve(&cli, &saved)?;
    if cli.save {
        save_settings(&effective).context("failed to save settings")?;
    }

    let bridge = open_bridge(&config).context("failed to set up engine bridge")?;

    let outcome = tokio::select! {
        res = run_command(&bridge, &cli.command) => res,
        _ = interrupted() => {
            bridge.cleanup();
            eprintln!("interrupted");
            std::process::exit(130);
        }
    };
    bridge.cleanup();

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
