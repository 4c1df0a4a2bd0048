use std::time::Duration;

use clap::{Parser, Subcommand};

use solver_bridge_core::BridgeSettings;
use solver_bridge_engine::{BridgeConfig, ModuleSource};

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the engine version.
    Version,
    /// Find the next logical deduction for a puzzle.
    Hint {
        /// 81 cells, `1`-`9` for values and `0` or `.` for empty.
        puzzle: String,
    },
    /// Solve a puzzle completely.
    Solve {
        /// 81 cells, `1`-`9` for values and `0` or `.` for empty.
        puzzle: String,
    },
    /// Check a puzzle for rule violations.
    Validate {
        /// 81 cells, `1`-`9` for values and `0` or `.` for empty.
        puzzle: String,
    },
    /// Initialize the bridge and print which path serves calls.
    Status,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "solver-bridge", version, about = "Run solver engine calls off the main thread")]
pub struct Cli {
    /// Engine module URL or filesystem path.
    #[arg(long, env = "SOLVER_BRIDGE_MODULE")]
    pub module: Option<String>,

    /// Registered runtime that instantiates the module.
    #[arg(long, env = "SOLVER_BRIDGE_RUNTIME")]
    pub runtime: Option<String>,

    /// Serve calls on the main thread instead of the worker.
    #[arg(long, env = "SOLVER_BRIDGE_MAIN_THREAD", default_value_t = false)]
    pub main_thread: bool,

    /// Ceiling on waiting for a loaded engine to become ready.
    #[arg(
        long,
        env = "SOLVER_BRIDGE_READINESS_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub readiness_timeout_ms: Option<u64>,

    /// Bound on a single worker call before it is retried on the main thread.
    #[arg(
        long,
        env = "SOLVER_BRIDGE_CALL_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub call_timeout_ms: Option<u64>,

    /// Persist the effective module, runtime, mode and readiness settings.
    #[arg(long, default_value_t = false)]
    pub save: bool,

    /// Log at debug level.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Merge flags over persisted settings. Returns the bridge config and the
/// settings that would be saved with `--save`.
pub fn resolve(cli: &Cli, saved: &BridgeSettings) -> anyhow::Result<(BridgeConfig, BridgeSettings)> {
    let module = cli
        .module
        .clone()
        .or_else(|| saved.module.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("no engine module configured (use --module or SOLVER_BRIDGE_MODULE)")
        })?;
    let source: ModuleSource = module.parse().map_err(|err: String| anyhow::anyhow!(err))?;

    let mut config = BridgeConfig::new(source);
    if let Some(runtime) = cli.runtime.clone().or_else(|| saved.runtime.clone()) {
        config.runtime = runtime;
    }
    config.prefer_worker = !cli.main_thread && saved.prefer_worker.unwrap_or(true);
    if let Some(ms) = cli.readiness_timeout_ms.or(saved.readiness_timeout_ms) {
        config.readiness.timeout = Duration::from_millis(ms);
    }
    config.call_timeout = cli.call_timeout_ms.map(Duration::from_millis);

    let effective = BridgeSettings {
        module: Some(module),
        runtime: Some(config.runtime.clone()),
        prefer_worker: Some(config.prefer_worker),
        readiness_timeout_ms: Some(config.readiness.timeout.as_millis() as u64),
    };
    Ok((config, effective))
}
