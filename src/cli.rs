// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `chunkdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "chunkdag",
    version,
    about = "Run a DAG of chunked pipeline stages with retries and straggler backups.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Chunkdag.toml")]
    pub config: PathBuf,

    /// Parse + validate, print the DAG and what would run, but execute nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Run every node, even ones the resume ledger says are computed.
    #[arg(long)]
    pub force: bool,

    /// Launch backup copies of straggling calls (overrides `[executor]`).
    #[arg(long)]
    pub use_backups: bool,

    /// Failures tolerated per mappable stage (overrides `[executor]`).
    #[arg(long, value_name = "N")]
    pub max_failures: Option<usize>,

    /// Write one JSON line per completed work item to this file.
    #[arg(long, value_name = "PATH")]
    pub events: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CHUNKDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides_parse() {
        let args = CliArgs::parse_from(["chunkdag"]);
        assert_eq!(args.config, PathBuf::from("Chunkdag.toml"));
        assert!(!args.force && !args.use_backups && !args.dry_run);
        assert!(args.max_failures.is_none());

        let args = CliArgs::parse_from([
            "chunkdag",
            "--config",
            "dag.toml",
            "--use-backups",
            "--max-failures",
            "7",
            "--events",
            "ev.jsonl",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, PathBuf::from("dag.toml"));
        assert!(args.use_backups);
        assert_eq!(args.max_failures, Some(7));
        assert_eq!(args.events, Some(PathBuf::from("ev.jsonl")));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
