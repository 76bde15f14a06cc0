// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod exec;
pub mod logging;
pub mod pipeline;
pub mod remote;
pub mod resume;
pub mod stage;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{load_and_validate, ConfigFile};
use crate::dag::{build_dag, ComputedCheck, Dag, DagExecutor, NodeFlag};
use crate::dispatch::DispatchOptions;
use crate::events::{JsonLinesCallback, LoggingCallback};
use crate::remote::LocalExecutor;
use crate::resume::{fingerprints, FingerprintLedger};
use crate::stage::{StageItem, StageReport};

/// High-level entry point used by `main.rs`.
///
/// Loads and validates the config, builds the DAG, and runs it on the local
/// executor until every node is computed, a stage fails fatally, or Ctrl-C
/// is pressed.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;
    let options = dispatch_options(&cfg, &args);
    options.validate()?;

    let dag = build_dag(&cfg)?;
    let computed = computed_check(&cfg, &args)?;

    if args.dry_run {
        print_dry_run(&cfg, &dag, computed.as_ref())?;
        return Ok(());
    }

    let mut dag_executor = DagExecutor::new(options)
        .with_callback(Arc::new(LoggingCallback))
        .with_computed_check(computed);
    if let Some(path) = &args.events {
        dag_executor = dag_executor.with_callback(Arc::new(JsonLinesCallback::create(path)?));
    }

    let mut executor: LocalExecutor<StageItem, StageReport> =
        LocalExecutor::new(cfg.executor().max_workers);

    tokio::select! {
        report = dag_executor.execute_dag(&dag, &mut executor) => {
            let report = report?;
            info!(
                executed = report.executed.len(),
                skipped = report.skipped.len(),
                tasks = report.tasks_completed,
                "all nodes computed"
            );
            Ok(())
        }
        () = interrupted(tokio::signal::ctrl_c()) => {
            anyhow::bail!("interrupted");
        }
    }
}

/// Resolve once `signal` fires. If the listener cannot be installed, log it
/// and never resolve, so the run continues without Ctrl-C handling.
async fn interrupted<F>(signal: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Config-file dispatch options with CLI overrides applied.
fn dispatch_options(cfg: &ConfigFile, args: &CliArgs) -> DispatchOptions {
    let mut options = cfg.dispatch_options();
    if args.use_backups {
        options.use_backups = true;
    }
    if let Some(max_failures) = args.max_failures {
        options.max_failures = max_failures;
    }
    options
}

fn computed_check(cfg: &ConfigFile, args: &CliArgs) -> Result<Arc<dyn ComputedCheck>> {
    if !cfg.resume().enabled {
        debug!("resume disabled; trusting node flags only");
        return Ok(Arc::new(NodeFlag));
    }
    let root = config_root_dir(&args.config);
    let ledger = FingerprintLedger::open(&root, fingerprints(cfg)?, args.force)?;
    debug!(path = ?ledger.path(), force = args.force, "opened resume ledger");
    Ok(Arc::new(ledger))
}

/// Directory holding the config file, or the current directory for a bare
/// file name.
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Print nodes in execution order, their stages and whether they would run.
fn print_dry_run(cfg: &ConfigFile, dag: &Dag, computed: &dyn ComputedCheck) -> Result<()> {
    println!("chunkdag dry-run");
    println!("  executor.max_workers = {}", cfg.executor().max_workers);
    println!("  executor.max_failures = {}", cfg.executor().max_failures);
    println!("  executor.use_backups = {}", cfg.executor().use_backups);
    println!();

    let order = dag.topological_order()?;
    println!("nodes ({}):", order.len());
    for node in order {
        let status = if computed.already_computed(node) {
            "skip (computed)"
        } else {
            "run"
        };
        println!("  - {} [{}]", node.name, status);

        let deps = dag.dependencies_of(&node.name);
        if !deps.is_empty() {
            println!("      after: {:?}", deps);
        }
        if let Some(stage_cfgs) = cfg.nodes().get(&node.name).map(|n| &n.stages) {
            for stage in stage_cfgs {
                let tasks = node
                    .pipeline
                    .as_ref()
                    .and_then(|p| p.stages.iter().find(|s| s.name == stage.name))
                    .map_or(1, |s| s.num_tasks());
                println!("      stage {} ({} tasks): {}", stage.name, tasks, stage.cmd);
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
