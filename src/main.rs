//! commbench: measure what tensor and pipeline parallelism cost in
//! communication.
//!
//!   commbench run --config matrix.json        → run the strategy matrix
//!   commbench trial --config trial.json       → one server/client trial
//!   commbench analyze --config matrix.json    → re-analyze existing results

mod config;
mod error;
mod logging;
mod metrics;
mod monitor;
mod nccl;
mod overhead;
mod process;
mod report;
mod runner;
mod strategy;
mod supervisor;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{BenchConfig, MonitorConfig, TrialConfig};
use crate::metrics::{ClientResult, LatencySummary};
use crate::monitor::{CommandMonitor, DisabledMonitor, ResourceMonitor};
use crate::nccl::NcclStats;
use crate::runner::{RunMode, StrategyRunner};
use crate::supervisor::{Supervisor, TrialSpec};

/// Exit status after an operator interrupt (128 + SIGINT).
const INTERRUPTED: u8 = 130;

// ─── Help text ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = "\
CONFIGURATION:
    Matrix files list command templates and the ordered strategies:

    {
      \"output_dir\": \"bench_out\",
      \"sequence_length\": 128,
      \"server_command\": [\"python3\", \"serve.py\", \"--tp\", \"{tp}\", \"--pp\", \"{pp}\", \"{port}\"],
      \"client_command\": [\"python3\", \"client.py\", \"--seq-len\", \"{seq_len}\"],
      \"strategies\": [{\"tp\": 1, \"pp\": 1}, {\"tp\": 2, \"pp\": 1}, {\"tp\": 2, \"pp\": 2}]
    }

    The server command's last argument must be the port its /health
    endpoint listens on. The client writes its JSON result to
    $BENCH_RESULT_PATH.

ENVIRONMENT:
    COMMBENCH_CONFIG        Matrix config for `run` and `analyze`
    COMMBENCH_LOG_LEVEL     Default for --log-level";

const RUN_AFTER_HELP: &str = "\
EXAMPLES:
    commbench run --config matrix.json
    commbench run --config matrix.json --strategy TP1_PP1 --strategy TP2_PP2
    commbench run --config matrix.json --resume";

// ─── CLI definition ───────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "commbench",
    version,
    about = "Measure communication overhead of parallel inference serving strategies",
    after_help = AFTER_HELP,
    disable_help_subcommand = true
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "COMMBENCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the strategy matrix and write the comparative report
    #[command(after_help = RUN_AFTER_HELP)]
    Run {
        /// Matrix configuration file
        #[arg(long, env = "COMMBENCH_CONFIG")]
        config: PathBuf,
        /// Only run these strategies (e.g. TP2_PP1); repeatable
        #[arg(long = "strategy", value_name = "LABEL")]
        strategies: Vec<String>,
        /// Reuse result files from an earlier run instead of re-running them
        #[arg(long)]
        resume: bool,
    },

    /// Run a single server/client trial
    Trial {
        /// Trial configuration file
        #[arg(long)]
        config: PathBuf,
        /// Do not start the resource monitor
        #[arg(long)]
        no_monitor: bool,
    },

    /// Rebuild the report from existing results and NCCL logs
    Analyze {
        /// Matrix configuration file
        #[arg(long, env = "COMMBENCH_CONFIG")]
        config: PathBuf,
        /// Only analyze these strategies; repeatable
        #[arg(long = "strategy", value_name = "LABEL")]
        strategies: Vec<String>,
    },
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = logging::init_tracing(&cli.log_level, &cli.log_format) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async move {
        match cli.command {
            Commands::Run {
                config,
                strategies,
                resume,
            } => {
                let mode = if resume { RunMode::Resume } else { RunMode::Fresh };
                run_matrix(&config, &strategies, mode).await
            }
            Commands::Trial { config, no_monitor } => run_trial(&config, no_monitor).await,
            Commands::Analyze { config, strategies } => {
                run_matrix(&config, &strategies, RunMode::Analyze).await
            }
        }
    });

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Cancel `token` on the first Ctrl-C. In-flight trials still tear down.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received; stopping after the current trial cleans up");
                token.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "cannot listen for Ctrl-C"),
        }
    });
}

fn build_monitor(config: &MonitorConfig) -> Arc<dyn ResourceMonitor> {
    if config.enabled {
        Arc::new(CommandMonitor::new(config.command.clone()))
    } else {
        Arc::new(DisabledMonitor)
    }
}

// ─── Matrix mode ──────────────────────────────────────────────────────────────

async fn run_matrix(config: &Path, strategies: &[String], mode: RunMode) -> Result<ExitCode> {
    let mut plan = BenchConfig::load(config)
        .with_context(|| format!("invalid matrix configuration {}", config.display()))?;
    plan.select(strategies)?;
    std::fs::create_dir_all(&plan.output_dir)
        .with_context(|| format!("create output dir {}", plan.output_dir.display()))?;

    tracing::info!(
        config = %config.display(),
        output = %plan.output_dir.display(),
        strategies = plan.strategies.len(),
        sequence_length = plan.sequence_length,
        ?mode,
        "starting benchmark"
    );

    let cancel = CancellationToken::new();
    let monitor = if mode == RunMode::Analyze {
        Arc::new(DisabledMonitor) as Arc<dyn ResourceMonitor>
    } else {
        cancel_on_interrupt(cancel.clone());
        build_monitor(&plan.monitor)
    };
    let supervisor = Supervisor::new(monitor, plan.timeouts, cancel.clone());
    let output_dir = plan.output_dir.clone();

    let report = StrategyRunner::new(plan, supervisor, cancel, mode).run().await;
    let (json_path, csv_path) = report.write_all(&output_dir)?;

    print!("{}", report.render_table());
    println!("report: {}", json_path.display());
    println!("csv:    {}", csv_path.display());

    if report.cancelled {
        return Ok(ExitCode::from(INTERRUPTED));
    }
    let failed = report.failed_count();
    if failed > 0 {
        tracing::warn!(
            failed,
            completed = report.completed().count(),
            "some strategies failed"
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

// ─── Single trial ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TrialSummary {
    result_file: PathBuf,
    e2e_latency: LatencySummary,
    ttft_ms: Option<f64>,
    throughput_tokens_per_sec: Option<f64>,
    comm_stats: Option<NcclStats>,
}

async fn run_trial(config: &Path, no_monitor: bool) -> Result<ExitCode> {
    let trial = TrialConfig::load(config)
        .with_context(|| format!("invalid trial configuration {}", config.display()))?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let monitor = if no_monitor {
        Arc::new(DisabledMonitor) as Arc<dyn ResourceMonitor>
    } else {
        build_monitor(&trial.monitor)
    };
    let supervisor = Supervisor::new(monitor, trial.timeouts, cancel);

    let name = config
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "trial".to_string());
    let spec = TrialSpec {
        name,
        server_command: trial.server_command,
        client_command: trial.client_command,
        health_url: trial.health_url,
        paths: trial.paths,
        env: trial.env,
    };

    let output = match supervisor.run_trial(&spec).await {
        Ok(output) => output,
        Err(error::TrialError::Cancelled) => return Ok(ExitCode::from(INTERRUPTED)),
        Err(err) => return Err(err.into()),
    };
    if !output.client_status.success() {
        eprintln!(
            "error: client exited with {}; see {}",
            output.client_status,
            spec.paths.client_log.display()
        );
        // Mirror the client's own exit code where there is one.
        let code = output
            .client_status
            .code()
            .and_then(|c| u8::try_from(c).ok())
            .filter(|&c| c != 0)
            .unwrap_or(1);
        return Ok(ExitCode::from(code));
    }

    let client = ClientResult::load(&output.result_file)
        .with_context(|| format!("client result {}", output.result_file.display()))?;
    let comm_stats = match &spec.paths.nccl_log {
        Some(path) => Some(
            NcclStats::from_log(path).with_context(|| format!("read NCCL log {}", path.display()))?,
        ),
        None => None,
    };
    let summary = TrialSummary {
        result_file: output.result_file,
        e2e_latency: client.e2e_summary(),
        ttft_ms: client.ttft_ms(),
        throughput_tokens_per_sec: client.metrics.throughput_tokens_per_sec,
        comm_stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!(elapsed = ?output.elapsed, "trial complete");
    Ok(ExitCode::SUCCESS)
}
