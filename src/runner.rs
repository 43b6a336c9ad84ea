//! Drives the strategy matrix one trial at a time and collects the report.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::{health_url_for, BenchPlan};
use crate::error::TrialError;
use crate::metrics::ClientResult;
use crate::nccl::NcclStats;
use crate::overhead::{OverheadError, OverheadReport};
use crate::report::{
    Baseline, BaselineSource, BenchmarkReport, BenchmarkResult, FailedTrial, ReportEntry,
};
use crate::strategy::{StrategyConfig, TrialPaths};
use crate::supervisor::{Supervisor, TrialSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run every selected strategy.
    Fresh,
    /// Reuse result files left by an earlier run; run only what is missing.
    Resume,
    /// Never start processes; analyze whatever results and logs exist.
    Analyze,
}

pub struct StrategyRunner {
    plan: BenchPlan,
    supervisor: Supervisor,
    cancel: CancellationToken,
    mode: RunMode,
}

/// Baseline resolution state for one run.
struct BaselineTracker {
    current: Option<Baseline>,
    persisted_path: PathBuf,
    persisted_checked: bool,
}

impl BaselineTracker {
    fn new(plan: &BenchPlan) -> Self {
        Self {
            current: plan.baseline_latency_ms.map(|latency_ms| Baseline {
                latency_ms,
                source: BaselineSource::Configured,
            }),
            persisted_path: plan.baseline_result_path(),
            persisted_checked: false,
        }
    }

    /// The baseline to compare `strategy` against, once its own latency is
    /// known.
    fn resolve(&mut self, strategy: &StrategyConfig, measured_ms: f64) -> Option<f64> {
        if self.current.is_none() && strategy.is_baseline() {
            tracing::info!(latency_ms = measured_ms, "baseline measured");
            self.current = Some(Baseline {
                latency_ms: measured_ms,
                source: BaselineSource::Measured,
            });
        }
        if self.current.is_none() && !self.persisted_checked {
            self.persisted_checked = true;
            self.current = load_persisted(&self.persisted_path);
            if self.current.is_none() {
                tracing::warn!(
                    path = %self.persisted_path.display(),
                    "no baseline available; overhead will not be computed"
                );
            }
        }
        self.current.as_ref().map(|b| b.latency_ms)
    }

    /// A baseline trial of this run failed. Whatever it left in its result
    /// file is not a baseline.
    fn baseline_failed(&mut self, result_file: &Path) {
        if self.current.is_none() && self.persisted_path == result_file {
            self.persisted_checked = true;
            tracing::warn!(
                path = %result_file.display(),
                "baseline trial failed; its result will not be used as a baseline"
            );
        }
    }
}

fn load_persisted(path: &Path) -> Option<Baseline> {
    match ClientResult::load(path) {
        Ok(result) => {
            let latency_ms = result.e2e_summary().mean_ms;
            tracing::info!(
                latency_ms,
                path = %path.display(),
                "using persisted baseline"
            );
            Some(Baseline {
                latency_ms,
                source: BaselineSource::Persisted {
                    path: path.to_path_buf(),
                },
            })
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "no persisted baseline");
            None
        }
    }
}

impl StrategyRunner {
    pub fn new(
        plan: BenchPlan,
        supervisor: Supervisor,
        cancel: CancellationToken,
        mode: RunMode,
    ) -> Self {
        Self {
            plan,
            supervisor,
            cancel,
            mode,
        }
    }

    /// Run every strategy in matrix order. Trial failures become failed
    /// entries; cancellation stops the matrix after the in-flight trial.
    pub async fn run(&self) -> BenchmarkReport {
        let mut baseline = BaselineTracker::new(&self.plan);
        let mut entries = Vec::with_capacity(self.plan.strategies.len());
        let mut cancelled = false;
        let total = self.plan.strategies.len();

        for (index, strategy) in self.plan.strategies.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                tracing::warn!(skipped = total - index, "cancelled; skipping remaining strategies");
                break;
            }
            tracing::info!(
                strategy = %strategy,
                kind = strategy.describe(),
                position = index + 1,
                total,
                "running strategy"
            );

            match self.run_strategy(strategy, &mut baseline).await {
                Ok(result) => {
                    if let Some(overhead) = &result.overhead {
                        tracing::info!(
                            label = %result.label,
                            e2e_ms = result.e2e_latency.mean_ms,
                            overhead_ms = overhead.overhead_ms,
                            overhead_percent = overhead.overhead_percent,
                            "strategy completed"
                        );
                    } else {
                        tracing::info!(
                            label = %result.label,
                            e2e_ms = result.e2e_latency.mean_ms,
                            "strategy completed"
                        );
                    }
                    entries.push(ReportEntry::Completed(result));
                }
                Err(err) => {
                    tracing::error!(
                        label = %strategy.label(),
                        kind = err.kind(),
                        error = %err,
                        "strategy failed"
                    );
                    if strategy.is_baseline() {
                        baseline.baseline_failed(&self.plan.trial_paths(strategy).result_file);
                    }
                    let was_cancelled = matches!(err, TrialError::Cancelled);
                    entries.push(ReportEntry::Failed(FailedTrial::new(*strategy, &err)));
                    if was_cancelled {
                        cancelled = true;
                        let skipped = total - index - 1;
                        if skipped > 0 {
                            tracing::warn!(skipped, "cancelled; skipping remaining strategies");
                        }
                        break;
                    }
                }
            }
        }

        BenchmarkReport::new(self.plan.sequence_length, baseline.current, cancelled, entries)
    }

    async fn run_strategy(
        &self,
        strategy: &StrategyConfig,
        baseline: &mut BaselineTracker,
    ) -> Result<BenchmarkResult, TrialError> {
        let paths = self.plan.trial_paths(strategy);

        let reuse = match self.mode {
            RunMode::Fresh => false,
            RunMode::Resume => paths.result_file.exists(),
            RunMode::Analyze => true,
        };
        if reuse {
            tracing::info!(result = %paths.result_file.display(), "reusing existing result");
        } else {
            let spec = self.trial_spec(strategy, paths.clone())?;
            let output = self.supervisor.run_trial(&spec).await?;
            if !output.client_status.success() {
                return Err(TrialError::ClientFailed {
                    status: output.client_status,
                    client_log: paths.client_log.clone(),
                });
            }
            tracing::debug!(elapsed = ?output.elapsed, "trial finished");
        }

        let client = ClientResult::load(&paths.result_file).map_err(|source| {
            TrialError::MissingResult {
                path: paths.result_file.clone(),
                source,
            }
        })?;
        let comm_stats = read_comm_stats(&paths);
        let e2e_latency = client.e2e_summary();

        let baseline_ms = baseline.resolve(strategy, e2e_latency.mean_ms);
        let overhead = match OverheadReport::compute(baseline_ms, e2e_latency.mean_ms) {
            Ok(report) => Some(report),
            Err(OverheadError::MissingBaseline) => None,
            Err(err) => {
                tracing::warn!(error = %err, "overhead not computed");
                None
            }
        };

        let result = BenchmarkResult {
            label: strategy.label(),
            strategy: *strategy,
            ttft_ms: client.ttft_ms(),
            e2e_latency,
            throughput_tokens_per_sec: client.metrics.throughput_tokens_per_sec,
            comm_stats,
            overhead,
            paths,
        };
        let record = record_path(&self.plan.output_dir, strategy);
        if let Err(e) = write_record(&record, &result) {
            tracing::warn!(path = %record.display(), error = %e, "failed to write trial record");
        }
        Ok(result)
    }

    fn trial_spec(&self, strategy: &StrategyConfig, paths: TrialPaths) -> Result<TrialSpec, TrialError> {
        let server_command = self.plan.server_command_for(strategy);
        let health_url = health_url_for(&server_command)?;
        Ok(TrialSpec {
            name: strategy.label(),
            client_command: self.plan.client_command_for(strategy),
            server_command,
            health_url,
            paths,
            env: self.plan.env.clone(),
        })
    }
}

fn read_comm_stats(paths: &TrialPaths) -> NcclStats {
    let Some(log) = &paths.nccl_log else {
        return NcclStats::default();
    };
    match NcclStats::from_log(log) {
        Ok(stats) => {
            if stats.is_empty() {
                tracing::debug!(path = %log.display(), "no communication operations logged");
            }
            stats
        }
        Err(e) => {
            tracing::warn!(path = %log.display(), error = %e, "cannot read NCCL log");
            NcclStats::default()
        }
    }
}

/// `<output>/records/<label>.json`
pub fn record_path(output_dir: &Path, strategy: &StrategyConfig) -> PathBuf {
    output_dir
        .join("records")
        .join(format!("{}.json", strategy.label()))
}

fn write_record(path: &Path, result: &BenchmarkResult) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(result).map_err(io::Error::other)?;
    fs::write(path, json)
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::{MonitorConfig, Timeouts};
    use crate::monitor::DisabledMonitor;

    const SERVER_SCRIPT: &str = r#"[ -n "$NCCL_DEBUG_FILE" ] && printf 'AllReduce busbw 40.0 size 1048576\nSend busbw 20.0\n' > "$NCCL_DEBUG_FILE"; exec sleep 30"#;
    const CLIENT_SCRIPT: &str = r#"[ "$0" = TP2_PP1 ] && exit 4; printf '{"metrics":{"e2e_latency_ms":%s00}}' "$1" > "$BENCH_RESULT_PATH""#;

    async fn health_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        port
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn plan(output_dir: &Path, port: u16, matrix: &[(u32, u32)]) -> BenchPlan {
        BenchPlan {
            output_dir: output_dir.to_path_buf(),
            sequence_length: 128,
            server_command: strings(&["sh", "-c", SERVER_SCRIPT, "sh", "{port}"]),
            client_command: strings(&["sh", "-c", CLIENT_SCRIPT, "{label}", "{gpus}"]),
            port,
            timeouts: Timeouts {
                health_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
                shutdown_grace: Duration::from_millis(500),
            },
            monitor: MonitorConfig {
                enabled: false,
                command: Vec::new(),
            },
            env: BTreeMap::new(),
            baseline_latency_ms: None,
            baseline_result: None,
            strategies: matrix
                .iter()
                .map(|&(tp, pp)| StrategyConfig::new(tp, pp, tp * pp, 128).unwrap())
                .collect(),
        }
    }

    fn runner(plan: BenchPlan, mode: RunMode) -> StrategyRunner {
        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(Arc::new(DisabledMonitor), plan.timeouts, cancel.clone());
        StrategyRunner::new(plan, supervisor, cancel, mode)
    }

    fn completed(entry: &ReportEntry) -> &BenchmarkResult {
        match entry {
            ReportEntry::Completed(r) => r,
            ReportEntry::Failed(f) => panic!("{} failed: {}", f.label, f.message),
        }
    }

    #[tokio::test]
    async fn failing_client_does_not_stop_the_matrix() {
        let tmp = tempfile::tempdir().unwrap();
        let port = health_port().await;
        let report = runner(plan(tmp.path(), port, &[(1, 1), (2, 1), (4, 1)]), RunMode::Fresh)
            .run()
            .await;

        assert_eq!(report.entries.len(), 3);
        assert!(!report.cancelled);
        let labels: Vec<&str> = report.entries.iter().map(ReportEntry::label).collect();
        assert_eq!(labels, ["TP1_PP1", "TP2_PP1", "TP4_PP1"]);

        let base = completed(&report.entries[0]);
        assert_eq!(base.e2e_latency.mean_ms, 100.0);
        assert_eq!(base.overhead.unwrap().overhead_ms, 0.0);
        assert!(base.comm_stats.is_empty());

        match &report.entries[1] {
            ReportEntry::Failed(f) => {
                assert_eq!(f.kind, "client_failed");
                assert!(f.log.as_ref().unwrap().ends_with("client_TP2_PP1.log"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let tp4 = completed(&report.entries[2]);
        let overhead = tp4.overhead.unwrap();
        assert_eq!(overhead.overhead_ms, 300.0);
        assert_eq!(overhead.overhead_percent, 75.0);
        assert_eq!(tp4.comm_stats.total_ops(), 2);
        assert_eq!(tp4.comm_stats.average_bandwidth_gbps(), 30.0);

        let baseline = report.baseline.as_ref().unwrap();
        assert_eq!(baseline.source, BaselineSource::Measured);

        let record = record_path(tmp.path(), &tp4.strategy);
        let saved: serde_json::Value =
            serde_json::from_slice(&fs::read(&record).unwrap()).unwrap();
        assert_eq!(saved["overhead"]["overhead_ms"], 300.0);
        assert!(!record_path(tmp.path(), &StrategyConfig::new(2, 1, 2, 128).unwrap()).exists());
    }

    #[tokio::test]
    async fn configured_baseline_wins_over_measurement() {
        let tmp = tempfile::tempdir().unwrap();
        let port = health_port().await;
        let mut plan = plan(tmp.path(), port, &[(1, 1), (1, 4)]);
        plan.baseline_latency_ms = Some(200.0);
        let report = runner(plan, RunMode::Fresh).run().await;

        assert_eq!(report.baseline.as_ref().unwrap().source, BaselineSource::Configured);
        let pp4 = completed(&report.entries[1]);
        assert_eq!(pp4.overhead.unwrap().overhead_ms, 200.0);
        // Faster than the configured baseline: no overhead, never negative.
        let base = completed(&report.entries[0]);
        assert_eq!(base.overhead.unwrap().overhead_ms, 0.0);
    }

    fn write_result(plan: &BenchPlan, tp: u32, pp: u32, latency: f64) {
        let strategy = StrategyConfig::new(tp, pp, tp * pp, plan.sequence_length).unwrap();
        let paths = plan.trial_paths(&strategy);
        paths.prepare().unwrap();
        fs::write(
            &paths.result_file,
            format!(r#"{{"metrics":{{"e2e_latency_ms":{latency}}}}}"#),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn analyze_uses_persisted_baseline_without_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = plan(tmp.path(), 1, &[(2, 1), (2, 2)]);
        plan.server_command = strings(&["/nonexistent/server", "{port}"]);
        write_result(&plan, 1, 1, 1000.0);
        write_result(&plan, 2, 1, 1200.0);

        let report = runner(plan, RunMode::Analyze).run().await;

        let baseline = report.baseline.as_ref().unwrap();
        assert!(matches!(baseline.source, BaselineSource::Persisted { .. }));
        let tp2 = completed(&report.entries[0]);
        let overhead = tp2.overhead.unwrap();
        assert_eq!(overhead.overhead_ms, 200.0);
        assert!((overhead.overhead_percent - 16.67).abs() < 0.01);

        match &report.entries[1] {
            ReportEntry::Failed(f) => assert_eq!(f.kind, "missing_result"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_runs_only_missing_strategies() {
        let tmp = tempfile::tempdir().unwrap();
        let port = health_port().await;
        let plan = plan(tmp.path(), port, &[(1, 1), (2, 2)]);
        write_result(&plan, 1, 1, 500.0);

        let report = runner(plan, RunMode::Resume).run().await;

        let base = completed(&report.entries[0]);
        assert_eq!(base.e2e_latency.mean_ms, 500.0);
        assert!(!tmp.path().join("logs/server_TP1_PP1.log").exists());
        let tp2pp2 = completed(&report.entries[1]);
        assert_eq!(tp2pp2.e2e_latency.mean_ms, 400.0);
        assert_eq!(tp2pp2.overhead.unwrap().overhead_ms, 0.0);
        assert!(tmp.path().join("logs/server_TP2_PP2.log").exists());
    }

    #[tokio::test]
    async fn missing_baseline_leaves_overhead_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let port = health_port().await;
        let report = runner(plan(tmp.path(), port, &[(4, 1)]), RunMode::Fresh).run().await;

        assert!(report.baseline.is_none());
        let tp4 = completed(&report.entries[0]);
        assert!(tp4.overhead.is_none());
    }

    #[tokio::test]
    async fn failed_baseline_trial_is_not_reused_as_persisted_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let port = health_port().await;
        let mut plan = plan(tmp.path(), port, &[(1, 1), (2, 1)]);
        plan.client_command = strings(&[
            "sh",
            "-c",
            r#"printf '{"metrics":{"e2e_latency_ms":%s00}}' "$1" > "$BENCH_RESULT_PATH"; [ "$0" = TP1_PP1 ] && exit 3; exit 0"#,
            "{label}",
            "{gpus}",
        ]);
        let report = runner(plan, RunMode::Fresh).run().await;

        match &report.entries[0] {
            ReportEntry::Failed(f) => assert_eq!(f.kind, "client_failed"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(tmp.path().join("results/result_TP1_PP1_SL128.json").exists());
        assert!(report.baseline.is_none());
        let tp2 = completed(&report.entries[1]);
        assert_eq!(tp2.e2e_latency.mean_ms, 200.0);
        assert!(tp2.overhead.is_none());
    }

    #[tokio::test]
    async fn cancelled_run_skips_everything_left() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner(plan(tmp.path(), 1, &[(1, 1), (2, 1)]), RunMode::Fresh);
        runner.cancel.cancel();
        let report = runner.run().await;
        assert!(report.cancelled);
        assert!(report.entries.is_empty());
    }

    #[tokio::test]
    async fn bad_port_argument_is_a_per_trial_configuration_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = plan(tmp.path(), 1, &[(1, 1)]);
        plan.server_command = strings(&["serve", "--model", "{label}"]);
        let report = runner(plan, RunMode::Fresh).run().await;
        match &report.entries[0] {
            ReportEntry::Failed(f) => assert_eq!(f.kind, "configuration"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
