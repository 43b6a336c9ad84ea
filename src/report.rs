//! Per-trial results and the comparative report written after a run.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::TrialError;
use crate::metrics::LatencySummary;
use crate::nccl::{CommOp, NcclStats};
use crate::overhead::OverheadReport;
use crate::strategy::{StrategyConfig, TrialPaths};

pub const REPORT_JSON: &str = "benchmark_report.json";
pub const REPORT_CSV: &str = "comm_overhead.csv";

const CSV_HEADER: [&str; 9] = [
    "Strategy",
    "TP",
    "PP",
    "GPUs",
    "E2E_Latency_ms",
    "Overhead_ms",
    "Overhead_percent",
    "AllReduce_ops",
    "Total_comm_ops",
];

/// Everything measured for one completed strategy. Written once, to the
/// strategy's record file, and then only read.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub label: String,
    pub strategy: StrategyConfig,
    pub ttft_ms: Option<f64>,
    pub e2e_latency: LatencySummary,
    pub throughput_tokens_per_sec: Option<f64>,
    pub comm_stats: NcclStats,
    pub overhead: Option<OverheadReport>,
    pub paths: TrialPaths,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTrial {
    pub label: String,
    pub strategy: StrategyConfig,
    pub kind: &'static str,
    pub message: String,
    pub log: Option<PathBuf>,
}

impl FailedTrial {
    pub fn new(strategy: StrategyConfig, err: &TrialError) -> Self {
        Self {
            label: strategy.label(),
            strategy,
            kind: err.kind(),
            message: err.to_string(),
            log: err.diagnostic_log().map(Path::to_path_buf),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportEntry {
    Completed(BenchmarkResult),
    Failed(FailedTrial),
}

impl ReportEntry {
    pub fn label(&self) -> &str {
        match self {
            ReportEntry::Completed(r) => &r.label,
            ReportEntry::Failed(f) => &f.label,
        }
    }

    pub fn strategy(&self) -> &StrategyConfig {
        match self {
            ReportEntry::Completed(r) => &r.strategy,
            ReportEntry::Failed(f) => &f.strategy,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ReportEntry::Completed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineSource {
    /// `baseline_latency_ms` in the matrix configuration.
    Configured,
    /// The TP1_PP1 trial of this run.
    Measured,
    /// A result file left behind by an earlier run.
    Persisted { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub latency_ms: f64,
    pub source: BaselineSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub generated_at_epoch_secs: u64,
    pub sequence_length: u32,
    pub baseline: Option<Baseline>,
    /// The run was interrupted; strategies after the last entry never ran.
    pub cancelled: bool,
    pub entries: Vec<ReportEntry>,
}

impl BenchmarkReport {
    pub fn new(
        sequence_length: u32,
        baseline: Option<Baseline>,
        cancelled: bool,
        entries: Vec<ReportEntry>,
    ) -> Self {
        let generated_at_epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            generated_at_epoch_secs,
            sequence_length,
            baseline,
            cancelled,
            entries,
        }
    }

    pub fn completed(&self) -> impl Iterator<Item = &BenchmarkResult> {
        self.entries.iter().filter_map(|e| match e {
            ReportEntry::Completed(r) => Some(r),
            ReportEntry::Failed(_) => None,
        })
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_completed()).count()
    }

    /// Write the JSON report and the CSV summary into `output_dir`.
    pub fn write_all(&self, output_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        let json_path = output_dir.join(REPORT_JSON);
        let csv_path = output_dir.join(REPORT_CSV);
        self.write_json(&json_path)?;
        self.write_csv(&csv_path)?;
        Ok((json_path, csv_path))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serialize benchmark report")?;
        fs::write(path, json).with_context(|| format!("write {}", path.display()))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
        writer.write_record(CSV_HEADER)?;
        for entry in &self.entries {
            writer.write_record(csv_row(entry))?;
        }
        writer
            .flush()
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Human-readable summary for the terminal.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<10} {:>5} {:>14} {:>13} {:>11} {:>10} {:>10}  {}",
            "Strategy", "GPUs", "E2E (ms)", "Overhead (ms)", "Overhead %", "AllReduce", "BusBW GB/s", "Status"
        );
        let _ = writeln!(out, "{}", "-".repeat(92));
        for entry in &self.entries {
            let gpus = entry.strategy().gpu_count;
            match entry {
                ReportEntry::Completed(r) => {
                    let (ms, pct) = match &r.overhead {
                        Some(o) => (format!("{:.2}", o.overhead_ms), format!("{:.2}", o.overhead_percent)),
                        None => ("-".to_string(), "-".to_string()),
                    };
                    let _ = writeln!(
                        out,
                        "{:<10} {:>5} {:>14.2} {:>13} {:>11} {:>10} {:>10.2}  ok",
                        r.label,
                        gpus,
                        r.e2e_latency.mean_ms,
                        ms,
                        pct,
                        r.comm_stats.count(CommOp::AllReduce),
                        r.comm_stats.average_bandwidth_gbps(),
                    );
                }
                ReportEntry::Failed(f) => {
                    let _ = writeln!(
                        out,
                        "{:<10} {:>5} {:>14} {:>13} {:>11} {:>10} {:>10}  FAILED ({})",
                        f.label, gpus, "-", "-", "-", "-", "-", f.kind
                    );
                }
            }
        }
        match &self.baseline {
            Some(b) => {
                let _ = writeln!(out, "\nbaseline: {:.2} ms ({})", b.latency_ms, source_name(&b.source));
            }
            None => {
                let _ = writeln!(out, "\nbaseline: unavailable, overhead not computed");
            }
        }
        if self.cancelled {
            let _ = writeln!(out, "run was cancelled; remaining strategies were skipped");
        }
        out
    }
}

fn source_name(source: &BaselineSource) -> String {
    match source {
        BaselineSource::Configured => "configured".to_string(),
        BaselineSource::Measured => "measured this run".to_string(),
        BaselineSource::Persisted { path } => format!("from {}", path.display()),
    }
}

fn csv_row(entry: &ReportEntry) -> Vec<String> {
    let s = entry.strategy();
    let mut row = vec![
        entry.label().to_string(),
        s.tensor_parallel_degree.to_string(),
        s.pipeline_parallel_degree.to_string(),
        s.gpu_count.to_string(),
    ];
    match entry {
        ReportEntry::Completed(r) => {
            row.push(format!("{:.2}", r.e2e_latency.mean_ms));
            match &r.overhead {
                Some(o) => {
                    row.push(format!("{:.2}", o.overhead_ms));
                    row.push(format!("{:.1}", o.overhead_percent));
                }
                None => row.extend([String::new(), String::new()]),
            }
            row.push(r.comm_stats.count(CommOp::AllReduce).to_string());
            row.push(r.comm_stats.total_ops().to_string());
        }
        ReportEntry::Failed(_) => row.extend(std::iter::repeat(String::new()).take(5)),
    }
    row
}
