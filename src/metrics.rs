//! Latency measurements written by the client workload.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ResultFileError {
    #[error("cannot read result file: {0}")]
    Read(io::Error),
    #[error("cannot parse result file: {0}")]
    Parse(serde_json::Error),
    #[error("metrics.e2e_latency_ms is not a valid latency: {0}")]
    InvalidLatency(f64),
}

/// The subset of the client's result file this tool understands. Only
/// `metrics.e2e_latency_ms` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientResult {
    pub metrics: ClientMetrics,
    #[serde(default)]
    pub raw_data: RawSamples,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientMetrics {
    pub e2e_latency_ms: f64,
    #[serde(default)]
    pub ttft_ms: Option<f64>,
    #[serde(default)]
    pub throughput_tokens_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSamples {
    #[serde(default)]
    pub e2e_times: Vec<f64>,
    #[serde(default)]
    pub ttft_times: Vec<f64>,
}

impl ClientResult {
    pub fn load(path: &Path) -> Result<Self, ResultFileError> {
        let bytes = fs::read(path).map_err(ResultFileError::Read)?;
        let parsed: Self = serde_json::from_slice(&bytes).map_err(ResultFileError::Parse)?;
        let latency = parsed.metrics.e2e_latency_ms;
        if !latency.is_finite() || latency < 0.0 {
            return Err(ResultFileError::InvalidLatency(latency));
        }
        Ok(parsed)
    }

    /// End-to-end latency summary. Falls back to the single reported mean
    /// when the client did not persist individual samples.
    pub fn e2e_summary(&self) -> LatencySummary {
        LatencySummary::from_samples(self.raw_data.e2e_times.clone())
            .map(|mut summary| {
                // The reported mean is authoritative; clients may round samples.
                summary.mean_ms = self.metrics.e2e_latency_ms;
                summary
            })
            .unwrap_or_else(|| LatencySummary::single(self.metrics.e2e_latency_ms))
    }

    pub fn ttft_ms(&self) -> Option<f64> {
        self.metrics.ttft_ms.or_else(|| {
            LatencySummary::from_samples(self.raw_data.ttft_times.clone()).map(|s| s.mean_ms)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub sample_count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub samples_ms: Vec<f64>,
}

impl LatencySummary {
    pub fn from_samples(samples_ms: Vec<f64>) -> Option<Self> {
        if samples_ms.is_empty() {
            return None;
        }

        let mut sorted = samples_ms.clone();
        sorted.sort_by(f64::total_cmp);
        let mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;

        Some(Self {
            sample_count: sorted.len(),
            mean_ms,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            samples_ms,
        })
    }

    fn single(value_ms: f64) -> Self {
        Self {
            sample_count: 1,
            mean_ms: value_ms,
            p50_ms: value_ms,
            p95_ms: value_ms,
            min_ms: value_ms,
            max_ms: value_ms,
            samples_ms: vec![value_ms],
        }
    }
}

pub fn percentile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let clamped = percentile.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * clamped).round() as usize;
    sorted[idx]
}
