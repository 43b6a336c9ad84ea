//! Communication overhead relative to the single-GPU baseline.
//!
//! The baseline is pure computation. Whatever a multi-GPU strategy spends
//! above it is attributed to parallelism, and is expressed as a share of the
//! strategy's own measured latency so percentages are comparable across
//! strategies.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OverheadError {
    #[error("no baseline latency available; run the TP1_PP1 strategy first or supply a persisted baseline")]
    MissingBaseline,
    #[error("invalid {which} latency: {value} ms")]
    InvalidLatency { which: &'static str, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverheadReport {
    pub baseline_latency_ms: f64,
    pub measured_latency_ms: f64,
    pub overhead_ms: f64,
    pub overhead_percent: f64,
}

impl OverheadReport {
    pub fn compute(baseline_ms: Option<f64>, measured_ms: f64) -> Result<Self, OverheadError> {
        let baseline_ms = baseline_ms.ok_or(OverheadError::MissingBaseline)?;
        if !(baseline_ms.is_finite() && baseline_ms >= 0.0) {
            return Err(OverheadError::InvalidLatency {
                which: "baseline",
                value: baseline_ms,
            });
        }
        if !(measured_ms.is_finite() && measured_ms >= 0.0) {
            return Err(OverheadError::InvalidLatency {
                which: "measured",
                value: measured_ms,
            });
        }

        let (overhead_ms, overhead_percent) = if measured_ms > baseline_ms {
            let overhead = measured_ms - baseline_ms;
            // A negligible baseline can round the share up to exactly 100.
            (overhead, (overhead / measured_ms * 100.0).min(percent_ceiling()))
        } else {
            (0.0, 0.0)
        };

        Ok(Self {
            baseline_latency_ms: baseline_ms,
            measured_latency_ms: measured_ms,
            overhead_ms,
            overhead_percent,
        })
    }
}

fn percent_ceiling() -> f64 {
    f64::from_bits(100.0_f64.to_bits() - 1)
}
