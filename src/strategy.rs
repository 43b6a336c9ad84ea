//! Strategy matrix entries and the per-trial file layout derived from them.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::TrialError;

/// One point of the parallelism matrix.
///
/// Construct through [`StrategyConfig::new`]; the fields are public for
/// reading and serialization but the invariant `gpu_count == tp * pp` is only
/// checked there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub tensor_parallel_degree: u32,
    pub pipeline_parallel_degree: u32,
    pub gpu_count: u32,
    pub sequence_length: u32,
}

impl StrategyConfig {
    pub fn new(tp: u32, pp: u32, gpu_count: u32, sequence_length: u32) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("tp", tp),
            ("pp", pp),
            ("gpus", gpu_count),
            ("sequence_length", sequence_length),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }
        let expected = tp.checked_mul(pp).ok_or_else(|| {
            ConfigError::Invalid(format!("tp={tp} * pp={pp} overflows the GPU count"))
        })?;
        if gpu_count != expected {
            return Err(ConfigError::Invalid(format!(
                "TP{tp}_PP{pp} needs {expected} GPUs but gpus={gpu_count}"
            )));
        }
        Ok(Self {
            tensor_parallel_degree: tp,
            pipeline_parallel_degree: pp,
            gpu_count,
            sequence_length,
        })
    }

    /// Single GPU, no parallelism. Its latency is pure computation.
    pub fn is_baseline(&self) -> bool {
        self.tensor_parallel_degree == 1 && self.pipeline_parallel_degree == 1
    }

    pub fn label(&self) -> String {
        format!(
            "TP{}_PP{}",
            self.tensor_parallel_degree, self.pipeline_parallel_degree
        )
    }

    pub fn describe(&self) -> &'static str {
        match (self.tensor_parallel_degree, self.pipeline_parallel_degree) {
            (1, 1) => "single-GPU baseline",
            (_, 1) => "tensor parallel",
            (1, _) => "pipeline parallel",
            _ => "hybrid tensor+pipeline",
        }
    }
}

impl fmt::Display for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} GPU{}, seq {})",
            self.label(),
            self.gpu_count,
            if self.gpu_count == 1 { "" } else { "s" },
            self.sequence_length
        )
    }
}

/// Every file a single trial reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialPaths {
    pub server_log: PathBuf,
    pub client_log: PathBuf,
    pub result_file: PathBuf,
    pub monitor_log: PathBuf,
    /// Where the server's NCCL debug output is directed, when known.
    pub nccl_log: Option<PathBuf>,
}

impl TrialPaths {
    /// Layout under a run's output directory:
    ///
    /// ```text
    /// logs/server_<label>.log
    /// logs/client_<label>.log
    /// results/result_<label>_SL<seq>.json
    /// monitor_logs/<label>.csv
    /// nccl_logs/<label>_nccl.log   (multi-GPU only)
    /// ```
    pub fn for_strategy(output_dir: &Path, strategy: &StrategyConfig) -> Self {
        let label = strategy.label();
        Self {
            server_log: output_dir.join("logs").join(format!("server_{label}.log")),
            client_log: output_dir.join("logs").join(format!("client_{label}.log")),
            result_file: output_dir
                .join("results")
                .join(format!("result_{label}_SL{}.json", strategy.sequence_length)),
            monitor_log: output_dir.join("monitor_logs").join(format!("{label}.csv")),
            nccl_log: (strategy.gpu_count > 1)
                .then(|| output_dir.join("nccl_logs").join(format!("{label}_nccl.log"))),
        }
    }

    /// Create the parent directory of every path.
    pub fn prepare(&self) -> Result<(), TrialError> {
        let declared = [
            Some(&self.server_log),
            Some(&self.client_log),
            Some(&self.result_file),
            Some(&self.monitor_log),
            self.nccl_log.as_ref(),
        ];
        for path in declared.into_iter().flatten() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|source| TrialError::Prepare {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }
}
