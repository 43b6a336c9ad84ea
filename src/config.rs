//! JSON configuration for single trials and for full strategy matrices.
//!
//! Single trial (`commbench trial --config trial.json`):
//!
//! ```json
//! {
//!   "server_command": ["python3", "serve.py", "--port", "8000"],
//!   "client_command": ["python3", "client.py"],
//!   "paths": {
//!     "server_log": "logs/server.log",
//!     "client_log": "logs/client.log",
//!     "result_json": "results/result.json"
//!   }
//! }
//! ```
//!
//! Matrix (`commbench run --config matrix.json`): the same commands written as
//! templates with `{tp}`, `{pp}`, `{gpus}`, `{seq_len}`, `{label}` and
//! `{port}` placeholders, plus the ordered `strategies` list. The server
//! command's final argument is always the port the health endpoint binds to.
//!
//! Relative paths are resolved against the directory holding the config file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::strategy::{StrategyConfig, TrialPaths};

pub const DEFAULT_SEQUENCE_LENGTH: u32 = 128;
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_MONITOR_COMMAND: &[&str] = &[
    "nvidia-smi",
    "--query-gpu=timestamp,index,name,utilization.gpu,utilization.memory,\
     memory.total,memory.used,temperature.gpu,power.draw,clocks.sm",
    "--format=csv",
    "--loop-ms=1000",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// The health URL is derived from the server command's last argument.
pub fn health_url_for(server_command: &[String]) -> Result<String, ConfigError> {
    let last = server_command
        .last()
        .ok_or_else(|| ConfigError::Invalid("server_command is empty".to_string()))?;
    let port: u16 = last.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!(
            "server_command must end with the listening port, found {last:?}"
        ))
    })?;
    Ok(format!("http://127.0.0.1:{port}/health"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_dir(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    dunce::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn require_command(name: &str, command: &[String]) -> Result<(), ConfigError> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::Invalid(format!("{name} must name a program"))),
    }
}

fn positive_duration(name: &str, secs: f64) -> Result<Duration, ConfigError> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))
    } else {
        Err(ConfigError::Invalid(format!("{name} must be positive, got {secs}")))
    }
}

// ─── Single trial ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrialConfig {
    pub server_command: Vec<String>,
    pub client_command: Vec<String>,
    pub paths: TrialConfigPaths,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub health_timeout_secs: Option<f64>,
    #[serde(default)]
    pub poll_interval_secs: Option<f64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<f64>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrialConfigPaths {
    pub server_log: PathBuf,
    pub client_log: PathBuf,
    pub result_json: PathBuf,
    #[serde(default)]
    pub monitor_log: Option<PathBuf>,
    #[serde(default)]
    pub nccl_log: Option<PathBuf>,
}

/// A validated single-trial configuration with every path made absolute.
#[derive(Debug, Clone)]
pub struct LoadedTrial {
    pub server_command: Vec<String>,
    pub client_command: Vec<String>,
    pub health_url: String,
    pub paths: TrialPaths,
    pub env: BTreeMap<String, String>,
    pub timeouts: Timeouts,
    pub monitor: MonitorConfig,
}

impl TrialConfig {
    pub fn load(path: &Path) -> Result<LoadedTrial, ConfigError> {
        let config: TrialConfig = read_json(path)?;
        let base = config_dir(path);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "trial".to_string());
        config.into_loaded(&base, &stem)
    }

    fn into_loaded(self, base: &Path, stem: &str) -> Result<LoadedTrial, ConfigError> {
        require_command("server_command", &self.server_command)?;
        require_command("client_command", &self.client_command)?;
        let health_url = health_url_for(&self.server_command)?;
        if self.monitor.enabled {
            require_command("monitor.command", &self.monitor.command)?;
        }
        let timeouts = Timeouts::from_secs(
            self.health_timeout_secs,
            self.poll_interval_secs,
            self.shutdown_grace_secs,
        )?;

        let server_log = resolve(base, &self.paths.server_log);
        let monitor_log = match &self.paths.monitor_log {
            Some(p) => resolve(base, p),
            None => server_log
                .parent()
                .unwrap_or(base)
                .join("monitor_logs")
                .join(format!("{stem}.csv")),
        };
        let paths = TrialPaths {
            client_log: resolve(base, &self.paths.client_log),
            result_file: resolve(base, &self.paths.result_json),
            nccl_log: self.paths.nccl_log.as_deref().map(|p| resolve(base, p)),
            monitor_log,
            server_log,
        };

        Ok(LoadedTrial {
            server_command: self.server_command,
            client_command: self.client_command,
            health_url,
            paths,
            env: self.env,
            timeouts,
            monitor: self.monitor,
        })
    }
}

// ─── Strategy matrix ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub sequence_length: Option<u32>,
    pub server_command: Vec<String>,
    pub client_command: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub health_timeout_secs: Option<f64>,
    #[serde(default)]
    pub poll_interval_secs: Option<f64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<f64>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Explicit baseline override, in milliseconds.
    #[serde(default)]
    pub baseline_latency_ms: Option<f64>,
    /// Result file of an earlier TP1_PP1 trial.
    #[serde(default)]
    pub baseline_result: Option<PathBuf>,
    pub strategies: Vec<StrategyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyEntry {
    pub tp: u32,
    pub pp: u32,
    #[serde(default)]
    pub gpus: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "monitor_enabled_default")]
    pub enabled: bool,
    #[serde(default = "monitor_command_default")]
    pub command: Vec<String>,
}

fn monitor_enabled_default() -> bool {
    true
}

fn monitor_command_default() -> Vec<String> {
    DEFAULT_MONITOR_COMMAND.iter().map(|s| s.to_string()).collect()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: monitor_enabled_default(),
            command: monitor_command_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeouts {
    pub health_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Timeouts {
    /// Optional overrides in (fractional) seconds; absent values keep the
    /// defaults.
    pub fn from_secs(
        health_timeout: Option<f64>,
        poll_interval: Option<f64>,
        shutdown_grace: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pick = |name: &str, secs: Option<f64>, default: Duration| match secs {
            Some(s) => positive_duration(name, s),
            None => Ok(default),
        };
        Ok(Self {
            health_timeout: pick("health_timeout_secs", health_timeout, defaults.health_timeout)?,
            poll_interval: pick("poll_interval_secs", poll_interval, defaults.poll_interval)?,
            shutdown_grace: pick("shutdown_grace_secs", shutdown_grace, defaults.shutdown_grace)?,
        })
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A validated matrix, ready for the runner.
#[derive(Debug, Clone)]
pub struct BenchPlan {
    pub output_dir: PathBuf,
    pub sequence_length: u32,
    pub server_command: Vec<String>,
    pub client_command: Vec<String>,
    pub port: u16,
    pub timeouts: Timeouts,
    pub monitor: MonitorConfig,
    pub env: BTreeMap<String, String>,
    pub baseline_latency_ms: Option<f64>,
    pub baseline_result: Option<PathBuf>,
    pub strategies: Vec<StrategyConfig>,
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<BenchPlan, ConfigError> {
        let config: BenchConfig = read_json(path)?;
        config.into_plan(&config_dir(path))
    }

    pub fn into_plan(self, base: &Path) -> Result<BenchPlan, ConfigError> {
        require_command("server_command", &self.server_command)?;
        require_command("client_command", &self.client_command)?;
        match self.server_command.last().map(String::as_str) {
            Some("{port}") => {}
            _ => {
                health_url_for(&self.server_command)?;
            }
        }
        if self.monitor.enabled {
            require_command("monitor.command", &self.monitor.command)?;
        }

        let sequence_length = self.sequence_length.unwrap_or(DEFAULT_SEQUENCE_LENGTH);
        let timeouts = Timeouts::from_secs(
            self.health_timeout_secs,
            self.poll_interval_secs,
            self.shutdown_grace_secs,
        )?;

        if let Some(ms) = self.baseline_latency_ms {
            if !(ms.is_finite() && ms >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "baseline_latency_ms must be a non-negative latency, got {ms}"
                )));
            }
        }

        let strategies = self
            .strategies
            .iter()
            .map(|e| {
                StrategyConfig::new(
                    e.tp,
                    e.pp,
                    e.gpus.unwrap_or(e.tp.saturating_mul(e.pp)),
                    sequence_length,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        validate_matrix(&strategies)?;

        Ok(BenchPlan {
            output_dir: resolve(base, &self.output_dir),
            sequence_length,
            server_command: self.server_command,
            client_command: self.client_command,
            port: self.port.unwrap_or(DEFAULT_PORT),
            timeouts,
            monitor: self.monitor,
            env: self.env,
            baseline_latency_ms: self.baseline_latency_ms,
            baseline_result: self.baseline_result.map(|p| resolve(base, &p)),
            strategies,
        })
    }
}

fn validate_matrix(strategies: &[StrategyConfig]) -> Result<(), ConfigError> {
    if strategies.is_empty() {
        return Err(ConfigError::Invalid("strategies must not be empty".to_string()));
    }
    let mut seen = HashSet::new();
    let mut saw_parallel = false;
    for strategy in strategies {
        if !seen.insert(strategy.label()) {
            return Err(ConfigError::Invalid(format!(
                "strategy {} is listed more than once",
                strategy.label()
            )));
        }
        if strategy.is_baseline() && saw_parallel {
            return Err(ConfigError::Invalid(format!(
                "baseline {} must come before every multi-GPU strategy",
                strategy.label()
            )));
        }
        saw_parallel |= !strategy.is_baseline();
    }
    Ok(())
}

impl BenchPlan {
    /// Keep only the strategies whose labels were requested, in matrix order.
    pub fn select(&mut self, labels: &[String]) -> Result<(), ConfigError> {
        if labels.is_empty() {
            return Ok(());
        }
        for label in labels {
            if !self.strategies.iter().any(|s| s.label().eq_ignore_ascii_case(label)) {
                return Err(ConfigError::Invalid(format!(
                    "unknown strategy {label}; configured: {}",
                    self.strategies
                        .iter()
                        .map(StrategyConfig::label)
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        self.strategies
            .retain(|s| labels.iter().any(|l| s.label().eq_ignore_ascii_case(l)));
        Ok(())
    }

    pub fn trial_paths(&self, strategy: &StrategyConfig) -> TrialPaths {
        TrialPaths::for_strategy(&self.output_dir, strategy)
    }

    /// Where a TP1_PP1 trial at this sequence length persists its result.
    pub fn baseline_result_path(&self) -> PathBuf {
        match &self.baseline_result {
            Some(path) => path.clone(),
            None => {
                let baseline = StrategyConfig {
                    tensor_parallel_degree: 1,
                    pipeline_parallel_degree: 1,
                    gpu_count: 1,
                    sequence_length: self.sequence_length,
                };
                self.trial_paths(&baseline).result_file
            }
        }
    }

    pub fn server_command_for(&self, strategy: &StrategyConfig) -> Vec<String> {
        expand(&self.server_command, strategy, self.port)
    }

    pub fn client_command_for(&self, strategy: &StrategyConfig) -> Vec<String> {
        expand(&self.client_command, strategy, self.port)
    }
}

pub fn expand(template: &[String], strategy: &StrategyConfig, port: u16) -> Vec<String> {
    let label = strategy.label();
    template
        .iter()
        .map(|arg| {
            arg.replace("{tp}", &strategy.tensor_parallel_degree.to_string())
                .replace("{pp}", &strategy.pipeline_parallel_degree.to_string())
                .replace("{gpus}", &strategy.gpu_count.to_string())
                .replace("{seq_len}", &strategy.sequence_length.to_string())
                .replace("{label}", &label)
                .replace("{port}", &port.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_json(strategies: &str) -> String {
        format!(
            r#"{{
                "output_dir": "out",
                "server_command": ["serve", "--tp", "{{tp}}", "--pp", "{{pp}}", "--port", "{{port}}"],
                "client_command": ["client", "--seq", "{{seq_len}}", "--tag", "{{label}}"],
                "port": 8123,
                "poll_interval_secs": 0.5,
                "strategies": {strategies}
            }}"#
        )
    }

    fn plan(strategies: &str) -> Result<BenchPlan, ConfigError> {
        let config: BenchConfig = serde_json::from_str(&matrix_json(strategies)).expect("json");
        config.into_plan(Path::new("/srv/bench"))
    }

    #[test]
    fn health_url_uses_last_argument() {
        let cmd = vec!["serve".to_string(), "--port".to_string(), "8000".to_string()];
        assert_eq!(health_url_for(&cmd).unwrap(), "http://127.0.0.1:8000/health");
    }

    #[test]
    fn health_url_rejects_non_port_tail() {
        let cmd = vec!["serve".to_string(), "--verbose".to_string()];
        let err = health_url_for(&cmd).expect_err("must reject");
        assert!(err.to_string().contains("listening port"), "{err}");
    }

    #[test]
    fn plan_derives_gpus_and_resolves_paths() {
        let plan = plan(r#"[{"tp": 1, "pp": 1}, {"tp": 2, "pp": 2}]"#).expect("plan");
        assert_eq!(plan.output_dir, Path::new("/srv/bench/out"));
        assert_eq!(plan.sequence_length, DEFAULT_SEQUENCE_LENGTH);
        assert_eq!(plan.strategies[1].gpu_count, 4);
        assert_eq!(plan.timeouts.poll_interval, Duration::from_millis(500));
        assert_eq!(plan.timeouts.health_timeout, DEFAULT_HEALTH_TIMEOUT);
        assert_eq!(
            plan.baseline_result_path(),
            Path::new("/srv/bench/out/results/result_TP1_PP1_SL128.json")
        );
    }

    #[test]
    fn templates_expand_per_strategy() {
        let plan = plan(r#"[{"tp": 1, "pp": 1}, {"tp": 2, "pp": 1}]"#).expect("plan");
        let strategy = plan.strategies[1];
        assert_eq!(
            plan.server_command_for(&strategy),
            ["serve", "--tp", "2", "--pp", "1", "--port", "8123"]
        );
        assert_eq!(
            plan.client_command_for(&strategy),
            ["client", "--seq", "128", "--tag", "TP2_PP1"]
        );
    }

    #[test]
    fn rejects_inconsistent_gpu_count() {
        let err = plan(r#"[{"tp": 2, "pp": 2, "gpus": 2}]"#).expect_err("must reject");
        assert!(err.to_string().contains("needs 4 GPUs"), "{err}");
    }

    #[test]
    fn rejects_baseline_after_parallel_strategy() {
        let err = plan(r#"[{"tp": 2, "pp": 1}, {"tp": 1, "pp": 1}]"#).expect_err("must reject");
        assert!(err.to_string().contains("must come before"), "{err}");
    }

    #[test]
    fn rejects_duplicates_and_empty_matrix() {
        assert!(plan(r#"[{"tp": 2, "pp": 1}, {"tp": 2, "pp": 1}]"#).is_err());
        assert!(plan("[]").is_err());
    }

    #[test]
    fn baseline_override_accepts_zero_but_not_negative() {
        let mut config: BenchConfig =
            serde_json::from_str(&matrix_json(r#"[{"tp": 2, "pp": 1}]"#)).expect("json");
        config.baseline_latency_ms = Some(0.0);
        let plan = config.into_plan(Path::new("/srv/bench")).expect("zero is a valid baseline");
        assert_eq!(plan.baseline_latency_ms, Some(0.0));

        let mut config: BenchConfig =
            serde_json::from_str(&matrix_json(r#"[{"tp": 2, "pp": 1}]"#)).expect("json");
        config.baseline_latency_ms = Some(-5.0);
        let err = config.into_plan(Path::new("/srv/bench")).expect_err("must reject");
        assert!(err.to_string().contains("non-negative"), "{err}");
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = matrix_json(r#"[{"tp": 1, "pp": 1, "dp": 2}]"#);
        assert!(serde_json::from_str::<BenchConfig>(&json).is_err());
    }

    #[test]
    fn select_keeps_matrix_order() {
        let mut plan =
            plan(r#"[{"tp": 1, "pp": 1}, {"tp": 2, "pp": 1}, {"tp": 1, "pp": 2}]"#).expect("plan");
        plan.select(&["tp1_pp2".to_string(), "TP1_PP1".to_string()])
            .expect("select");
        let labels: Vec<_> = plan.strategies.iter().map(StrategyConfig::label).collect();
        assert_eq!(labels, ["TP1_PP1", "TP1_PP2"]);
        assert!(plan.select(&["TP8_PP1".to_string()]).is_err());
    }

    #[test]
    fn trial_config_resolves_relative_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config_path = tmp.path().join("tp2.json");
        fs::write(
            &config_path,
            r#"{
                "server_command": ["serve", "9001"],
                "client_command": ["client"],
                "paths": {
                    "server_log": "logs/server.log",
                    "client_log": "logs/client.log",
                    "result_json": "results/out.json"
                }
            }"#,
        )
        .expect("write config");

        let trial = TrialConfig::load(&config_path).expect("load");
        let base = dunce::canonicalize(tmp.path()).expect("canonicalize");
        assert_eq!(trial.health_url, "http://127.0.0.1:9001/health");
        assert_eq!(trial.paths.result_file, base.join("results/out.json"));
        assert_eq!(trial.paths.monitor_log, base.join("logs/monitor_logs/tp2.csv"));
        assert_eq!(trial.paths.nccl_log, None);
        assert_eq!(trial.timeouts, Timeouts::default());
        assert!(trial.monitor.enabled);
    }

    #[test]
    fn timeouts_reject_non_positive_values() {
        let err = Timeouts::from_secs(Some(0.0), None, None).expect_err("must reject");
        assert!(err.to_string().contains("health_timeout_secs"), "{err}");
        let t = Timeouts::from_secs(None, Some(0.25), Some(2.0)).expect("valid");
        assert_eq!(t.poll_interval, Duration::from_millis(250));
        assert_eq!(t.shutdown_grace, Duration::from_secs(2));
        assert_eq!(t.health_timeout, DEFAULT_HEALTH_TIMEOUT);
    }

    #[test]
    fn trial_config_requires_paths_block() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config_path = tmp.path().join("bad.json");
        fs::write(
            &config_path,
            r#"{"server_command": ["serve", "9001"], "client_command": ["client"]}"#,
        )
        .expect("write config");
        let err = TrialConfig::load(&config_path).expect_err("must reject");
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }
}
