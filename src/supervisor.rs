//! Lifecycle of one trial: start the server, wait for it to answer health
//! checks, run the client to completion, then tear everything down.
//!
//! ```text
//! StartingServer -> WaitingHealthy -> RunningClient -> Stopping -> Done
//!        \                 \                \
//!         `-----------------`----------------`------> Stopping -> Aborted
//! ```
//!
//! Stopping always runs once a trial has begun, whatever happened before it,
//! including cancellation.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Timeouts;
use crate::error::TrialError;
use crate::monitor::{MonitorHandle, ResourceMonitor};
use crate::process::{self, GroupChild};
use crate::strategy::TrialPaths;

/// Set for the client: where it must write its JSON result.
pub const RESULT_PATH_ENV: &str = "BENCH_RESULT_PATH";
/// The same path under the name vLLM benchmark clients read.
pub const VLLM_RESULT_PATH_ENV: &str = "VLLM_BENCH_RESULT_PATH";
/// Set for the client: the directory containing the result file.
pub const RESULT_DIR_ENV: &str = "RESULT_DIR";

/// Timed trials must never reach out to a model hub.
const OFFLINE_ENV: [(&str, &str); 3] = [
    ("HF_HUB_OFFLINE", "1"),
    ("TRANSFORMERS_OFFLINE", "1"),
    ("HF_DATASETS_OFFLINE", "1"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    StartingServer,
    WaitingHealthy,
    RunningClient,
    Stopping,
    Done,
    Aborted,
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialState::StartingServer => "starting_server",
            TrialState::WaitingHealthy => "waiting_healthy",
            TrialState::RunningClient => "running_client",
            TrialState::Stopping => "stopping",
            TrialState::Done => "done",
            TrialState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything needed to run one server/client pair.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    /// Used to tag log lines, usually the strategy label.
    pub name: String,
    pub server_command: Vec<String>,
    pub client_command: Vec<String>,
    pub health_url: String,
    pub paths: TrialPaths,
    /// Applied to both processes on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct TrialOutput {
    pub client_status: ExitStatus,
    pub result_file: PathBuf,
    pub elapsed: Duration,
}

pub struct Supervisor {
    monitor: Arc<dyn ResourceMonitor>,
    http: reqwest::Client,
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        monitor: Arc<dyn ResourceMonitor>,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            http: reqwest::Client::new(),
            timeouts,
            cancel,
        }
    }

    /// Run one trial to completion.
    ///
    /// A client that exits non-zero is not an error here; its status is
    /// returned for the caller to judge.
    pub async fn run_trial(&self, spec: &TrialSpec) -> Result<TrialOutput, TrialError> {
        let span = tracing::info_span!("trial", name = %spec.name);
        self.run_trial_inner(spec).instrument(span).await
    }

    async fn run_trial_inner(&self, spec: &TrialSpec) -> Result<TrialOutput, TrialError> {
        if self.cancel.is_cancelled() {
            return Err(TrialError::Cancelled);
        }
        spec.paths.prepare()?;
        remove_stale_result(&spec.paths.result_file)?;
        let started = Instant::now();

        let monitor = match self.monitor.start(&spec.paths.monitor_log).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "resource monitor unavailable; continuing without it");
                None
            }
        };

        let mut server: Option<GroupChild> = None;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!("cancellation requested");
                Err(TrialError::Cancelled)
            }
            result = self.drive(spec, &mut server) => result,
        };

        self.stop(server, monitor).await;

        match outcome {
            Ok(client_status) => {
                enter(TrialState::Done);
                Ok(TrialOutput {
                    client_status,
                    result_file: spec.paths.result_file.clone(),
                    elapsed: started.elapsed(),
                })
            }
            Err(err) => {
                enter(TrialState::Aborted);
                tracing::warn!(kind = err.kind(), error = %err, "trial aborted");
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        spec: &TrialSpec,
        server: &mut Option<GroupChild>,
    ) -> Result<ExitStatus, TrialError> {
        enter(TrialState::StartingServer);
        let log = create_log(&spec.paths.server_log)?;
        let child = process::spawn_logged(&spec.server_command, log, &server_env(spec))
            .map_err(|source| spawn_error("server", &spec.server_command, source))?;
        tracing::info!(
            pid = ?child.id(),
            command = %process::display_command(&spec.server_command),
            log = %spec.paths.server_log.display(),
            "server started"
        );
        let child = server.insert(child);

        enter(TrialState::WaitingHealthy);
        self.wait_healthy(spec, child).await?;

        enter(TrialState::RunningClient);
        let log = create_log(&spec.paths.client_log)?;
        let mut client = process::spawn_logged(&spec.client_command, log, &client_env(spec))
            .map_err(|source| spawn_error("client", &spec.client_command, source))?;
        tracing::info!(
            pid = ?client.id(),
            command = %process::display_command(&spec.client_command),
            log = %spec.paths.client_log.display(),
            "client started"
        );
        let status = client.wait().await.map_err(|source| TrialError::Io {
            context: "waiting for client",
            source,
        })?;
        tracing::info!(%status, "client finished");
        Ok(status)
    }

    async fn wait_healthy(&self, spec: &TrialSpec, server: &mut GroupChild) -> Result<(), TrialError> {
        let started = Instant::now();
        let deadline = started + self.timeouts.health_timeout;
        let mut attempts = 0u32;
        loop {
            let exited = server.try_wait().map_err(|source| TrialError::Io {
                context: "polling server",
                source,
            })?;
            if let Some(status) = exited {
                return Err(TrialError::ServerExited {
                    status,
                    server_log: spec.paths.server_log.clone(),
                });
            }

            attempts += 1;
            if self.probe(&spec.health_url).await {
                tracing::info!(
                    attempts,
                    elapsed = ?started.elapsed(),
                    "server is healthy"
                );
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TrialError::HealthTimeout {
                    timeout: self.timeouts.health_timeout,
                    server_log: spec.paths.server_log.clone(),
                });
            }
            if attempts % 12 == 0 {
                tracing::info!(elapsed = ?started.elapsed(), "still waiting for server health");
            }
            tokio::time::sleep(self.timeouts.poll_interval.min(deadline - now)).await;
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(self.timeouts.poll_interval)
            .send()
            .await
        {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    tracing::debug!(status = %response.status(), "health probe not ready");
                }
                healthy
            }
            Err(e) => {
                tracing::trace!(error = %e, "health probe failed");
                false
            }
        }
    }

    async fn stop(&self, server: Option<GroupChild>, monitor: Option<Box<dyn MonitorHandle>>) {
        enter(TrialState::Stopping);
        if let Some(mut child) = server {
            match child.terminate(self.timeouts.shutdown_grace).await {
                Ok(status) => tracing::debug!(%status, "server stopped"),
                Err(e) => tracing::warn!(error = %e, "failed to stop server"),
            }
        }
        if let Some(handle) = monitor {
            handle.stop().await;
        }
    }
}

fn enter(state: TrialState) {
    tracing::debug!(%state, "trial state");
}

fn create_log(path: &Path) -> Result<File, TrialError> {
    File::create(path).map_err(|source| TrialError::Prepare {
        path: path.to_path_buf(),
        source,
    })
}

/// A result left by an earlier run must not pass for this trial's output.
fn remove_stale_result(path: &Path) -> Result<(), TrialError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale result file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TrialError::Prepare {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn spawn_error(role: &'static str, argv: &[String], source: std::io::Error) -> TrialError {
    TrialError::Spawn {
        role,
        program: argv.first().cloned().unwrap_or_default(),
        source,
    }
}

fn base_env() -> BTreeMap<String, String> {
    OFFLINE_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn server_env(spec: &TrialSpec) -> BTreeMap<String, String> {
    let mut env = base_env();
    if let Some(nccl_log) = &spec.paths.nccl_log {
        env.insert("NCCL_DEBUG".to_string(), "INFO".to_string());
        env.insert(
            "NCCL_DEBUG_FILE".to_string(),
            nccl_log.display().to_string(),
        );
    }
    env.extend(spec.env.clone());
    env
}

fn client_env(spec: &TrialSpec) -> BTreeMap<String, String> {
    let mut env = base_env();
    env.extend(spec.env.clone());
    let result_path = spec.paths.result_file.display().to_string();
    env.insert(VLLM_RESULT_PATH_ENV.to_string(), result_path.clone());
    env.insert(RESULT_PATH_ENV.to_string(), result_path);
    if let Some(dir) = spec.paths.result_file.parent() {
        env.insert(RESULT_DIR_ENV.to_string(), dir.display().to_string());
    }
    env
}
