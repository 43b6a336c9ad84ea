//! Background hardware sampling for the duration of one trial.
//!
//! Monitoring is best-effort: a sampler that cannot start, or dies halfway
//! through, is logged and otherwise ignored. It never fails the trial it is
//! watching.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::process::{self, GroupChild};

/// How long a sampler gets to exit after SIGTERM before it is killed.
pub const MONITOR_STOP_GRACE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Begin sampling into `output`. Errors are reported, not propagated, by
    /// the supervisor.
    async fn start(&self, output: &Path) -> anyhow::Result<Box<dyn MonitorHandle>>;
}

#[async_trait]
pub trait MonitorHandle: Send {
    /// Stop sampling. Consumes the handle, so a session is stopped at most
    /// once.
    async fn stop(self: Box<Self>);
}

/// Runs an external sampler (by default `nvidia-smi --loop-ms=1000`) and
/// appends its output to the trial's monitor log.
pub struct CommandMonitor {
    command: Vec<String>,
    grace: Duration,
}

impl CommandMonitor {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            grace: MONITOR_STOP_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ResourceMonitor for CommandMonitor {
    async fn start(&self, output: &Path) -> anyhow::Result<Box<dyn MonitorHandle>> {
        use anyhow::Context;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create monitor dir {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output)
            .with_context(|| format!("open monitor log {}", output.display()))?;
        let child = process::spawn_logged(&self.command, log, &BTreeMap::new()).with_context(
            || format!("start sampler `{}`", process::display_command(&self.command)),
        )?;

        tracing::debug!(
            pid = ?child.id(),
            output = %output.display(),
            "resource monitor started"
        );
        Ok(Box::new(SamplerSession {
            child,
            output: output.to_path_buf(),
            grace: self.grace,
        }))
    }
}

struct SamplerSession {
    child: GroupChild,
    output: PathBuf,
    grace: Duration,
}

#[async_trait]
impl MonitorHandle for SamplerSession {
    async fn stop(self: Box<Self>) {
        let mut session = *self;
        match session.child.try_wait() {
            Ok(Some(status)) => tracing::warn!(
                %status,
                output = %session.output.display(),
                "resource monitor exited before the trial finished"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cannot poll resource monitor"),
        }

        match session.child.terminate(session.grace).await {
            Ok(_) => tracing::debug!(output = %session.output.display(), "resource monitor stopped"),
            Err(e) => tracing::warn!(error = %e, "failed to stop resource monitor"),
        }
    }
}

/// Used when monitoring is switched off in the configuration.
pub struct DisabledMonitor;

struct NoopHandle;

#[async_trait]
impl ResourceMonitor for DisabledMonitor {
    async fn start(&self, _output: &Path) -> anyhow::Result<Box<dyn MonitorHandle>> {
        Ok(Box::new(NoopHandle))
    }
}

#[async_trait]
impl MonitorHandle for NoopHandle {
    async fn stop(self: Box<Self>) {}
}
