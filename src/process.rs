//! Child process plumbing shared by the supervisor and the resource monitor.
//!
//! Every child is started in its own process group with stdout and stderr
//! sent to a log file. Termination signals the whole group so helpers forked
//! by a server (tokenizer pools, per-rank workers) go down with it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

pub fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}

/// A child leading its own process group.
///
/// The group id is kept from spawn time: tokio forgets the pid once the
/// leader is reaped, but its helpers may still be running.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    pgid: Option<u32>,
}

impl GroupChild {
    pub fn id(&self) -> Option<u32> {
        self.pgid
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the group to exit, escalating to a kill once `grace` runs out.
    ///
    /// Returns the leader's exit status. A leader that already exited is
    /// only reaped. Whatever is left of the group is killed either way.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        let pid = self.pgid;
        if let Some(status) = self.child.try_wait()? {
            sweep_group(pid);
            return Ok(status);
        }

        request_exit(&mut self.child, pid);
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(pid = ?pid, grace = ?grace, "process ignored SIGTERM; killing");
                force_kill(pid);
                self.child.kill().await?;
                self.child.wait().await?
            }
        };
        sweep_group(pid);
        Ok(status)
    }
}

pub fn spawn_logged(
    argv: &[String],
    log: File,
    env: &BTreeMap<String, String>,
) -> io::Result<GroupChild> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
    let stderr = log.try_clone()?;

    let mut std_cmd = std::process::Command::new(program);
    std_cmd
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    let child = cmd.spawn()?;
    let pgid = child.id();
    Ok(GroupChild { child, pgid })
}

#[cfg(unix)]
fn request_exit(_child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: Option<u32>) {}

/// Kill whatever is left in the group after its leader exited.
#[cfg(unix)]
fn sweep_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let group = -(pid as libc::pid_t);
        let alive = unsafe { libc::kill(group, 0) } == 0;
        if alive {
            tracing::debug!(pgid = pid, "killing leftover process group members");
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }
}

#[cfg(not(unix))]
fn sweep_group(_pid: Option<u32>) {}
