//! Privilege drop and handoff to the wrapped entrypoint.

use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{self, Gid, Pid, Uid};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};

use super::adapters::LaunchPlan;
use crate::error::PipelineError;

/// Backend credentials the wrapped service must not inherit.
const SCRUBBED_ENV: [&str; 2] = ["VAULT_TOKEN", "VAULT_TOKEN_FILE"];

/// Account the wrapped service runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl RuntimeUser {
    /// # Errors
    /// Returns [`PipelineError::NotFound`] if the user does not exist.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = unistd::User::from_name(name)
            .with_context(|| format!("Failed to look up user {name}"))?
            .ok_or_else(|| PipelineError::NotFound {
                what: "runtime user",
                location: name.to_string(),
            })?;
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        })
    }

    /// Whether handing off needs a uid/gid switch from the current process.
    #[must_use]
    pub fn needs_switch(&self) -> bool {
        unistd::geteuid() != self.uid
    }
}

/// Decides whether a drop to `user` can happen from this process.
///
/// # Errors
/// Returns an error when a switch is needed but the process is not root.
pub fn check_can_switch(user: &RuntimeUser) -> Result<()> {
    if user.needs_switch() && !unistd::geteuid().is_root() {
        anyhow::bail!(
            "Cannot drop to user {}: the credential client is not running as root",
            user.name
        );
    }
    Ok(())
}

/// # Errors
/// Returns an error if ownership cannot be changed.
pub fn chown_to(path: &Path, user: &RuntimeUser) -> Result<()> {
    unistd::chown(path, Some(user.uid), Some(user.gid))
        .with_context(|| format!("Failed to chown {} to {}", path.display(), user.name))
}

fn split_command(command: &[String]) -> Result<(&String, &[String])> {
    command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No entrypoint given after `--`"))
}

fn build_std_command(
    command: &[String],
    plan: &LaunchPlan,
    user: Option<&RuntimeUser>,
) -> Result<std::process::Command> {
    let (program, rest) = split_command(command)?;
    let mut cmd = std::process::Command::new(program);
    cmd.args(rest).args(&plan.args);
    for key in SCRUBBED_ENV {
        cmd.env_remove(key);
    }
    cmd.envs(plan.env.iter().map(|(key, value)| (key, value)));
    if let Some(user) = user.filter(|user| user.needs_switch()) {
        cmd.gid(user.gid.as_raw()).uid(user.uid.as_raw());
        if let Some(home) = home_of(user) {
            cmd.env("HOME", home).env("USER", &user.name);
        }
    }
    Ok(cmd)
}

fn home_of(user: &RuntimeUser) -> Option<std::path::PathBuf> {
    unistd::User::from_uid(user.uid)
        .ok()
        .flatten()
        .map(|entry| entry.dir)
}

/// Replaces the current process image with the entrypoint. Only returns on
/// failure.
///
/// # Errors
/// Returns an error if the entrypoint cannot be executed.
pub fn exec_entrypoint(
    command: &[String],
    plan: &LaunchPlan,
    user: Option<&RuntimeUser>,
) -> Result<Infallible> {
    let mut cmd = build_std_command(command, plan, user)?;
    info!("Handing off to {}", command.first().map_or("", String::as_str));
    let err = cmd.exec();
    Err(err).with_context(|| {
        format!(
            "Failed to exec {}",
            command.first().map_or("", String::as_str)
        )
    })
}

/// Runs the entrypoint as a child, forwarding termination signals, and
/// returns the exit code to mirror.
///
/// # Errors
/// Returns an error if the child cannot be spawned or waited on.
pub async fn supervise_entrypoint(
    command: &[String],
    plan: &LaunchPlan,
    user: Option<&RuntimeUser>,
) -> Result<i32> {
    let std_cmd = build_std_command(command, plan, user)?;
    // Handlers go in before the child exists so no signal hits the default
    // action while it runs.
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;
    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {e}"))?;
    let mut hup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGHUP handler: {e}"))?;
    let mut quit = signal(SignalKind::quit())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGQUIT handler: {e}"))?;

    let mut child = tokio::process::Command::from(std_cmd)
        .kill_on_drop(false)
        .spawn()
        .with_context(|| {
            format!(
                "Failed to spawn {}",
                command.first().map_or("", String::as_str)
            )
        })?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .map(Pid::from_raw)
        .ok_or_else(|| anyhow::anyhow!("Spawned entrypoint has no pid"))?;
    info!(
        "Supervising {} (pid {pid})",
        command.first().map_or("", String::as_str)
    );

    loop {
        let forwarded = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for entrypoint")?;
                return Ok(exit_code_of(status));
            }
            _ = term.recv() => Signal::SIGTERM,
            _ = int.recv() => Signal::SIGINT,
            _ = hup.recv() => Signal::SIGHUP,
            _ = quit.recv() => Signal::SIGQUIT,
        };
        debug!("Forwarding {forwarded} to pid {pid}");
        if let Err(err) = kill(pid, forwarded) {
            debug!("Forwarding {forwarded} failed: {err}");
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}
