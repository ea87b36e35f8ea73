use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::AudioConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running audio child process.
#[async_trait]
pub trait AudioProcess: Send {
    /// Asks the process to finish up and exit.
    fn terminate(&mut self) -> Result<()>;

    /// Stops the process without giving it a chance to clean up.
    fn kill(&mut self) -> Result<()>;

    async fn wait(&mut self) -> Result<ProcessExit>;
}

/// Starts capture and playback processes. The returned handle is the only way to stop them.
pub trait AudioLauncher: Send + Sync {
    fn start_capture(
        &self,
        target: &Path,
        format: &str,
        max_duration: Duration,
    ) -> Result<Box<dyn AudioProcess>>;

    fn start_playback(&self, resource: &Path) -> Result<Box<dyn AudioProcess>>;
}

/// Runs `arecord`/`aplay` (or whatever the configuration names) as child processes.
pub struct CommandLauncher {
    player: String,
    recorder: String,
}

impl CommandLauncher {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            player: config.player.clone(),
            recorder: config.recorder.clone(),
        }
    }

    fn spawn(mut command: Command) -> Result<Box<dyn AudioProcess>> {
        let child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch {:?}", command.as_std().get_program()))?;

        Ok(Box::new(ChildProcess { child }))
    }
}

impl AudioLauncher for CommandLauncher {
    fn start_capture(
        &self,
        target: &Path,
        format: &str,
        max_duration: Duration,
    ) -> Result<Box<dyn AudioProcess>> {
        let mut command = Command::new(&self.recorder);
        command
            .arg("-f")
            .arg(format)
            .arg("-d")
            .arg(max_duration.as_secs().max(1).to_string())
            .arg(PathBuf::from(target));

        Self::spawn(command)
    }

    fn start_playback(&self, resource: &Path) -> Result<Box<dyn AudioProcess>> {
        let mut command = Command::new(&self.player);
        command.arg(resource);

        Self::spawn(command)
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl AudioProcess for ChildProcess {
    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        // Already reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        // SAFETY: `pid` belongs to a child we have not yet reaped, so it cannot have been reused.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to send SIGTERM");
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        self.child.start_kill().context("Failed to kill process")
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        let status = self.child.wait().await?;

        Ok(ProcessExit {
            code: status.code(),
        })
    }
}
