//! In-memory stand-ins for `aplay`/`arecord`, driven by tokio's clock.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use super::process::{AudioLauncher, AudioProcess, ProcessExit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    StartPlayback(PathBuf),
    StartCapture(PathBuf),
    Terminate,
    Kill,
    Exited,
}

#[derive(Default)]
struct Shared {
    events: Vec<FakeEvent>,
    live: usize,
    max_live: usize,
}

#[derive(Clone)]
pub struct FakeLauncher {
    shared: Arc<Mutex<Shared>>,
    playback_length: Duration,
    capture_ignores_limit: bool,
    ignore_terminate: bool,
    fail_launch: bool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            playback_length: Duration::from_secs(2),
            capture_ignores_limit: false,
            ignore_terminate: false,
            fail_launch: false,
        }
    }

    pub fn playback_length(mut self, length: Duration) -> Self {
        self.playback_length = length;
        self
    }

    pub fn capture_ignores_limit(mut self) -> Self {
        self.capture_ignores_limit = true;
        self
    }

    pub fn ignore_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    pub fn fail_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.shared.lock().unwrap().events.clone()
    }

    /// Processes started but not yet reaped.
    pub fn live(&self) -> usize {
        self.shared.lock().unwrap().live
    }

    /// The most processes that were ever alive at once.
    pub fn max_live(&self) -> usize {
        self.shared.lock().unwrap().max_live
    }

    fn start(&self, event: FakeEvent, runs_for: Option<Duration>) -> Result<Box<dyn AudioProcess>> {
        if self.fail_launch {
            bail!("no such device");
        }

        let mut shared = self.shared.lock().unwrap();
        shared.events.push(event);
        shared.live += 1;
        shared.max_live = shared.max_live.max(shared.live);

        Ok(Box::new(FakeProcess {
            shared: self.shared.clone(),
            ends_at: runs_for.map(|length| Instant::now() + length),
            ignore_terminate: self.ignore_terminate,
            stopped: false,
            reaped: false,
        }))
    }
}

impl AudioLauncher for FakeLauncher {
    fn start_capture(
        &self,
        target: &Path,
        _format: &str,
        max_duration: Duration,
    ) -> Result<Box<dyn AudioProcess>> {
        let runs_for = (!self.capture_ignores_limit).then_some(max_duration);
        self.start(FakeEvent::StartCapture(target.to_path_buf()), runs_for)
    }

    fn start_playback(&self, resource: &Path) -> Result<Box<dyn AudioProcess>> {
        self.start(
            FakeEvent::StartPlayback(resource.to_path_buf()),
            Some(self.playback_length),
        )
    }
}

struct FakeProcess {
    shared: Arc<Mutex<Shared>>,
    /// `None` runs until stopped.
    ends_at: Option<Instant>,
    ignore_terminate: bool,
    stopped: bool,
    reaped: bool,
}

impl FakeProcess {
    fn record(&self, event: FakeEvent) {
        self.shared.lock().unwrap().events.push(event);
    }

    fn reap(&mut self, exit: ProcessExit) -> ProcessExit {
        if !self.reaped {
            self.reaped = true;
            let mut shared = self.shared.lock().unwrap();
            shared.live -= 1;
            shared.events.push(FakeEvent::Exited);
        }

        exit
    }
}

#[async_trait]
impl AudioProcess for FakeProcess {
    fn terminate(&mut self) -> Result<()> {
        self.record(FakeEvent::Terminate);
        if !self.ignore_terminate {
            self.stopped = true;
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.record(FakeEvent::Kill);
        self.stopped = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        if !self.stopped {
            match self.ends_at {
                Some(ends_at) => tokio::time::sleep_until(ends_at).await,
                None => std::future::pending().await,
            }
        }

        let code = if self.stopped { None } else { Some(0) };
        Ok(self.reap(ProcessExit { code }))
    }
}
