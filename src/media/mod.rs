pub mod process;

#[cfg(test)]
pub mod fake;

use std::{
    collections::HashMap,
    fmt,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::SessionId;
use crate::config::AudioConfig;
use crate::dial::Digit;
use crate::phone::EngineEvent;

use self::process::{AudioLauncher, AudioProcess};

pub const MANIFEST_FILE: &str = "recordings.jsonl";

/// Wall-clock source for recording names and manifest timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Greeting,
    Recording,
    Sound,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Greeting => write!(f, "greeting"),
            OperationKind::Recording => write!(f, "recording"),
            OperationKind::Sound => write!(f, "sound"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("a {0} is already running")]
    Busy(OperationKind),
    #[error("{kind} resource missing: {path}")]
    MissingResource { kind: OperationKind, path: String },
    #[error("failed to start {kind}: {source}")]
    Launch {
        kind: OperationKind,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundOutcome {
    Playing,
    NoSound,
}

/// Reported back to the engine by operation tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaNotice {
    /// The greeting played to the end without being cancelled.
    GreetingFinished(SessionId),
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    session: String,
    file: &'a Path,
    started_at: String,
}

struct Operation {
    kind: OperationKind,
    session: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns every running greeting, recording and sound. At most one playback
/// (greeting or sound) and one capture run at a time.
pub struct MediaSupervisor {
    launcher: Arc<dyn AudioLauncher>,
    events: UnboundedSender<EngineEvent>,

    greeting: Option<PathBuf>,
    sounds: HashMap<Digit, PathBuf>,
    recordings_dir: PathBuf,
    recording_format: String,
    recording_limit: Duration,
    stop_grace: Duration,
    clock: Clock,

    playback: Option<Operation>,
    capture: Option<Operation>,
    recordings: Vec<PathBuf>,
}

impl MediaSupervisor {
    pub fn new(
        config: &AudioConfig,
        sounds: HashMap<Digit, PathBuf>,
        launcher: Arc<dyn AudioLauncher>,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            launcher,
            events,
            greeting: config.greeting.clone(),
            sounds,
            recordings_dir: config.recordings_dir.clone(),
            recording_format: config.recording_format.clone(),
            recording_limit: config.recording_limit(),
            stop_grace: config.stop_grace(),
            clock: Arc::new(Local::now),
            playback: None,
            capture: None,
            recordings: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    pub fn has_greeting(&self) -> bool {
        self.greeting.is_some()
    }

    /// Files recorded so far, oldest first.
    pub fn recordings(&self) -> &[PathBuf] {
        &self.recordings
    }

    pub fn is_idle(&mut self) -> bool {
        self.reap();
        self.playback.is_none() && self.capture.is_none()
    }

    pub fn begin_greeting(&mut self, session: SessionId) -> Result<(), MediaError> {
        let Some(greeting) = self.greeting.clone() else {
            return Err(MediaError::MissingResource {
                kind: OperationKind::Greeting,
                path: "(not configured)".to_string(),
            });
        };

        self.play(session, OperationKind::Greeting, &greeting)
    }

    pub fn select_and_play(
        &mut self,
        session: SessionId,
        digit: Digit,
    ) -> Result<SoundOutcome, MediaError> {
        let Some(sound) = self.sounds.get(&digit).cloned() else {
            return Ok(SoundOutcome::NoSound);
        };

        self.play(session, OperationKind::Sound, &sound)?;
        Ok(SoundOutcome::Playing)
    }

    pub fn begin_recording(&mut self, session: SessionId) -> Result<PathBuf, MediaError> {
        let kind = OperationKind::Recording;

        self.reap();
        if self.capture.is_some() {
            return Err(MediaError::Busy(kind));
        }

        let now = (self.clock)();
        let target = self.recording_target(now);

        let process = self
            .launcher
            .start_capture(&target, &self.recording_format, self.recording_limit)
            .map_err(|source| MediaError::Launch { kind, source })?;

        info!(%session, file = %target.display(), "recording started");

        let deadline = self.recording_limit + self.stop_grace;
        self.capture = Some(self.spawn(kind, session, process, Some(deadline)));

        if let Err(e) = self.append_manifest(session, &target, now) {
            warn!("Failed to update recording manifest: {:#}", e);
        }
        self.recordings.push(target.clone());

        Ok(target)
    }

    /// Stops everything and waits until each process has exited and its task is joined.
    pub async fn cancel_all(&mut self) {
        let operations: Vec<Operation> =
            [self.playback.take(), self.capture.take()].into_iter().flatten().collect();

        for operation in &operations {
            operation.cancel.cancel();
        }

        for operation in operations {
            if let Err(e) = operation.task.await {
                error!(session = %operation.session, "{} task failed: {}", operation.kind, e);
            }
        }
    }

    fn play(
        &mut self,
        session: SessionId,
        kind: OperationKind,
        resource: &Path,
    ) -> Result<(), MediaError> {
        self.reap();
        if self.playback.is_some() {
            return Err(MediaError::Busy(kind));
        }

        if !resource.exists() {
            return Err(MediaError::MissingResource {
                kind,
                path: resource.display().to_string(),
            });
        }

        let process = self
            .launcher
            .start_playback(resource)
            .map_err(|source| MediaError::Launch { kind, source })?;

        info!(%session, file = %resource.display(), "{} started", kind);

        self.playback = Some(self.spawn(kind, session, process, None));
        Ok(())
    }

    /// Moves an already running process into its own task. The process exists before the
    /// operation is stored, so a cancellation always has something to stop.
    fn spawn(
        &self,
        kind: OperationKind,
        session: SessionId,
        process: Box<dyn AudioProcess>,
        deadline: Option<Duration>,
    ) -> Operation {
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            kind,
            session,
            process,
            cancel.clone(),
            deadline,
            self.stop_grace,
            self.events.clone(),
        ));

        Operation {
            kind,
            session,
            cancel,
            task,
        }
    }

    /// Forgets operations whose task already ended.
    fn reap(&mut self) {
        for slot in [&mut self.playback, &mut self.capture] {
            if slot.as_ref().is_some_and(|op| op.task.is_finished()) {
                *slot = None;
            }
        }
    }

    fn recording_target(&self, now: DateTime<Local>) -> PathBuf {
        let stem = format!("REC_{}", now.format("%Y%m%d_%H%M%S"));
        let taken = |path: &PathBuf| path.exists() || self.recordings.contains(path);

        let mut target = self.recordings_dir.join(format!("{stem}.wav"));
        let mut n = 1;
        while taken(&target) {
            target = self.recordings_dir.join(format!("{stem}_{n}.wav"));
            n += 1;
        }

        target
    }

    fn append_manifest(
        &self,
        session: SessionId,
        file: &Path,
        started_at: DateTime<Local>,
    ) -> anyhow::Result<()> {
        let entry = ManifestEntry {
            session: session.to_string(),
            file,
            started_at: started_at.to_rfc3339(),
        };

        let mut manifest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.recordings_dir.join(MANIFEST_FILE))?;
        writeln!(manifest, "{}", serde_json::to_string(&entry)?)?;

        Ok(())
    }
}

async fn supervise(
    kind: OperationKind,
    session: SessionId,
    mut process: Box<dyn AudioProcess>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    grace: Duration,
    events: UnboundedSender<EngineEvent>,
) {
    let overrun = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };

    let exit = tokio::select! {
        exit = process.wait() => Some(exit),
        _ = cancel.cancelled() => None,
        _ = overrun => {
            warn!(%session, "{} ran past its limit", kind);
            None
        }
    };

    let Some(exit) = exit else {
        stop(kind, process.as_mut(), grace).await;
        debug!(%session, "{} stopped", kind);
        return;
    };

    match exit {
        Ok(exit) if exit.success() => info!(%session, "{} finished", kind),
        Ok(exit) => warn!(%session, code = ?exit.code, "{} exited abnormally", kind),
        Err(e) => warn!(%session, "Failed to wait for {}: {:#}", kind, e),
    }

    if kind == OperationKind::Greeting {
        let _ = events.send(EngineEvent::Media(MediaNotice::GreetingFinished(session)));
    }
}

/// SIGTERM, then SIGKILL after `grace`. Gives up after a second `grace` rather than hang.
async fn stop(kind: OperationKind, process: &mut dyn AudioProcess, grace: Duration) {
    if let Err(e) = process.terminate() {
        warn!("Failed to terminate {}: {:#}", kind, e);
    }

    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(_)) => return,
        Ok(Err(e)) => warn!("Failed to wait for {}: {:#}", kind, e),
        Err(_) => warn!("{} ignored termination, killing", kind),
    }

    if let Err(e) = process.kill() {
        error!("Failed to kill {}: {:#}", kind, e);
    }

    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("{} did not exit after kill: {:#}", kind, e),
        Err(_) => error!("{} did not exit after kill, abandoning it", kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{FakeEvent, FakeLauncher};
    use chrono::TimeZone;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Fixture {
        dir: TempDir,
        launcher: Arc<FakeLauncher>,
        supervisor: MediaSupervisor,
        events: UnboundedReceiver<EngineEvent>,
    }

    fn fixture(launcher: FakeLauncher) -> Fixture {
        let dir = TempDir::new().unwrap();
        let greeting = dir.path().join("greeting.wav");
        let sound = dir.path().join("seven.wav");
        std::fs::write(&greeting, b"RIFF").unwrap();
        std::fs::write(&sound, b"RIFF").unwrap();

        let config = AudioConfig {
            recordings_dir: dir.path().to_path_buf(),
            greeting: Some(greeting),
            ..AudioConfig::default()
        };
        let sounds = HashMap::from([(Digit::new(7).unwrap(), sound)]);

        let launcher = Arc::new(launcher);
        let (sender, events) = unbounded_channel();
        let supervisor = MediaSupervisor::new(&config, sounds, launcher.clone(), sender);

        Fixture {
            dir,
            launcher,
            supervisor,
            events,
        }
    }

    fn session() -> SessionId {
        SessionId::new()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_when_idle_is_noop() {
        let mut f = fixture(FakeLauncher::new());

        f.supervisor.cancel_all().await;
        f.supervisor.cancel_all().await;

        assert!(f.launcher.events().is_empty());
        assert!(f.supervisor.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_completion_is_reported() {
        let mut f = fixture(FakeLauncher::new().playback_length(Duration::from_secs(2)));
        let id = session();

        f.supervisor.begin_greeting(id).unwrap();
        assert!(matches!(
            f.supervisor.begin_greeting(id),
            Err(MediaError::Busy(OperationKind::Greeting))
        ));

        let notice = f.events.recv().await;
        assert!(matches!(
            notice,
            Some(EngineEvent::Media(MediaNotice::GreetingFinished(s))) if s == id
        ));
        assert!(f.supervisor.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_greeting_is_not_reported() {
        let mut f = fixture(FakeLauncher::new().playback_length(Duration::from_secs(10)));

        f.supervisor.begin_greeting(session()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        f.supervisor.cancel_all().await;

        assert_eq!(f.launcher.live(), 0);
        assert!(f.supervisor.is_idle());
        assert!(f.events.try_recv().is_err());
        assert!(f.launcher.events().contains(&FakeEvent::Terminate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_process_is_killed() {
        let mut f = fixture(
            FakeLauncher::new()
                .playback_length(Duration::from_secs(60))
                .ignore_terminate(),
        );

        f.supervisor.begin_greeting(session()).unwrap();
        f.supervisor.cancel_all().await;

        let events = f.launcher.events();
        assert!(events.contains(&FakeEvent::Kill));
        assert_eq!(f.launcher.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_targets_are_unique_and_logged() {
        let mut f = fixture(FakeLauncher::new());
        let id = session();

        let first = f.supervisor.begin_recording(id).unwrap();
        assert!(matches!(
            f.supervisor.begin_recording(id),
            Err(MediaError::Busy(OperationKind::Recording))
        ));
        f.supervisor.cancel_all().await;
        let second = f.supervisor.begin_recording(id).unwrap();
        f.supervisor.cancel_all().await;

        assert_ne!(first, second);
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("REC_"));
        assert_eq!(f.supervisor.recordings(), &[first.clone(), second]);

        let manifest = std::fs::read_to_string(f.dir.path().join(MANIFEST_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = manifest
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["session"], id.to_string());
        assert_eq!(lines[0]["file"], first.to_str().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_name_follows_clock() {
        let mut f = fixture(FakeLauncher::new());
        let at = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).single().unwrap();
        f.supervisor.set_clock(Arc::new(move || at));

        let first = f.supervisor.begin_recording(session()).unwrap();
        f.supervisor.cancel_all().await;
        let second = f.supervisor.begin_recording(session()).unwrap();
        f.supervisor.cancel_all().await;

        assert_eq!(first, f.dir.path().join("REC_20260314_092653.wav"));
        assert_eq!(second, f.dir.path().join("REC_20260314_092653_1.wav"));

        let manifest = std::fs::read_to_string(f.dir.path().join(MANIFEST_FILE)).unwrap();
        let entry: serde_json::Value =
            serde_json::from_str(manifest.lines().next().unwrap()).unwrap();
        assert_eq!(entry["started_at"], at.to_rfc3339());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_stops_at_limit_overrun() {
        let mut f = fixture(FakeLauncher::new().capture_ignores_limit());

        f.supervisor.begin_recording(session()).unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert!(f.supervisor.is_idle());
        assert!(f.launcher.events().contains(&FakeEvent::Terminate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sound_selection() {
        let mut f = fixture(FakeLauncher::new());
        let id = session();

        let missing = f.supervisor.select_and_play(id, Digit::new(2).unwrap());
        assert_eq!(missing.unwrap(), SoundOutcome::NoSound);

        let playing = f.supervisor.select_and_play(id, Digit::new(7).unwrap());
        assert_eq!(playing.unwrap(), SoundOutcome::Playing);
        assert!(matches!(
            f.launcher.events().first(),
            Some(FakeEvent::StartPlayback(path)) if path.ends_with("seven.wav")
        ));

        f.supervisor.cancel_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_and_failing_resources() {
        let mut f = fixture(FakeLauncher::new().fail_launch());
        let id = session();

        assert!(matches!(
            f.supervisor.begin_recording(id),
            Err(MediaError::Launch { kind: OperationKind::Recording, .. })
        ));

        std::fs::remove_file(f.dir.path().join("greeting.wav")).unwrap();
        assert!(matches!(
            f.supervisor.begin_greeting(id),
            Err(MediaError::MissingResource { kind: OperationKind::Greeting, .. })
        ));
        assert!(f.supervisor.is_idle());
    }
}
