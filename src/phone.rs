use std::sync::Arc;

use anyhow::Result;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::call::{CallEvent, CallStateMachine, SessionId};
use crate::config::{CallFlow, Config};
use crate::debounce::Debouncer;
use crate::dial::{DialDecoder, Digit};
use crate::hardware::{Level, Line, RawEdge};
use crate::media::{
    process::AudioLauncher, MediaError, MediaNotice, MediaSupervisor, SoundOutcome,
};

/// Everything the engine reacts to, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Edge(RawEdge),
    Media(MediaNotice),
}

/// The single writer for all call state: edges and media notices are handled one at a time.
pub struct PhoneEngine {
    flow: CallFlow,
    debouncer: Debouncer,
    dial: DialDecoder,
    calls: CallStateMachine,
    media: MediaSupervisor,
    events: UnboundedReceiver<EngineEvent>,
}

impl PhoneEngine {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn AudioLauncher>,
    ) -> Result<(PhoneEngine, UnboundedSender<EngineEvent>)> {
        let (sender, events) = unbounded_channel();

        let sounds = config.sound_map()?;
        let media = MediaSupervisor::new(&config.audio, sounds, launcher, sender.clone());

        let engine = PhoneEngine {
            flow: config.flow,
            debouncer: Debouncer::new(&config.debounce),
            dial: DialDecoder::new(config.debounce.settle_delay()),
            calls: CallStateMachine::new(config.flow),
            media,
            events,
        };

        Ok((engine, sender))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(flow = ?self.flow, "phone ready");

        loop {
            let settle = self.dial.settle_deadline();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = sleep_until(settle.unwrap_or_else(Instant::now)), if settle.is_some() => {
                    self.settle(Instant::now()).await;
                }
            }
        }

        info!("shutting down, stopping audio");
        self.media.cancel_all().await;
        info!(recordings = self.media.recordings().len(), "phone stopped");
    }

    pub async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Edge(edge) => self.handle_edge(edge).await,
            EngineEvent::Media(MediaNotice::GreetingFinished(session)) => {
                self.greeting_finished(session)
            }
        }
    }

    async fn handle_edge(&mut self, raw: RawEdge) {
        let Some(edge) = self.debouncer.observe(raw) else {
            trace!(line = ?raw.line, level = ?raw.level, "bounce");
            return;
        };

        debug!(line = ?edge.line, level = ?edge.level, "edge");

        let call_event = match (edge.line, edge.level) {
            (Line::Plunger, Level::High) => self.calls.handset_lifted(),
            (Line::Plunger, Level::Low) => self.calls.handset_down(),
            (Line::DialStatus | Line::Pulse, _) => match self.dial.observe(&edge) {
                Some(digit) => self.calls.digit(digit),
                None => None,
            },
        };

        if let Some(call_event) = call_event {
            self.dispatch(call_event).await;
        }
    }

    async fn settle(&mut self, now: Instant) {
        if let Some(digit) = self.dial.finalize(now) {
            self.digit(digit).await;
        }
    }

    async fn digit(&mut self, digit: Digit) {
        if let Some(call_event) = self.calls.digit(digit) {
            self.dispatch(call_event).await;
        }
    }

    async fn dispatch(&mut self, event: CallEvent) {
        match event {
            CallEvent::BeginCall(session) => self.begin_call(session),
            CallEvent::Activated(session) => debug!(%session, "waiting for a sound digit"),
            CallEvent::SelectSound(session, digit) => {
                match self.media.select_and_play(session, digit) {
                    Ok(SoundOutcome::Playing) => {}
                    Ok(SoundOutcome::NoSound) => info!(%session, %digit, "no sound for this digit"),
                    Err(e) => report(session, e),
                }
            }
            CallEvent::EndCall(session) => {
                self.dial.reset();
                self.media.cancel_all().await;
                debug_assert!(self.media.is_idle());
                debug!(%session, "call ended, audio stopped");
            }
        }
    }

    fn begin_call(&mut self, session: SessionId) {
        if self.flow == CallFlow::DialActivated {
            debug!(%session, "waiting for activation digit");
            return;
        }

        if !self.media.has_greeting() {
            self.record(session);
            return;
        }

        match self.media.begin_greeting(session) {
            Ok(()) => {}
            Err(e @ MediaError::MissingResource { .. }) => {
                warn!(%session, "{}, recording without greeting", e);
                self.record(session);
            }
            Err(e) => report(session, e),
        }
    }

    fn greeting_finished(&mut self, session: SessionId) {
        if !self.calls.is_live(session) {
            debug!(%session, "greeting finished after hang up, not recording");
            return;
        }

        self.record(session);
    }

    fn record(&mut self, session: SessionId) {
        if let Err(e) = self.media.begin_recording(session) {
            report(session, e);
        }
    }
}

fn report(session: SessionId, e: MediaError) {
    match e {
        MediaError::Launch { .. } => error!(%session, "{:#}", anyhow::Error::from(e)),
        e => warn!(%session, "{}", e),
    }
}
