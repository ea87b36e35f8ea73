use std::{fmt, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::debounce::StableEdge;
use crate::hardware::{Level, Line};

/// Ten pulses is the most a rotary dial can send; it means `0`.
const MAX_PULSES: u32 = 10;

/// A dialed digit, `0` through `9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digit(u8);

impl Digit {
    pub fn new(value: u8) -> Option<Digit> {
        (value < 10).then_some(Digit(value))
    }

    /// `count % 10`, so ten pulses dial `0`. Zero pulses dial nothing.
    pub fn from_pulses(count: u32) -> Option<Digit> {
        match count {
            0 => None,
            _ => Some(Digit((count % 10) as u8)),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Digit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One rotation-and-release of the dial.
#[derive(Debug)]
struct DialSession {
    start_time: Instant,
    pulse_count: u32,
    /// Set once the dial is back at rest; trailing pulses up to this instant still count.
    settle_deadline: Option<Instant>,
}

impl DialSession {
    fn finish(self) -> Option<Digit> {
        let digit = Digit::from_pulses(self.pulse_count);

        if self.pulse_count > MAX_PULSES {
            warn!(pulses = self.pulse_count, "more pulses than a dial can send");
        }

        match digit {
            Some(digit) => debug!(
                pulses = self.pulse_count,
                elapsed_ms = self.start_time.elapsed().as_millis() as u64,
                "dialed {}",
                digit
            ),
            None => debug!("rotation without pulses"),
        }

        digit
    }
}

/// Counts pulses between the dial leaving and returning to rest.
pub struct DialDecoder {
    settle_delay: Duration,
    session: Option<DialSession>,
}

impl DialDecoder {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            session: None,
        }
    }

    /// Feeds one debounced edge. Returns a digit only when a settling rotation is cut short
    /// by the next one; otherwise digits come out of [`DialDecoder::finalize`].
    pub fn observe(&mut self, edge: &StableEdge) -> Option<Digit> {
        match (edge.line, edge.level) {
            (Line::DialStatus, Level::High) => self.rotation_started(edge.timestamp),
            (Line::DialStatus, Level::Low) => {
                self.rotation_stopped(edge.timestamp);
                None
            }
            (Line::Pulse, Level::High) => {
                self.pulse(edge.timestamp);
                None
            }
            _ => None,
        }
    }

    /// When the current rotation should be turned into a digit.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.session.as_ref()?.settle_deadline
    }

    /// Finishes a settling rotation once its deadline has passed.
    pub fn finalize(&mut self, now: Instant) -> Option<Digit> {
        let deadline = self.settle_deadline()?;
        if now < deadline {
            return None;
        }

        self.session.take()?.finish()
    }

    /// Drops any rotation in progress, e.g. when the handset goes down mid-dial.
    pub fn reset(&mut self) {
        self.session = None;
    }

    fn rotation_started(&mut self, at: Instant) -> Option<Digit> {
        let previous = self.session.replace(DialSession {
            start_time: at,
            pulse_count: 0,
            settle_deadline: None,
        });

        match previous {
            Some(session) if session.settle_deadline.is_some() => session.finish(),
            Some(session) => {
                warn!(
                    pulses = session.pulse_count,
                    "dial started twice without stopping, discarding stale rotation"
                );
                None
            }
            None => None,
        }
    }

    fn rotation_stopped(&mut self, at: Instant) {
        match &mut self.session {
            Some(session) if session.settle_deadline.is_none() => {
                session.settle_deadline = Some(at + self.settle_delay);
            }
            _ => debug!("dial stop without a rotation, ignoring"),
        }
    }

    fn pulse(&mut self, at: Instant) {
        let Some(session) = &mut self.session else {
            debug!("pulse with the dial at rest, ignoring");
            return;
        };

        match session.settle_deadline {
            Some(deadline) if at > deadline => debug!("pulse after settle delay, ignoring"),
            _ => session.pulse_count += 1,
        }
    }
}
