#[cfg(not(feature = "real"))]
pub mod emulated;
#[cfg(feature = "real")]
pub mod physical;

use std::{thread, time::Duration};

use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{config::GpioConfig, phone::EngineEvent};

#[cfg(not(feature = "real"))]
pub use emulated::Hardware;
#[cfg(feature = "real")]
pub use physical::Hardware;

/// The three logical switch lines of the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    /// High while the dial is rotated away from rest.
    DialStatus,
    /// Toggles once per detent while the dial returns.
    Pulse,
    /// High while the handset is lifted.
    Plunger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// A level change observed on a line, before any debouncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEdge {
    pub line: Line,
    pub level: Level,
    pub timestamp: Instant,
}

impl RawEdge {
    pub fn new(line: Line, level: Level, timestamp: Instant) -> Self {
        Self {
            line,
            level,
            timestamp,
        }
    }
}

pub trait PhoneHardware {
    fn create(config: &GpioConfig) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Samples the lines and returns every level change since the previous call, oldest first.
    fn update(&mut self) -> Vec<RawEdge>;
}

/// Polls `hardware` once per millisecond on its own thread, forwarding edges to the engine.
pub fn spawn_poller<H>(
    mut hardware: H,
    events: UnboundedSender<EngineEvent>,
    shutdown: CancellationToken,
) -> thread::JoinHandle<()>
where
    H: PhoneHardware + Send + 'static,
{
    thread::spawn(move || {
        while !shutdown.is_cancelled() {
            for edge in hardware.update() {
                if events.send(EngineEvent::Edge(edge)).is_err() {
                    debug!("engine gone, stopping hardware poller");
                    return;
                }
            }

            thread::sleep(Duration::from_millis(1));
        }
    })
}
