use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::config::DebounceConfig;
use crate::hardware::{Level, Line, RawEdge};

/// An edge that survived its line's bounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableEdge {
    pub line: Line,
    pub level: Level,
    pub timestamp: Instant,
}

/// Minimum-interval filter, tracked independently per line.
pub struct Debouncer {
    windows: HashMap<Line, Duration>,
    last_accepted: HashMap<Line, Instant>,
}

impl Debouncer {
    pub fn new(config: &DebounceConfig) -> Self {
        Self::with_windows([
            (Line::DialStatus, Duration::from_millis(config.dial_status_ms)),
            (Line::Pulse, Duration::from_millis(config.pulse_ms)),
            (Line::Plunger, Duration::from_millis(config.plunger_ms)),
        ])
    }

    pub fn with_windows(windows: impl IntoIterator<Item = (Line, Duration)>) -> Self {
        Self {
            windows: windows.into_iter().collect(),
            last_accepted: HashMap::new(),
        }
    }

    /// Accepts `edge` unless it lands inside the bounce window of the last accepted edge
    /// on the same line. The first edge seen on a line is always accepted.
    pub fn observe(&mut self, edge: RawEdge) -> Option<StableEdge> {
        let window = self.windows.get(&edge.line).copied().unwrap_or_default();

        if let Some(last) = self.last_accepted.get(&edge.line) {
            if edge.timestamp.saturating_duration_since(*last) < window {
                return None;
            }
        }

        self.last_accepted.insert(edge.line, edge.timestamp);

        Some(StableEdge {
            line: edge.line,
            level: edge.level,
            timestamp: edge.timestamp,
        })
    }
}
