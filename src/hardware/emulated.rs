//! Headless stand-in for the phone's switches, driven by commands on stdin.
//!
//! ```text
//! lift            handset off the cradle
//! hang            handset back on the cradle
//! dial 0451       rotate the dial once per digit
//! bounce on|off   add contact bounce to every pulse
//! ```

use std::{
    collections::VecDeque,
    io::BufRead,
    sync::mpsc::{self, Receiver, TryRecvError},
    thread,
    time::Duration,
};

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::GpioConfig;
use crate::hardware::{Level, Line, PhoneHardware, RawEdge};

/// Rotary dials return at ten pulses per second: 60 ms break, 40 ms make.
const PULSE_BREAK: Duration = Duration::from_millis(60);
const PULSE_MAKE: Duration = Duration::from_millis(40);

/// Time between the finger stop and the first pulse, and after the last pulse.
const DIAL_WIND: Duration = Duration::from_millis(250);

/// Pause between digits of a multi-digit `dial` command.
const INTER_DIGIT: Duration = Duration::from_millis(700);

const BOUNCE: Duration = Duration::from_millis(2);

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Lift,
    Hang,
    Dial(Vec<u8>),
    Bounce(bool),
}

impl Command {
    fn parse(input: &str) -> Option<Command> {
        let mut words = input.split_whitespace();

        match (words.next()?, words.next()) {
            ("lift", None) => Some(Command::Lift),
            ("hang", None) => Some(Command::Hang),
            ("dial", Some(number)) => number
                .chars()
                .map(|c| c.to_digit(10).map(|d| d as u8))
                .collect::<Option<Vec<u8>>>()
                .map(Command::Dial),
            ("bounce", Some("on")) => Some(Command::Bounce(true)),
            ("bounce", Some("off")) => Some(Command::Bounce(false)),
            _ => None,
        }
    }
}

/// The edges a rotary dial produces for one digit, starting at `start`.
fn dial_waveform(digit: u8, start: Instant, bounce: bool) -> Vec<RawEdge> {
    let pulses = if digit == 0 { 10 } else { digit as u32 };

    let mut edges = vec![RawEdge::new(Line::DialStatus, Level::High, start)];
    let mut at = start + DIAL_WIND;

    for _ in 0..pulses {
        edges.push(RawEdge::new(Line::Pulse, Level::High, at));
        if bounce {
            edges.push(RawEdge::new(Line::Pulse, Level::High, at + BOUNCE));
        }
        at += PULSE_BREAK;

        edges.push(RawEdge::new(Line::Pulse, Level::Low, at));
        at += PULSE_MAKE;
    }

    edges.push(RawEdge::new(Line::DialStatus, Level::Low, at + DIAL_WIND));
    edges
}

pub struct Hardware {
    command_receiver: Receiver<Command>,

    bounce: bool,
    /// Edges scheduled for the future, ordered by timestamp.
    pending: VecDeque<RawEdge>,
}

impl Hardware {
    fn with_receiver(command_receiver: Receiver<Command>) -> Self {
        Hardware {
            command_receiver,
            bounce: false,
            pending: VecDeque::new(),
        }
    }

    /// The time at which newly scheduled edges may start.
    fn schedule_start(&self, now: Instant) -> Instant {
        self.pending
            .back()
            .map(|edge| (edge.timestamp + INTER_DIGIT).max(now))
            .unwrap_or(now)
    }

    fn apply(&mut self, command: Command, now: Instant) {
        match command {
            Command::Lift | Command::Hang => {
                let level = Level::from(command == Command::Lift);
                let at = self.schedule_start(now);
                self.pending.push_back(RawEdge::new(Line::Plunger, level, at));
            }
            Command::Dial(digits) => {
                for digit in digits {
                    let start = self.schedule_start(now);
                    let edges = dial_waveform(digit, start, self.bounce);
                    self.pending.extend(edges);
                }
            }
            Command::Bounce(enabled) => {
                self.bounce = enabled;
                info!("Contact bounce {}", if enabled { "on" } else { "off" });
            }
        }
    }

    fn due(&mut self, now: Instant) -> Vec<RawEdge> {
        let mut edges = Vec::new();

        while self.pending.front().is_some_and(|edge| edge.timestamp <= now) {
            edges.extend(self.pending.pop_front());
        }

        edges
    }
}

impl PhoneHardware for Hardware {
    fn create(_config: &GpioConfig) -> anyhow::Result<Self> {
        let (command_sender, command_receiver) = mpsc::channel();

        thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };

                if line.trim().is_empty() {
                    continue;
                }

                match Command::parse(&line) {
                    Some(command) => {
                        if command_sender.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!(
                        "Unknown command {:?} (lift, hang, dial <digits>, bounce on|off)",
                        line
                    ),
                }
            }
        });

        info!("Emulated phone ready: lift, hang, dial <digits>, bounce on|off");

        Ok(Hardware::with_receiver(command_receiver))
    }

    fn update(&mut self) -> Vec<RawEdge> {
        let now = Instant::now();

        loop {
            match self.command_receiver.try_recv() {
                Ok(command) => self.apply(command, now),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        self.due(now)
    }
}
