use anyhow::Context;
use debouncr::{debounce_4, Debouncer, Edge, Repeat4};
use rppal::gpio::{Gpio, InputPin};
use tokio::time::Instant;

use crate::config::GpioConfig;
use crate::hardware::{Level, Line, PhoneHardware, RawEdge};

/// One GPIO input with a sample-level glitch filter in front of it.
struct SensedLine {
    line: Line,
    pin: InputPin,
    active_low: bool,
    debounce: Debouncer<u8, Repeat4>,
}

impl SensedLine {
    fn new(gpio: &Gpio, line: Line, pin: u8, active_low: bool) -> anyhow::Result<Self> {
        let pin = gpio
            .get(pin)
            .with_context(|| format!("Failed to get pin {pin} for {line:?}"))?
            .into_input();

        Ok(Self {
            line,
            pin,
            active_low,
            debounce: debounce_4(false),
        })
    }

    fn sample(&mut self, now: Instant) -> Option<RawEdge> {
        let active = self.pin.is_high() != self.active_low;

        let level = match self.debounce.update(active)? {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        };

        Some(RawEdge::new(self.line, level, now))
    }
}

pub struct Hardware {
    _gpio: Gpio,

    plunger: SensedLine,
    dial_status: SensedLine,
    dial_pulse: SensedLine,
}

impl PhoneHardware for Hardware {
    fn create(config: &GpioConfig) -> anyhow::Result<Self> {
        let gpio = Gpio::new().context("Failed to initialize GPIO")?;

        let plunger = SensedLine::new(
            &gpio,
            Line::Plunger,
            config.plunger_pin,
            config.plunger_active_low,
        )?;
        let dial_status = SensedLine::new(
            &gpio,
            Line::DialStatus,
            config.dial_status_pin,
            config.dial_status_active_low,
        )?;
        let dial_pulse = SensedLine::new(
            &gpio,
            Line::Pulse,
            config.pulse_pin,
            config.pulse_active_low,
        )?;

        Ok(Hardware {
            _gpio: gpio,
            plunger,
            dial_status,
            dial_pulse,
        })
    }

    fn update(&mut self) -> Vec<RawEdge> {
        let now = Instant::now();

        [
            &mut self.plunger,
            &mut self.dial_status,
            &mut self.dial_pulse,
        ]
        .into_iter()
        .filter_map(|line| line.sample(now))
        .collect()
    }
}
