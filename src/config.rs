use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use serde::Deserialize;

use crate::dial::Digit;

pub const PLUNGER_PIN: u8 = 26;

pub const DIAL_STATUS_PIN: u8 = 5;
pub const DIAL_PULSE_PIN: u8 = 6;

#[derive(Parser, Debug)]
#[command(version, about = "Rotary telephone audio guestbook")]
pub struct Cli {
    #[clap(long, env = "GUESTBOOK_CONF", default_value = "guestbook.toml")]
    pub conf: String,
}

/// Which call flow runs after the handset is lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallFlow {
    /// Greeting (when configured) followed by a recording.
    #[default]
    Guestbook,
    /// Dial `1` to activate, then one digit selecting a canned sound.
    DialActivated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flow: CallFlow,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub gpio: GpioConfig,
    pub debounce: DebounceConfig,
    pub audio: AudioConfig,
    /// Digit to sound file, keys are `"0"` through `"9"`.
    pub sounds: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub plunger_pin: u8,
    pub plunger_active_low: bool,
    pub dial_status_pin: u8,
    pub dial_status_active_low: bool,
    pub pulse_pin: u8,
    pub pulse_active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub dial_status_ms: u64,
    pub pulse_ms: u64,
    pub plunger_ms: u64,
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub recording_limit_secs: u64,
    pub recording_format: String,
    pub recordings_dir: PathBuf,
    pub greeting: Option<PathBuf>,
    pub player: String,
    pub recorder: String,
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow: CallFlow::default(),
            log_level: Some("info".to_string()),
            log_file: None,
            gpio: GpioConfig::default(),
            debounce: DebounceConfig::default(),
            audio: AudioConfig::default(),
            sounds: HashMap::new(),
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            plunger_pin: PLUNGER_PIN,
            plunger_active_low: false,
            dial_status_pin: DIAL_STATUS_PIN,
            dial_status_active_low: false,
            pulse_pin: DIAL_PULSE_PIN,
            pulse_active_low: false,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            dial_status_ms: 10,
            pulse_ms: 30,
            plunger_ms: 200,
            settle_ms: 200,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            recording_limit_secs: 30,
            recording_format: "cd".to_string(),
            recordings_dir: PathBuf::from("recordings"),
            greeting: None,
            player: "aplay".to_string(),
            recorder: "arecord".to_string(),
            stop_grace_ms: 2000,
        }
    }
}

impl DebounceConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl AudioConfig {
    pub fn recording_limit(&self) -> Duration {
        Duration::from_secs(self.recording_limit_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.sound_map()?;
        Ok(config)
    }

    /// The `[sounds]` table keyed by digit. Keys that are not a single digit are rejected.
    pub fn sound_map(&self) -> Result<HashMap<Digit, PathBuf>> {
        let mut sounds = HashMap::with_capacity(self.sounds.len());

        for (key, path) in &self.sounds {
            let Some(digit) = key.parse::<u8>().ok().and_then(Digit::new).filter(|_| key.len() == 1)
            else {
                bail!("sound key {:?} is not a single digit", key);
            };

            sounds.insert(digit, path.clone());
        }

        Ok(sounds)
    }
}
