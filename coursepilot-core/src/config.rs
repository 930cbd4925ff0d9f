use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Top-level automation configuration, loaded from `automation.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AutomationConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub quiz: QuizSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub window: [u32; 2],
    /// Base directory for per-user browser profiles. Defaults to the
    /// system temp dir when absent.
    pub profile_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub mute_audio: bool,
    pub autoplay_policy: String,
    pub lang: Option<String>,
    pub user_agent: Option<String>,
}

/// Polling and backoff constants for the playback driver. All fields
/// default to the values the driver was tuned with; a config file only
/// needs to name the ones it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub ready_poll_seconds: u64,
    pub ready_timeout_seconds: u64,
    pub tick_seconds: u64,
    pub ad_check_seconds: u64,
    pub pause_check_seconds: u64,
    pub next_click_wait_seconds: u64,
    pub autoplay_wait_seconds: u64,
    pub toggle_wait_seconds: u64,
    pub advance_settle_seconds: u64,
    pub element_wait_seconds: u64,
    pub error_backoff_seconds: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            ready_poll_seconds: 1,
            ready_timeout_seconds: 10,
            tick_seconds: 2,
            ad_check_seconds: 5,
            pause_check_seconds: 2,
            next_click_wait_seconds: 3,
            autoplay_wait_seconds: 30,
            toggle_wait_seconds: 5,
            advance_settle_seconds: 5,
            element_wait_seconds: 15,
            error_backoff_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuizSection {
    pub enabled: bool,
    pub confidence_threshold: f64,
}

impl Default for QuizSection {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.7,
        }
    }
}

/// Playback rate restricted to the values the platforms' players
/// actually expose. Validated at construction; arbitrary floats are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum PlaybackSpeed {
    X0_5,
    X0_75,
    X1,
    X1_25,
    X1_5,
    X1_75,
    X2,
}

impl PlaybackSpeed {
    pub const ALL: [PlaybackSpeed; 7] = [
        PlaybackSpeed::X0_5,
        PlaybackSpeed::X0_75,
        PlaybackSpeed::X1,
        PlaybackSpeed::X1_25,
        PlaybackSpeed::X1_5,
        PlaybackSpeed::X1_75,
        PlaybackSpeed::X2,
    ];

    pub fn as_f64(self) -> f64 {
        match self {
            PlaybackSpeed::X0_5 => 0.5,
            PlaybackSpeed::X0_75 => 0.75,
            PlaybackSpeed::X1 => 1.0,
            PlaybackSpeed::X1_25 => 1.25,
            PlaybackSpeed::X1_5 => 1.5,
            PlaybackSpeed::X1_75 => 1.75,
            PlaybackSpeed::X2 => 2.0,
        }
    }

    pub fn try_from_f64(value: f64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|speed| (speed.as_f64() - value).abs() < f64::EPSILON)
            .ok_or_else(|| ConfigError::Invalid(format!("unsupported playback speed: {value}")))
    }
}

impl Default for PlaybackSpeed {
    fn default() -> Self {
        PlaybackSpeed::X1
    }
}

impl TryFrom<f64> for PlaybackSpeed {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self> {
        Self::try_from_f64(value)
    }
}

impl From<PlaybackSpeed> for f64 {
    fn from(speed: PlaybackSpeed) -> f64 {
        speed.as_f64()
    }
}

impl FromStr for PlaybackSpeed {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let value: f64 = s
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("not a playback speed: {s}")))?;
        Self::try_from_f64(value)
    }
}

impl fmt::Display for PlaybackSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.as_f64())
    }
}

pub fn load_automation_config<P: AsRef<Path>>(path: P) -> Result<AutomationConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/automation.toml");
        let config = load_automation_config(path).expect("fixture config should parse");
        assert!(config.chromium.headless);
        assert_eq!(config.flags.autoplay_policy, "no-user-gesture-required");
        assert_eq!(config.timing.autoplay_wait_seconds, 30);
        assert_eq!(config.timing.error_backoff_seconds, 5);
    }

    #[test]
    fn every_supported_speed_round_trips() {
        for value in [0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0] {
            let speed = PlaybackSpeed::try_from_f64(value).unwrap();
            assert_eq!(speed.as_f64(), value);
        }
    }

    #[test]
    fn arbitrary_speeds_are_rejected()  {
        for value in [0.0, 1.1, 2.5, 3.0, -1.0, f64::NAN] {
            assert!(PlaybackSpeed::try_from_f64(value).is_err());
        }
    }

    #[test]
    fn speed_parses_from_cli_strings() {
        assert_eq!(
            "1.5".parse::<PlaybackSpeed>().unwrap(),
            PlaybackSpeed::X1_5
        );
        assert!("fast".parse::<PlaybackSpeed>().is_err());
    }
}
