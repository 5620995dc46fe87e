//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Default delay before Welcome auto-advances to Listening
pub const DEFAULT_WELCOME_DELAY: Duration = Duration::from_millis(3000);
/// Default delay before Speaking auto-advances to Listening
pub const DEFAULT_SPEAKING_DELAY: Duration = Duration::from_millis(3000);
/// Default time recording must persist before it counts as the user speaking
pub const DEFAULT_SPEECH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Errors from malformed configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set and {0} was not given")]
    NoHome(&'static str),

    #[error("{var} must be a whole number of milliseconds, got {value:?}")]
    InvalidMillis { var: &'static str, value: String },
}

/// Timer settings for the call driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long Welcome lasts before `finishWelcome` is dispatched
    pub welcome_delay: Duration,
    /// How long Speaking lasts before `finishSpeaking` is dispatched
    pub speaking_delay: Duration,
    /// Debounce between recording start and `userSpeaking`
    pub speech_debounce: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            welcome_delay: DEFAULT_WELCOME_DELAY,
            speaking_delay: DEFAULT_SPEAKING_DELAY,
            speech_debounce: DEFAULT_SPEECH_DEBOUNCE,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Auto-transition and debounce timers
    pub timing: Timing,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Ok(Self::from_lookup(|var| std::env::var(var).ok())?)
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let (data_dir, socket_path) = match lookup("VOICE_CALL_SOCKET") {
            Some(socket) => {
                let socket_path = PathBuf::from(socket);
                let data_dir = socket_path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_default();
                (data_dir, socket_path)
            }
            None => {
                let home = lookup("HOME").ok_or(ConfigError::NoHome("VOICE_CALL_SOCKET"))?;
                let data_dir = PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("voice-call");
                let socket_path = data_dir.join("daemon.sock");
                (data_dir, socket_path)
            }
        };

        let timing = Timing {
            welcome_delay: millis(&lookup, "VOICE_CALL_WELCOME_MS", DEFAULT_WELCOME_DELAY)?,
            speaking_delay: millis(&lookup, "VOICE_CALL_SPEAKING_MS", DEFAULT_SPEAKING_DELAY)?,
            speech_debounce: millis(&lookup, "VOICE_CALL_DEBOUNCE_MS", DEFAULT_SPEECH_DEBOUNCE)?,
        };

        Ok(Self {
            socket_path,
            data_dir,
            timing,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidMillis { var, value }),
    }
}
