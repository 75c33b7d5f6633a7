//! Configuration management for the Vesper voice daemon

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Vesper daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream credential (from `VESPER_API_KEY` env)
    pub credential: String,

    /// Voice profile name requested from the upstream model
    pub voice: String,

    /// Path to data directory (transcripts, recordings)
    pub data_dir: PathBuf,

    /// Audio pipeline configuration
    pub audio: AudioConfig,

    /// Connection retry configuration
    pub retry: RetryPolicy,

    /// Liveness watchdog configuration
    pub watchdog: WatchdogConfig,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Microphone sample rate in Hz
    pub input_sample_rate: u32,

    /// Playback sample rate in Hz
    pub output_sample_rate: u32,

    /// Samples per frame
    pub chunk_size: usize,

    /// Seconds of audio each frame queue buffers before dropping
    pub queue_seconds: f64,

    /// How long capture stays muted after the assistant finishes a turn,
    /// so trailing speaker bleed is not re-captured
    pub post_turn_cooldown_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            chunk_size: 512,
            queue_seconds: 2.0,
            post_turn_cooldown_ms: 800,
        }
    }
}

impl AudioConfig {
    /// Cooldown applied to capture after the assistant finishes speaking
    #[must_use]
    pub const fn post_turn_cooldown(&self) -> Duration {
        Duration::from_millis(self.post_turn_cooldown_ms)
    }
}

/// Connection retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in seconds
    pub base_delay_secs: u64,

    /// Multiplier applied per attempt (2 gives 2s, 4s, 8s)
    pub multiplier: u32,

    /// Attempts before the connection is declared failed
    pub max_attempts: u32,

    /// Mandatory quiet period after any close, before reconnecting, so the
    /// upstream service observes the previous session as released
    pub cooldown_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 2,
            multiplier: 2,
            max_attempts: 3,
            cooldown_secs: 2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs(self.base_delay_secs.saturating_mul(u64::from(factor)))
    }

    /// Post-close cooldown
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Liveness watchdog configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds between liveness checks
    pub tick_secs: u64,

    /// Idle seconds before a stalled exchange is declared dead
    pub timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_secs: 1,
            timeout_secs: 25,
        }
    }
}

impl WatchdogConfig {
    /// Interval between checks
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Idle threshold
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Optional on-disk overrides, loaded from `vesper.toml` in the data dir
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileOverrides {
    voice: Option<String>,
    audio: Option<AudioConfig>,
    retry: Option<RetryPolicy>,
    watchdog: Option<WatchdogConfig>,
}

/// Return the data directory, creating it if needed
///
/// Uses `~/.local/share/vesper/` on Linux
pub fn data_dir() -> PathBuf {
    let dir = directories::ProjectDirs::from("dev", "vesper", "vesper")
        .map_or_else(|| PathBuf::from(".vesper"), |d| d.data_dir().to_path_buf());

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "failed to create data directory"
        );
    }

    dir
}

impl Config {
    /// Load configuration from environment variables, with optional
    /// `vesper.toml` overrides from the data directory
    ///
    /// # Errors
    ///
    /// Returns an error if `VESPER_API_KEY` is unset or the config file is
    /// malformed
    pub fn load() -> Result<Self> {
        let credential = std::env::var("VESPER_API_KEY")
            .map_err(|_| Error::Config("VESPER_API_KEY not set".to_string()))?;
        if credential.trim().is_empty() {
            return Err(Error::Config("VESPER_API_KEY is empty".to_string()));
        }

        let data_dir = std::env::var("VESPER_DATA_DIR").map_or_else(|_| data_dir(), PathBuf::from);

        let overrides = Self::load_file_overrides(&data_dir)?;

        let voice = std::env::var("VESPER_VOICE")
            .ok()
            .or(overrides.voice)
            .unwrap_or_else(|| "Aoede".to_string());

        Ok(Self {
            credential,
            voice,
            data_dir,
            audio: overrides.audio.unwrap_or_default(),
            retry: overrides.retry.unwrap_or_default(),
            watchdog: overrides.watchdog.unwrap_or_default(),
        })
    }

    fn load_file_overrides(data_dir: &std::path::Path) -> Result<FileOverrides> {
        let path = data_dir.join("vesper.toml");
        if !path.exists() {
            return Ok(FileOverrides::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let overrides = toml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "loaded config overrides");
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn defaults_match_expected_timings() {
        let watchdog = WatchdogConfig::default();
        assert_eq!(watchdog.tick(), Duration::from_secs(1));
        assert_eq!(watchdog.timeout(), Duration::from_secs(25));

        let audio = AudioConfig::default();
        assert_eq!(audio.post_turn_cooldown(), Duration::from_millis(800));
    }

    #[test]
    fn file_overrides_parse_partial_tables() {
        let overrides: FileOverrides = toml::from_str(
            r#"
            voice = "Puck"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(overrides.voice.as_deref(), Some("Puck"));
        let retry = overrides.retry.unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay_secs, 2);
    }
}
