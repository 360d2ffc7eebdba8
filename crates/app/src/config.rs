//! Layered configuration: defaults, then an optional TOML file, then
//! `STREAMBOARD_*` environment overrides, matching the source's settings
//! layering without dragging in any of its domain-specific sections.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Sine,
    Noise,
    Wav,
    Microphone,
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Sine
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputSettings {
    pub source: InputSource,
    pub sample_rate: f64,
    pub chunk_size: usize,
    pub tone_frequency: f64,
    pub amplitude: f64,
    pub wav_path: Option<String>,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            source: InputSource::default(),
            sample_rate: 16_000.0,
            chunk_size: 1_600,
            tone_frequency: 440.0,
            amplitude: 0.5,
            wav_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Target overlap-add processing latency, in seconds.
    pub target_latency_seconds: f64,
    /// FIR length of the single band-pass demonstration filter.
    pub filter_len: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            target_latency_seconds: 0.02,
            filter_len: 63,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: String,
    pub file_stem: String,
    pub max_file_bytes: u64,
    pub network_listen_addr: Option<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: "data".to_string(),
            file_stem: "stream".to_string(),
            max_file_bytes: 64 * 1024 * 1024,
            network_listen_addr: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub input: InputSettings,
    pub filter: FilterSettings,
    pub output: OutputSettings,
    pub log_retention_days: Option<u64>,
}

impl Settings {
    /// Loads defaults, then `streamboard.toml` in the working directory if
    /// present, then `STREAMBOARD__SECTION__FIELD` environment overrides.
    /// Falls back to pure defaults if loading fails for any reason, the
    /// way a misconfigured environment shouldn't prevent startup outright.
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("streamboard").required(false))
            .add_source(config::Environment::with_prefix("STREAMBOARD").separator("__"));
        let settings = builder.build()?;
        settings.try_deserialize()
    }

    /// Clamp/validate values that would otherwise make the board
    /// unrunnable, warning rather than failing outright for anything
    /// recoverable.
    pub fn validate(&mut self) -> Result<(), String> {
        if self.input.sample_rate <= 0.0 {
            return Err("input.sample_rate must be positive".to_string());
        }
        if self.input.chunk_size == 0 {
            return Err("input.chunk_size must be nonzero".to_string());
        }
        if self.filter.filter_len == 0 {
            return Err("filter.filter_len must be nonzero".to_string());
        }
        if self.filter.target_latency_seconds <= 0.0 {
            tracing::warn!(
                "filter.target_latency_seconds <= 0, clamping to 0.01"
            );
            self.filter.target_latency_seconds = 0.01;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.input.sample_rate, 16_000.0);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut settings = Settings::default();
        settings.input.chunk_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn nonpositive_latency_is_clamped_not_rejected() {
        let mut settings = Settings::default();
        settings.filter.target_latency_seconds = -1.0;
        assert!(settings.validate().is_ok());
        assert!(settings.filter.target_latency_seconds > 0.0);
    }
}
