//! Pipeline configuration.
//!
//! A single immutable [`PipelineConfig`] is built once (TOML file, then
//! environment overrides, then command-line overrides) and passed by
//! reference into the planner, orchestrator and assembler.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOKEN_BUDGET: usize = 30_000;
pub const DEFAULT_SAFE_LIMIT: usize = 1_800;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub synthesis: SynthesisConfig,
    pub planner: PlannerConfig,
    pub generation: GenerationConfig,
    pub quality: QualityConfig,
    pub assembly: AssemblyConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub style_prompt: Option<String>,
    /// Sample rate of raw PCM returned by the service.
    pub sample_rate: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/v1/audio/speech".to_string(),
            api_key: None,
            model: "gemini-2.5-flash-preview-tts".to_string(),
            voice: "Charon".to_string(),
            style_prompt: None,
            sample_rate: 24_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub token_budget: usize,
    pub safe_mode: bool,
    pub safe_limit: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            safe_mode: false,
            safe_limit: DEFAULT_SAFE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub concurrency: usize,
    /// Total synthesis attempts per chunk, quality rejections included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 4,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            request_timeout_secs: 300,
        }
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .checked_mul(1u64 << shift)
            .map(|d| d.min(self.max_delay_ms))
            .unwrap_or(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Thresholds of the statistical quality gate. These are calibration
/// defaults, not hard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Frame level (dBFS) below which a frame counts as silent.
    pub silence_threshold_db: f64,
    pub max_silence_ratio: f64,
    /// Longest acceptable silent tail, in seconds.
    pub max_trailing_silence_secs: f64,
    pub clipping_level: f64,
    pub max_clipping_ratio: f64,
    pub min_amplitude_variance: f64,
    pub max_amplitude_variance: f64,
    pub min_duration_secs: f64,
    /// Speaking rate for spaced scripts.
    pub words_per_minute: f64,
    /// Speaking rate for CJK text, counted per character.
    pub cjk_chars_per_minute: f64,
    /// Allowed relative deviation from the text-derived expected length.
    pub duration_tolerance: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold_db: -40.0,
            max_silence_ratio: 0.5,
            max_trailing_silence_secs: 3.0,
            clipping_level: 0.95,
            max_clipping_ratio: 0.01,
            min_amplitude_variance: 1e-5,
            max_amplitude_variance: 0.25,
            min_duration_secs: 1.0,
            words_per_minute: 150.0,
            cjk_chars_per_minute: 250.0,
            duration_tolerance: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub chunk_pause_ms: u64,
    pub chapter_pause_ms: u64,
    pub purge_chunks: bool,
    pub combine_book: bool,
    pub music: MusicConfig,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            chunk_pause_ms: 500,
            chapter_pause_ms: 2_000,
            purge_chunks: true,
            combine_book: true,
            music: MusicConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicConfig {
    pub enabled: bool,
    pub api_url: String,
    pub mood: String,
    pub volume: f32,
    pub fade_secs: f32,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "http://localhost:8000/v1/music/ambient".to_string(),
            mood: "ambient".to_string(),
            volume: 0.15,
            fade_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub chapters_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to `<output_dir>/.audiobook_state.json` when unset.
    pub checkpoint: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            chapters_dir: PathBuf::from("chapters"),
            output_dir: PathBuf::from("output"),
            checkpoint: None,
        }
    }
}

impl PathsConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".audiobook_state.json"))
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.output_dir.join("chunks")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("TTS_API_KEY") {
            self.synthesis.api_key = Some(key);
        }
        if let Some(url) = lookup("TTS_API_URL") {
            self.synthesis.api_url = url;
        }
        if let Some(model) = lookup("TTS_MODEL") {
            self.synthesis.model = model;
        }
        if let Some(voice) = lookup("NARRATOR_VOICE") {
            self.synthesis.voice = voice;
        }
        if let Some(limit) = lookup("CHUNK_LIMIT") {
            self.planner.token_budget = parse_env("CHUNK_LIMIT", &limit)?;
        }
        if let Some(safe) = lookup("SAFE_CHUNK_MODE") {
            self.planner.safe_mode = safe.eq_ignore_ascii_case("true") || safe == "1";
        }
        if let Some(concurrency) = lookup("MAX_CONCURRENCY") {
            self.generation.concurrency = parse_env("MAX_CONCURRENCY", &concurrency)?;
        }
        if let Some(url) = lookup("BACKGROUND_MUSIC_URL") {
            self.assembly.music.api_url = url;
        }
        if let Some(volume) = lookup("BACKGROUND_MUSIC_VOLUME") {
            self.assembly.music.volume = parse_env("BACKGROUND_MUSIC_VOLUME", &volume)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.planner.token_budget == 0 {
            return Err(invalid("planner.token_budget", "must be greater than zero"));
        }
        if self.planner.safe_limit == 0 {
            return Err(invalid("planner.safe_limit", "must be greater than zero"));
        }
        if self.generation.concurrency == 0 {
            return Err(invalid("generation.concurrency", "must be at least 1"));
        }
        if self.generation.max_attempts == 0 {
            return Err(invalid("generation.max_attempts", "must be at least 1"));
        }
        if self.generation.initial_delay_ms > self.generation.max_delay_ms {
            return Err(invalid(
                "generation.initial_delay_ms",
                "cannot be greater than generation.max_delay_ms",
            ));
        }
        if self.synthesis.sample_rate == 0 {
            return Err(invalid("synthesis.sample_rate", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.assembly.music.volume) {
            return Err(invalid("assembly.music.volume", "must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&self.quality.max_silence_ratio) {
            return Err(invalid("quality.max_silence_ratio", "must be between 0.0 and 1.0"));
        }
        if self.quality.words_per_minute <= 0.0 {
            return Err(invalid("quality.words_per_minute", "must be positive"));
        }
        if self.quality.cjk_chars_per_minute <= 0.0 {
            return Err(invalid("quality.cjk_chars_per_minute", "must be positive"));
        }
        Ok(())
    }

    /// Budget actually used by the planner.
    pub fn effective_budget(&self) -> usize {
        if self.planner.safe_mode {
            self.planner.token_budget.min(self.planner.safe_limit)
        } else {
            self.planner.token_budget
        }
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let raw = r#"
            [planner]
            token_budget = 5000
            safe_mode = true

            [generation]
            concurrency = 6
        "#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.planner.token_budget, 5000);
        assert_eq!(config.generation.concurrency, 6);
        assert_eq!(config.generation.max_attempts, 4);
        assert_eq!(config.effective_budget(), DEFAULT_SAFE_LIMIT);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TTS_API_KEY", "secret"),
            ("NARRATOR_VOICE", "Puck"),
            ("SAFE_CHUNK_MODE", "TRUE"),
            ("MAX_CONCURRENCY", "3"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.synthesis.api_key.as_deref(), Some("secret"));
        assert_eq!(config.synthesis.voice, "Puck");
        assert!(config.planner.safe_mode);
        assert_eq!(config.generation.concurrency, 3);
    }

    #[test]
    fn bad_env_number_is_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(|key| (key == "CHUNK_LIMIT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let mut config = PipelineConfig::default();
        config.generation.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let generation = GenerationConfig {
            initial_delay_ms: 100,
            max_delay_ms: 350,
            ..GenerationConfig::default()
        };
        assert_eq!(generation.backoff(1), Duration::from_millis(100));
        assert_eq!(generation.backoff(2), Duration::from_millis(200));
        assert_eq!(generation.backoff(3), Duration::from_millis(350));
        assert_eq!(generation.backoff(60), Duration::from_millis(350));
    }
}
