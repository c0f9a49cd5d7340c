use crate::config::{MusicConfig, SynthesisConfig};
use crate::error::SynthesisError;
use crate::services::audio::AudioBuffer;
use crate::services::synthesis::post_for_audio;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Background music collaborator used during book assembly.
#[async_trait]
pub trait MusicService: Send + Sync {
    /// `duration` is a hint; the assembler loops or trims whatever comes back.
    async fn generate_ambient(&self, duration: Duration, mood: &str) -> Result<AudioBuffer, SynthesisError>;
}

pub struct HttpMusicClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    sample_rate: u32,
}

impl HttpMusicClient {
    pub fn new(music: &MusicConfig, synthesis: &SynthesisConfig) -> Self {
        HttpMusicClient {
            client: reqwest::Client::new(),
            api_url: music.api_url.clone(),
            api_key: synthesis.api_key.clone(),
            sample_rate: 48_000,
        }
    }
}

#[async_trait]
impl MusicService for HttpMusicClient {
    async fn generate_ambient(&self, duration: Duration, mood: &str) -> Result<AudioBuffer, SynthesisError> {
        // Long books only need a bed that loops cleanly.
        let hint = duration.as_secs().clamp(10, 300);
        let body = json!({
            "mood": mood,
            "duration_secs": hint,
        });
        tracing::debug!(mood, hint, "requesting background music");
        post_for_audio(&self.client, &self.api_url, self.api_key.as_deref(), &body, self.sample_rate).await
    }
}
