use crate::config::SynthesisConfig;
use crate::error::SynthesisError;
use crate::services::audio::AudioBuffer;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_STYLE_PROMPT: &str =
    "Narrate this audiobook chapter in a professional, engaging style";

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub voice_id: String,
    pub model: String,
    pub style_prompt: Option<String>,
}

impl VoiceSettings {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            voice_id: config.voice.clone(),
            model: config.model.clone(),
            style_prompt: config.style_prompt.clone(),
        }
    }

    /// Text actually sent to the service: the style prompt followed by the chunk.
    pub fn narration_prompt(&self, text: &str) -> String {
        let style = self
            .style_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_STYLE_PROMPT);
        format!("{}: {}", style, text)
    }
}

/// Remote text-to-speech collaborator.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<AudioBuffer, SynthesisError>;
}

pub struct HttpSynthesisClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    sample_rate: u32,
}

impl HttpSynthesisClient {
    pub fn new(config: &SynthesisConfig) -> Self {
        HttpSynthesisClient {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
impl SynthesisService for HttpSynthesisClient {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<AudioBuffer, SynthesisError> {
        let body = json!({
            "model": voice.model,
            "voice": voice.voice_id,
            "input": voice.narration_prompt(text),
            "response_format": "wav",
        });
        post_for_audio(&self.client, &self.api_url, self.api_key.as_deref(), &body, self.sample_rate).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioPayload {
    audio_content: String,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
}

/// POST `body` and decode the audio in the response. Shared by the speech and
/// music clients.
pub(crate) async fn post_for_audio(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    sample_rate: u32,
) -> Result<AudioBuffer, SynthesisError> {
    let mut request_builder = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body);

    if let Some(key) = api_key {
        request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
    }

    let response = request_builder.send().await.map_err(classify_transport)?;
    let status = response.status();

    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let detail = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), retry_after, detail));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let bytes = response.bytes().await.map_err(classify_transport)?;

    decode_body(&content_type, &bytes, sample_rate)
}

fn classify_transport(err: reqwest::Error) -> SynthesisError {
    if err.is_builder() {
        SynthesisError::Invalid(err.to_string())
    } else {
        SynthesisError::Transient(err.to_string())
    }
}

pub(crate) fn classify_status(status: u16, retry_after: Option<Duration>, detail: String) -> SynthesisError {
    match status {
        429 => SynthesisError::RateLimited { retry_after },
        500..=599 | 408 => SynthesisError::Transient(format!("HTTP {}: {}", status, detail)),
        _ => SynthesisError::Invalid(format!("HTTP {}: {}", status, detail)),
    }
}

pub(crate) fn decode_body(content_type: &str, bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer, SynthesisError> {
    if content_type.starts_with("audio/") || bytes.starts_with(b"RIFF") {
        return AudioBuffer::from_wav_bytes(bytes)
            .map_err(|e| SynthesisError::Invalid(format!("undecodable audio: {}", e)));
    }

    let payload: AudioPayload = serde_json::from_slice(bytes)
        .map_err(|e| SynthesisError::Invalid(format!("unexpected response body: {}", e)))?;
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(payload.audio_content.as_bytes())
        .map_err(|e| SynthesisError::Invalid(format!("bad audioContent: {}", e)))?;

    Ok(AudioBuffer::from_pcm16(
        &pcm,
        payload.sample_rate.unwrap_or(sample_rate),
        payload.channels.unwrap_or(1),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_prompt_prefixes_text() {
        let mut voice = VoiceSettings {
            voice_id: "Charon".into(),
            model: "m".into(),
            style_prompt: None,
        };
        assert_eq!(
            voice.narration_prompt("Hello."),
            format!("{}: Hello.", DEFAULT_STYLE_PROMPT)
        );
        voice.style_prompt = Some("  Whisper  ".into());
        assert_eq!(voice.narration_prompt("Hello."), "Whisper: Hello.");
    }

    #[test]
    fn status_codes_are_classified() {
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(7)), String::new()),
            SynthesisError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
        ));
        assert!(classify_status(503, None, String::new()).is_transient());
        assert!(classify_status(500, None, String::new()).is_transient());
        assert!(!classify_status(401, None, String::new()).is_transient());
        assert!(!classify_status(400, None, String::new()).is_transient());
    }

    #[test]
    fn json_body_decodes_base64_pcm() {
        let pcm = [0x00u8, 0x40, 0x00, 0xC0];
        let encoded = base64::engine::general_purpose::STANDARD.encode(pcm);
        let body = format!(r#"{{"audioContent":"{}"}}"#, encoded);
        let audio = decode_body("application/json", body.as_bytes(), 24_000).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples, vec![0.5, -0.5]);
    }

    #[test]
    fn garbage_body_is_invalid() {
        let err = decode_body("text/plain", b"nope", 24_000).unwrap_err();
        assert!(!err.is_transient());
    }
}
