use std::time::Duration;
use thiserror::Error;
use crate::constants::api::{MAX_RESPONSE_BYTES, SPEECH_URL};
use crate::voice::Voice;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no API key configured")]
    MissingApiKey,
    #[error("API key was rejected")]
    InvalidApiKey,
    #[error("speech API returned HTTP {0}")]
    Status(u16),
    #[error("speech API request timed out")]
    Timeout,
    #[error("speech API returned an empty response")]
    EmptyResponse,
    #[error("speech API request failed: {0}")]
    Transport(String),
}

/// Something that turns text into encoded audio bytes
///
/// Implementations are shared across worker threads.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, voice: Voice) -> Result<Vec<u8>, SynthesisError>;

    /// File extension of the audio returned by `synthesize`
    fn file_extension(&self) -> &str {
        "mp3"
    }
}

/// Speech synthesis through the OpenAI `/v1/audio/speech` endpoint
pub struct OpenAiSynthesizer {
    agent: ureq::Agent,
    api_key: Option<String>,
    model: String,
}

impl OpenAiSynthesizer {
    pub fn new(api_key: Option<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        OpenAiSynthesizer {
            agent,
            api_key,
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            settings.resolved_api_key(),
            settings.model.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }
}

impl Synthesizer for OpenAiSynthesizer {
    fn synthesize(&self, text: &str, voice: Voice) -> Result<Vec<u8>, SynthesisError> {
        let api_key = self.api_key.as_deref().ok_or(SynthesisError::MissingApiKey)?;

        let payload = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice.as_str(),
            "response_format": "mp3",
        });

        let mut response = self.agent
            .post(SPEECH_URL)
            .header("Authorization", &format!("Bearer {}", api_key))
            .send_json(&payload)
            .map_err(map_ureq_error)?;

        let bytes = response
            .body_mut()
            .with_config()
            .limit(MAX_RESPONSE_BYTES)
            .read_to_vec()
            .map_err(map_ureq_error)?;

        if bytes.is_empty() {
            return Err(SynthesisError::EmptyResponse);
        }

        tracing::debug!("received {} bytes of {} audio", bytes.len(), self.file_extension());

        Ok(bytes)
    }
}

fn map_ureq_error(err: ureq::Error) -> SynthesisError {
    match err {
        ureq::Error::StatusCode(401) | ureq::Error::StatusCode(403) => SynthesisError::InvalidApiKey,
        ureq::Error::StatusCode(code) => SynthesisError::Status(code),
        ureq::Error::Timeout(_) => SynthesisError::Timeout,
        other => SynthesisError::Transport(other.to_string()),
    }
}
