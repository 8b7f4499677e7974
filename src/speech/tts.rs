//! Remote text-to-speech

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{SpeechSpeed, SpeechSynthesizer, Synthesis};
use crate::{Error, Result};

/// TTS provider backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// `OpenAI` speech endpoint
    OpenAI,
    /// ElevenLabs text-to-speech
    ElevenLabs,
    /// Companion speech service that may answer with a fallback indicator
    Service {
        /// Endpoint URL
        url: String,
    },
}

/// Structured body returned instead of audio
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackBody {
    #[serde(default)]
    fallback: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Synthesizes speech over HTTP
pub struct RemoteSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: TtsProvider,
}

impl RemoteSynthesizer {
    /// Create a synthesizer using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(api_key, model, TtsProvider::OpenAI)
    }

    /// Create a synthesizer using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(api_key, model, TtsProvider::ElevenLabs)
    }

    /// Create a synthesizer for a companion speech service
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_service(api_key: SecretString, url: String) -> Result<Self> {
        Self::new(api_key, String::new(), TtsProvider::Service { url })
    }

    fn new(api_key: SecretString, model: String, provider: TtsProvider) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} TTS")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
        })
    }

    /// Synthesize using `OpenAI` TTS
    async fn synthesize_openai(&self, text: &str, voice: &str, speed: SpeechSpeed) -> Result<Synthesis> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: speed.rate(),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        read_audio(response, "OpenAI").await
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &str, speed: SpeechSpeed) -> Result<Synthesis> {
        #[derive(serde::Serialize)]
        struct VoiceSettings {
            speed: f32,
        }

        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: VoiceSettings,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{voice}");

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings { speed: speed.rate() },
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        read_audio(response, "ElevenLabs").await
    }

    /// Synthesize using the companion speech service
    async fn synthesize_service(
        &self,
        url: &str,
        text: &str,
        voice: &str,
        speed: SpeechSpeed,
    ) -> Result<Synthesis> {
        #[derive(serde::Serialize)]
        struct ServiceRequest<'a> {
            text: &'a str,
            voice: &'a str,
            speed: &'a str,
        }

        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&ServiceRequest {
                text,
                voice,
                speed: speed.as_str(),
            })
            .send()
            .await?;

        read_audio(response, "speech service").await
    }
}

#[async_trait]
impl SpeechSynthesizer for RemoteSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str, speed: SpeechSpeed) -> Result<Synthesis> {
        match &self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, voice, speed).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice, speed).await,
            TtsProvider::Service { url } => self.synthesize_service(url, text, voice, speed).await,
        }
    }
}

/// Turn a TTS response into audio, a fallback indicator, or an error
async fn read_audio(response: reqwest::Response, provider: &str) -> Result<Synthesis> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Tts(describe_failure(provider, status, &body)));
    }

    if is_json {
        let body: FallbackBody = response.json().await?;
        let reason = body
            .error
            .or(body.message)
            .unwrap_or_else(|| "no audio returned".to_string());
        if !body.fallback {
            tracing::debug!(provider, reason = %reason, "TTS returned JSON without audio");
        }
        return Ok(Synthesis::UseFallback(reason));
    }

    let audio = response.bytes().await?;
    if audio.is_empty() {
        return Ok(Synthesis::UseFallback("empty audio".to_string()));
    }

    Ok(Synthesis::Audio(audio.to_vec()))
}

/// Human-readable failure for logs
fn describe_failure(provider: &str, status: StatusCode, body: &str) -> String {
    match status {
        StatusCode::TOO_MANY_REQUESTS => format!("{provider} TTS rate limited"),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("{provider} TTS rejected credentials")
        }
        _ => format!("{provider} TTS error {status}: {body}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let result = RemoteSynthesizer::new_openai(SecretString::from(String::new()), "tts-1".to_string());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn failures_are_classified() {
        assert_eq!(
            describe_failure("OpenAI", StatusCode::TOO_MANY_REQUESTS, ""),
            "OpenAI TTS rate limited"
        );
        assert_eq!(
            describe_failure("OpenAI", StatusCode::UNAUTHORIZED, ""),
            "OpenAI TTS rejected credentials"
        );
        assert!(describe_failure("OpenAI", StatusCode::BAD_GATEWAY, "upstream").contains("upstream"));
    }

    #[test]
    fn fallback_body_parses() {
        let body: FallbackBody =
            serde_json::from_str(r#"{"fallback":true,"error":"RATE_LIMIT_EXCEEDED"}"#).unwrap();
        assert!(body.fallback);
        assert_eq!(body.error.as_deref(), Some("RATE_LIMIT_EXCEEDED"));
    }
}
