//! Configuration management for Lookout
//!
//! Every value resolves as env > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::analysis::{AnalysisSession, Enricher, HttpAnalysisBackend, SearchEnricher};
use crate::capture::{CommandSource, FrameSource, SnapshotSource};
use crate::controller::ControllerConfig;
use crate::speech::{RemoteSynthesizer, SpeechSpeed, SpeechSynthesizer, SynthesisBackend, VoiceSettings};
use crate::{Error, Result};

/// Default TTS model for `OpenAI`
const DEFAULT_OPENAI_TTS_MODEL: &str = "tts-1";

/// Default TTS model for ElevenLabs
const DEFAULT_ELEVENLABS_TTS_MODEL: &str = "eleven_turbo_v2_5";

/// Lookout configuration
#[derive(Debug)]
pub struct Config {
    /// Analysis service
    pub analysis: AnalysisConfig,

    /// Speech output
    pub speech: SpeechConfig,

    /// Camera source
    pub camera: CameraConfig,

    /// Supplementary lookups
    pub enrichment: Option<EnrichmentConfig>,

    /// Mode cadence, thresholds and retention
    pub controller: ControllerConfig,
}

/// Analysis service configuration
#[derive(Debug)]
pub struct AnalysisConfig {
    /// Endpoint URL
    pub url: Option<String>,

    /// Bearer token
    pub api_key: Option<SecretString>,

    /// Model identifier forwarded to the service
    pub model: Option<String>,

    /// Request incremental responses
    pub stream: bool,
}

/// Which remote speech provider to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechProvider {
    /// `OpenAI` speech endpoint
    OpenAI,
    /// ElevenLabs
    ElevenLabs,
    /// Companion speech service
    Service {
        /// Endpoint URL
        url: String,
    },
    /// No remote provider; always speak on device
    Device,
}

/// Speech output configuration
#[derive(Debug)]
pub struct SpeechConfig {
    /// Remote provider
    pub provider: SpeechProvider,

    /// Provider API key
    pub api_key: Option<SecretString>,

    /// TTS model
    pub model: String,

    /// Initial voice settings
    pub voice: VoiceSettings,
}

/// Camera source configuration
#[derive(Debug, Clone, Default)]
pub struct CameraConfig {
    /// Command that writes one encoded frame to stdout
    pub command: Option<String>,

    /// Image file kept fresh by an external grabber
    pub snapshot_path: Option<PathBuf>,
}

/// Search provider for enrichment
#[derive(Debug)]
pub enum EnrichmentConfig {
    /// Brave Search
    Brave(SecretString),
    /// Serper
    Serper(SecretString),
}

/// Copy a secret without exposing it beyond this call
fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// Read a non-empty environment variable
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or a value
    /// is invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path)?;
        Self::from_sources(fc, env_var)
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn from_sources(fc: file::LookoutConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secret = |name: &str, fallback: Option<String>| {
            env(name).or(fallback).filter(|v| !v.is_empty()).map(SecretString::from)
        };

        // Analysis service (env > toml > default)
        let analysis = AnalysisConfig {
            url: env("LOOKOUT_ANALYSIS_URL").or(fc.analysis.url),
            api_key: secret("LOOKOUT_ANALYSIS_KEY", fc.api_keys.analysis),
            model: env("LOOKOUT_ANALYSIS_MODEL").or(fc.analysis.model),
            stream: fc.analysis.stream.unwrap_or(true),
        };

        // Speech (env > toml > default)
        let provider_name = env("LOOKOUT_TTS_PROVIDER")
            .or(fc.speech.provider)
            .unwrap_or_else(|| "openai".to_string());
        let service_url = env("LOOKOUT_TTS_URL").or(fc.speech.service_url);
        let provider = parse_provider(&provider_name, service_url)?;

        let api_key = match &provider {
            SpeechProvider::OpenAI => secret("OPENAI_API_KEY", fc.api_keys.openai),
            SpeechProvider::ElevenLabs => secret("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
            SpeechProvider::Service { .. } => secret("LOOKOUT_TTS_KEY", fc.api_keys.speech_service),
            SpeechProvider::Device => None,
        };

        let model = env("LOOKOUT_TTS_MODEL")
            .or(fc.speech.model)
            .unwrap_or_else(|| match provider {
                SpeechProvider::ElevenLabs => DEFAULT_ELEVENLABS_TTS_MODEL.to_string(),
                _ => DEFAULT_OPENAI_TTS_MODEL.to_string(),
            });

        let speed = match env("LOOKOUT_TTS_SPEED").or(fc.speech.speed) {
            Some(s) => SpeechSpeed::parse(&s)
                .ok_or_else(|| Error::Config(format!("unknown speech speed: {s}")))?,
            None => SpeechSpeed::Normal,
        };

        let voice = VoiceSettings {
            backend: if provider == SpeechProvider::Device || api_key.is_none() {
                SynthesisBackend::Device
            } else {
                SynthesisBackend::Remote
            },
            voice: env("LOOKOUT_TTS_VOICE")
                .or(fc.speech.voice)
                .unwrap_or_else(|| VoiceSettings::default().voice),
            speed,
        };

        if voice.backend == SynthesisBackend::Device && provider != SpeechProvider::Device {
            tracing::info!(provider = %provider_name, "no TTS key configured, using device speech");
        }

        let speech = SpeechConfig {
            provider,
            api_key,
            model,
            voice,
        };

        // Camera (env > toml)
        let camera = CameraConfig {
            command: env("LOOKOUT_CAMERA_COMMAND").or(fc.camera.command),
            snapshot_path: env("LOOKOUT_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .or(fc.camera.snapshot_path),
        };

        // Enrichment (env > toml > on when a search key exists)
        let enrichment_enabled = env("LOOKOUT_ENRICHMENT")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .or(fc.enrichment.enabled)
            .unwrap_or(true);
        let enrichment = if enrichment_enabled {
            secret("BRAVE_API_KEY", fc.api_keys.brave)
                .map(EnrichmentConfig::Brave)
                .or_else(|| secret("SERPER_API_KEY", fc.api_keys.serper).map(EnrichmentConfig::Serper))
        } else {
            None
        };

        let controller = fc.timing.apply(ControllerConfig::default());

        Ok(Self {
            analysis,
            speech,
            camera,
            enrichment,
            controller,
        })
    }

    /// Build the analysis session
    ///
    /// # Errors
    ///
    /// Returns error if no analysis URL is configured
    pub fn analysis_session(&self) -> Result<AnalysisSession> {
        let url = self.analysis.url.as_deref().ok_or_else(|| {
            Error::Config("analysis service URL not set (LOOKOUT_ANALYSIS_URL)".to_string())
        })?;

        let backend = HttpAnalysisBackend::new(url, self.analysis.api_key.as_ref().map(copy_secret))
            .with_model(self.analysis.model.clone())
            .with_streaming(self.analysis.stream);

        let session = AnalysisSession::new(Arc::new(backend));
        Ok(match self.enricher() {
            Some(enricher) => session.with_enricher(enricher),
            None => session,
        })
    }

    /// Build the enrichment lookup, if configured
    #[must_use]
    pub fn enricher(&self) -> Option<Arc<dyn Enricher>> {
        let enricher = match self.enrichment.as_ref()? {
            EnrichmentConfig::Brave(key) => SearchEnricher::new_brave(copy_secret(key)),
            EnrichmentConfig::Serper(key) => SearchEnricher::new_serper(copy_secret(key)),
        };
        Some(Arc::new(enricher))
    }

    /// Build the remote synthesizer, if one is configured
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects its configuration
    pub fn remote_synthesizer(&self) -> Result<Option<Arc<dyn SpeechSynthesizer>>> {
        let Some(key) = self.speech.api_key.as_ref().map(copy_secret) else {
            return Ok(None);
        };

        let synthesizer = match &self.speech.provider {
            SpeechProvider::OpenAI => RemoteSynthesizer::new_openai(key, self.speech.model.clone())?,
            SpeechProvider::ElevenLabs => {
                RemoteSynthesizer::new_elevenlabs(key, self.speech.model.clone())?
            }
            SpeechProvider::Service { url } => RemoteSynthesizer::new_service(key, url.clone())?,
            SpeechProvider::Device => return Ok(None),
        };

        Ok(Some(Arc::new(synthesizer)))
    }

    /// Build the camera source
    ///
    /// A capture command wins over a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns error if no camera is configured or the command is not found
    pub fn frame_source(&self) -> Result<Arc<dyn FrameSource>> {
        if let Some(command) = &self.camera.command {
            return Ok(Arc::new(CommandSource::from_command_line(command)?));
        }
        if let Some(path) = &self.camera.snapshot_path {
            return Ok(Arc::new(SnapshotSource::new(path.clone())));
        }

        Err(Error::Config(
            "no camera configured (LOOKOUT_CAMERA_COMMAND or LOOKOUT_SNAPSHOT_PATH)".to_string(),
        ))
    }
}

/// Parse a TTS provider name
fn parse_provider(name: &str, service_url: Option<String>) -> Result<SpeechProvider> {
    match name.trim().to_lowercase().as_str() {
        "openai" => Ok(SpeechProvider::OpenAI),
        "elevenlabs" => Ok(SpeechProvider::ElevenLabs),
        "service" => service_url
            .map(|url| SpeechProvider::Service { url })
            .ok_or_else(|| Error::Config("speech service URL not set (LOOKOUT_TTS_URL)".to_string())),
        "device" | "none" => Ok(SpeechProvider::Device),
        other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
    }
}
