//! TOML configuration file loading
//!
//! Supports `~/.config/lookout/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::controller::TimingOverrides;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LookoutConfigFile {
    /// Analysis service
    pub analysis: AnalysisFileConfig,

    /// Speech output
    pub speech: SpeechFileConfig,

    /// Camera source
    pub camera: CameraFileConfig,

    /// API keys for external services
    pub api_keys: ApiKeysFileConfig,

    /// Supplementary lookups
    pub enrichment: EnrichmentFileConfig,

    /// Mode cadence and thresholds
    pub timing: TimingOverrides,
}

/// Analysis service configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisFileConfig {
    /// Endpoint URL
    pub url: Option<String>,

    /// Model identifier forwarded to the service
    pub model: Option<String>,

    /// Request incremental responses
    pub stream: Option<bool>,
}

/// Speech output configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpeechFileConfig {
    /// "openai", "elevenlabs", "service" or "device"
    pub provider: Option<String>,

    /// Speech service endpoint (provider "service")
    pub service_url: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub model: Option<String>,

    /// Voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// "slow", "normal" or "fast"
    pub speed: Option<String>,
}

/// Camera source configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CameraFileConfig {
    /// Command that writes one encoded frame to stdout
    pub command: Option<String>,

    /// Image file kept fresh by an external grabber
    pub snapshot_path: Option<PathBuf>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiKeysFileConfig {
    pub analysis: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub speech_service: Option<String>,
    pub brave: Option<String>,
    pub serper: Option<String>,
}

/// Enrichment configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EnrichmentFileConfig {
    /// Enable supplementary lookups (requires a search key)
    pub enabled: Option<bool>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path
/// is used if present and parse failures fall back to defaults.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<LookoutConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = parse_config(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(LookoutConfigFile::default());
    };

    if !path.exists() {
        return Ok(LookoutConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(LookoutConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(LookoutConfigFile::default())
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> Result<LookoutConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/lookout/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("lookout").join("config.toml"))
}
