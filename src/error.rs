//! Error types for Lookout

use thiserror::Error;

use crate::analysis::AnalysisError;

/// Result type alias for Lookout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Lookout
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Camera source not ready, or the frame could not be read or encoded
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Image analysis failed
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    /// Invalid speech request
    #[error("speech error: {0}")]
    Speech(String),

    /// Remote text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio output error
    #[error("audio error: {0}")]
    Audio(String),

    /// On-device synthesizer failed; there is no further fallback
    #[error("speech synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    /// Supplementary search error
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Image decoding or encoding error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
