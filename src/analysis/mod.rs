//! Scene analysis
//!
//! The backend turns a frame into descriptive text. It may answer with a
//! single body or an incremental event stream; [`AnalysisSession`] folds
//! both into one event sequence and resolves to an [`AnalysisResult`] or a
//! typed [`AnalysisError`].

mod enrich;
mod http;
mod session;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;
use uuid::Uuid;

pub use enrich::{Enricher, SearchEnricher, SearchProvider, should_enrich};
pub use http::HttpAnalysisBackend;
pub use session::{AnalysisParams, AnalysisSession, SessionUpdate};

use crate::capture::Fingerprint;
use crate::mode::Mode;

/// Wait applied when a rate-limit response carries no retry-after
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// A delivered description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    /// Unique result id
    pub id: Uuid,
    /// Description text, never empty
    pub text: String,
    /// Mode the frame was analyzed in
    pub mode: Mode,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the analyzed frame
    pub source_fingerprint: Fingerprint,
    /// Served from the result cache
    pub was_cached: bool,
}

impl AnalysisResult {
    /// Create a fresh (uncached) result
    #[must_use]
    pub fn new(text: String, mode: Mode, source_fingerprint: Fingerprint) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            mode,
            timestamp: Utc::now(),
            source_fingerprint,
            was_cached: false,
        }
    }

    /// Copy of this result marked as served from cache
    #[must_use]
    pub fn as_cached(&self) -> Self {
        Self {
            was_cached: true,
            ..self.clone()
        }
    }
}

/// Why an analysis failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// Too many requests; try again after the given delay
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// How long to wait before retrying
        retry_after: Duration,
    },

    /// The backend rejected our credentials
    #[error("invalid credential")]
    InvalidCredential,

    /// The backend rejected the image or request
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything else
    #[error("analysis failed: {0}")]
    Unknown(String),
}

impl AnalysisError {
    /// Classify a backend error code
    #[must_use]
    pub fn from_code(code: &str, retry_after: Option<Duration>, message: Option<String>) -> Self {
        match code {
            "RATE_LIMIT_EXCEEDED" => Self::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            "INVALID_API_KEY" => Self::InvalidCredential,
            "INVALID_INPUT" | "INVALID_IMAGE" => {
                Self::InvalidInput(message.unwrap_or_else(|| code.to_lowercase()))
            }
            _ => Self::Unknown(message.unwrap_or_else(|| code.to_string())),
        }
    }

    /// Classify an HTTP status when the body carries no error code
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            429 => Self::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            401 | 403 => Self::InvalidCredential,
            400 | 413 | 422 => Self::InvalidInput(format!("HTTP {status}")),
            _ if body.is_empty() => Self::Unknown(format!("HTTP {status}")),
            _ => Self::Unknown(format!("HTTP {status}: {body}")),
        }
    }

    /// Short sentence suitable for speaking to the user
    #[must_use]
    pub fn spoken(&self) -> String {
        match self {
            Self::RateLimited { retry_after } => format!(
                "Too many requests. Trying again in {} seconds.",
                retry_after.as_secs()
            ),
            Self::InvalidCredential => {
                "The analysis service rejected the API key. Check your settings.".to_string()
            }
            Self::InvalidInput(_) => "The picture could not be analyzed. Please try again.".to_string(),
            Self::Unknown(_) => "Something went wrong describing the scene.".to_string(),
        }
    }
}

/// What to analyze
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// JPEG-encoded frame
    pub jpeg: Vec<u8>,
    /// Mode tag sent to the backend
    pub mode: Mode,
    /// Ask the backend to identify a single object
    pub detect_object: bool,
}

/// One event of an incremental analysis response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// The backend accepted the request
    Start,
    /// Full text so far
    Chunk {
        /// Cumulative text
        #[serde(alias = "description")]
        text: String,
    },
    /// Text appended since the previous event
    Delta {
        /// Incremental text
        text: String,
    },
    /// The backend began a supplementary lookup
    EnrichmentStarted,
    /// Summary of the supplementary lookup
    EnrichmentResult {
        /// Short summary to append
        summary: String,
    },
    /// Final description
    Complete {
        /// Final text; empty means "use what was streamed"
        #[serde(default, alias = "description")]
        text: String,
    },
    /// Terminal failure
    Error {
        /// Backend error code
        code: String,
        /// Seconds to wait, for rate limits
        #[serde(default, rename = "retryAfter")]
        retry_after: Option<u64>,
        /// Human-readable detail
        #[serde(default)]
        message: Option<String>,
    },
}

impl StreamEvent {
    /// Whether this event ends the exchange
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Stream of analysis events
pub type EventStream = BoxStream<'static, Result<StreamEvent, AnalysisError>>;

/// A backend reply
pub enum BackendResponse {
    /// Single-body description
    Complete(String),
    /// Incremental event stream
    Stream(EventStream),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Image-analysis backend
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Submit a frame for analysis
    ///
    /// # Errors
    ///
    /// Returns the classified failure if the backend refuses the request
    async fn submit(&self, request: AnalysisRequest) -> Result<BackendResponse, AnalysisError>;
}
