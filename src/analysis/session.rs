//! One request/response exchange with the analysis backend

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use super::{
    AnalysisBackend, AnalysisError, AnalysisRequest, AnalysisResult, BackendResponse, Enricher,
    EventStream, StreamEvent, should_enrich,
};
use crate::capture::{Fingerprint, Frame};
use crate::mode::Mode;

/// Upper bound on a supplementary lookup
const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisParams {
    /// Mode tag for the backend
    pub mode: Mode,
    /// Ask the backend to identify a single object
    pub detect_object: bool,
    /// Allow a supplementary lookup after completion
    pub enrich: bool,
}

impl AnalysisParams {
    /// Default options for a mode
    #[must_use]
    pub const fn for_mode(mode: Mode) -> Self {
        Self {
            mode,
            detect_object: false,
            enrich: matches!(mode, Mode::Narration),
        }
    }
}

/// Progress surfaced while a session runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The backend accepted the request
    Started,
    /// Text so far
    Partial(String),
    /// A supplementary lookup is running
    Enriching,
}

/// Drives analysis requests against a backend
#[derive(Clone)]
pub struct AnalysisSession {
    backend: Arc<dyn AnalysisBackend>,
    enricher: Option<Arc<dyn Enricher>>,
}

/// Text accumulated from an event sequence
#[derive(Default)]
struct Transcript {
    text: String,
    enrichment: Option<String>,
}

impl AnalysisSession {
    /// Create a session without enrichment
    #[must_use]
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            enricher: None,
        }
    }

    /// Add a supplementary lookup after completion
    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Analyze a frame
    ///
    /// Partial text is passed to `on_update` as it arrives. Dropping the
    /// returned future releases the response stream.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; a stream that ends without a
    /// terminal event or yields no text is `AnalysisError::Unknown`
    pub async fn analyze<F>(
        &self,
        frame: &Frame,
        fingerprint: Fingerprint,
        params: AnalysisParams,
        mut on_update: F,
    ) -> Result<AnalysisResult, AnalysisError>
    where
        F: FnMut(SessionUpdate) + Send,
    {
        let request = AnalysisRequest {
            jpeg: frame.jpeg().to_vec(),
            mode: params.mode,
            detect_object: params.detect_object,
        };

        let events: EventStream = match self.backend.submit(request).await? {
            BackendResponse::Complete(text) => futures::stream::iter([
                Ok(StreamEvent::Start),
                Ok(StreamEvent::Complete { text }),
            ])
            .boxed(),
            BackendResponse::Stream(stream) => stream,
        };

        let transcript = consume(events, &mut on_update).await?;
        let mut text = transcript.text;

        let summary = match transcript.enrichment {
            Some(summary) => Some(summary),
            None if params.enrich && should_enrich(&text, params.mode) => {
                self.enrich(&text, &mut on_update).await
            }
            None => None,
        };

        if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
            text = merge(&text, &summary);
        }

        tracing::debug!(mode = %params.mode, chars = text.len(), "analysis complete");
        Ok(AnalysisResult::new(text, params.mode, fingerprint))
    }

    /// Run the client-side lookup; failures are logged and dropped
    async fn enrich<F>(&self, text: &str, on_update: &mut F) -> Option<String>
    where
        F: FnMut(SessionUpdate) + Send,
    {
        let enricher = self.enricher.as_ref()?;
        on_update(SessionUpdate::Enriching);

        match tokio::time::timeout(ENRICHMENT_TIMEOUT, enricher.enrich(text)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "enrichment failed");
                None
            }
            Err(_) => {
                tracing::debug!("enrichment timed out");
                None
            }
        }
    }
}

/// Fold an event sequence into a transcript, stopping at the first terminal event
async fn consume<F>(mut events: EventStream, on_update: &mut F) -> Result<Transcript, AnalysisError>
where
    F: FnMut(SessionUpdate) + Send,
{
    let mut transcript = Transcript::default();

    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Start => on_update(SessionUpdate::Started),
            StreamEvent::Chunk { text } => {
                transcript.text = text;
                on_update(SessionUpdate::Partial(transcript.text.clone()));
            }
            StreamEvent::Delta { text } => {
                transcript.text.push_str(&text);
                on_update(SessionUpdate::Partial(transcript.text.clone()));
            }
            StreamEvent::EnrichmentStarted => on_update(SessionUpdate::Enriching),
            StreamEvent::EnrichmentResult { summary } => transcript.enrichment = Some(summary),
            StreamEvent::Complete { text } => {
                if !text.trim().is_empty() {
                    transcript.text = text;
                }
                transcript.text = transcript.text.trim().to_string();
                if transcript.text.is_empty() {
                    return Err(AnalysisError::Unknown("empty description".to_string()));
                }
                return Ok(transcript);
            }
            StreamEvent::Error {
                code,
                retry_after,
                message,
            } => {
                return Err(AnalysisError::from_code(
                    &code,
                    retry_after.map(Duration::from_secs),
                    message,
                ));
            }
        }
    }

    Err(AnalysisError::Unknown(
        "stream ended without a result".to_string(),
    ))
}

/// Append a supplementary summary as its own sentence
fn merge(text: &str, summary: &str) -> String {
    let text = text.trim_end();
    let summary = summary.trim();
    if text.ends_with(['.', '!', '?']) {
        format!("{text} {summary}")
    } else {
        format!("{text}. {summary}")
    }
}
