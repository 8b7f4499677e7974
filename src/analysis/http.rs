//! HTTP analysis backend
//!
//! Posts the frame as a base64 data URL and accepts either a JSON body or a
//! `text/event-stream` of typed events.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{AnalysisBackend, AnalysisError, AnalysisRequest, BackendResponse, EventStream, StreamEvent};
use crate::mode::Mode;

/// Request timeout for single-body responses and stream setup
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Analysis request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeBody<'a> {
    image: String,
    mode: Mode,
    detect_object: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Single-body success or error
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    retry_after: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

impl ResponseBody {
    fn error_code(&self) -> Option<&str> {
        self.code.as_deref().or(self.error.as_deref())
    }

    fn into_error(self, code: &str) -> AnalysisError {
        AnalysisError::from_code(code, self.retry_after.map(Duration::from_secs), self.message)
    }
}

/// Analysis service reached over HTTP
pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
    model: Option<String>,
    stream: bool,
}

impl HttpAnalysisBackend {
    /// Create a backend for the service at `url`
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
            model: None,
            stream: true,
        }
    }

    /// Request a specific model
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Ask for incremental responses
    #[must_use]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn submit(&self, request: AnalysisRequest) -> Result<BackendResponse, AnalysisError> {
        let image = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&request.jpeg)
        );

        let body = AnalyzeBody {
            image,
            mode: request.mode,
            detect_object: request.detect_object,
            stream: self.stream,
            model: self.model.as_deref(),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        if self.stream {
            builder = builder.header(ACCEPT, "text/event-stream, application/json");
        }
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AnalysisError::Unknown(format!("request failed: {e}")))?;

        let status = response.status();
        let retry_after = retry_after_header(response.headers());

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = classify_failure(status.as_u16(), retry_after, &text);
            tracing::debug!(status = %status, error = %error, "analysis request rejected");
            return Err(error);
        }

        if is_event_stream(response.headers()) {
            tracing::trace!("analysis response is an event stream");
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed();
            return Ok(BackendResponse::Stream(sse_events(body)));
        }

        let body: ResponseBody = response
            .json()
            .await
            .map_err(|e| AnalysisError::Unknown(format!("invalid response: {e}")))?;

        if let Some(code) = body.error_code().map(ToString::to_string) {
            return Err(body.into_error(&code));
        }

        let text = body.description.or(body.text).unwrap_or_default();
        Ok(BackendResponse::Complete(text))
    }
}

/// Classify a non-success response, preferring the body's error code
fn classify_failure(status: u16, retry_after: Option<Duration>, text: &str) -> AnalysisError {
    let body: ResponseBody = serde_json::from_str(text).unwrap_or_default();

    match body.error_code().map(ToString::to_string) {
        Some(code) => match body.into_error(&code) {
            AnalysisError::RateLimited { retry_after: from_body } => AnalysisError::RateLimited {
                retry_after: retry_after.unwrap_or(from_body),
            },
            other => other,
        },
        None => AnalysisError::from_status(status, retry_after, text.trim()),
    }
}

/// Parse a `Retry-After` header given in seconds
fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Incremental server-sent-events decoder
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every event completed by them
    fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, AnalysisError>> {
        self.buffer.extend(chunk.iter().filter(|&&b| b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a final event that was not followed by a blank line
    fn finish(&mut self) -> Option<Result<StreamEvent, AnalysisError>> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

/// Parse one SSE block; comments, keep-alives and unknown payloads yield nothing
fn parse_block(block: &[u8]) -> Option<Result<StreamEvent, AnalysisError>> {
    let block = String::from_utf8_lossy(block);
    let data = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");

    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamEvent>(&data) {
        Ok(event) => Some(Ok(event)),
        Err(e) => {
            tracing::debug!(error = %e, "skipping unrecognized stream event");
            None
        }
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamEvent, AnalysisError>>,
    finished: bool,
}

/// Turn a response body into a stream of analysis events
fn sse_events(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> EventStream {
    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => state.pending.extend(state.decoder.feed(&bytes)),
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(AnalysisError::Unknown(format!("stream interrupted: {e}"))));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.feed(b"data: {\"type\":\"start\"}\n").is_empty());
        let events = decoder.feed(b"\ndata: {\"type\":\"delta\",\"te");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], Ok(StreamEvent::Start));

        let events = decoder.feed(b"xt\":\"A red door\"}\r\n\r\n");
        assert_eq!(events, [Ok(StreamEvent::Delta { text: "A red door".into() })]);
    }

    #[test]
    fn comments_and_unknown_events_are_skipped() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b": keep-alive\n\ndata: {\"type\":\"mystery\"}\n\ndata: [DONE]\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn trailing_event_is_flushed() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"type\":\"complete\",\"text\":\"Done.\"}").is_empty());
        assert_eq!(
            decoder.finish(),
            Some(Ok(StreamEvent::Complete { text: "Done.".into() }))
        );
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn stream_yields_decoded_events() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"type\":\"start\"}\n\ndata: {\"type\":\"chunk\",".to_vec()),
            Ok(b"\"text\":\"A cat\"}\n\ndata: {\"type\":\"complete\",\"text\":\"A cat.\"}".to_vec()),
        ];
        let events: Vec<_> = sse_events(futures::stream::iter(chunks).boxed()).collect().await;

        assert_eq!(
            events,
            [
                Ok(StreamEvent::Start),
                Ok(StreamEvent::Chunk { text: "A cat".into() }),
                Ok(StreamEvent::Complete { text: "A cat.".into() }),
            ]
        );
    }

    #[test]
    fn failure_body_code_wins_over_status() {
        let error = classify_failure(500, None, r#"{"error":"INVALID_API_KEY"}"#);
        assert_eq!(error, AnalysisError::InvalidCredential);

        let error = classify_failure(
            429,
            Some(Duration::from_secs(12)),
            r#"{"error":"RATE_LIMIT_EXCEEDED","retryAfter":30}"#,
        );
        assert_eq!(
            error,
            AnalysisError::RateLimited {
                retry_after: Duration::from_secs(12)
            }
        );

        let error = classify_failure(413, None, "payload too large");
        assert!(matches!(error, AnalysisError::InvalidInput(_)));
    }

    #[test]
    fn retry_after_header_in_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "45".parse().unwrap());
        assert_eq!(retry_after_header(&headers), Some(Duration::from_secs(45)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);
    }

    #[test]
    fn request_body_uses_camel_case() {
        let body = AnalyzeBody {
            image: "data:image/jpeg;base64,AA==".into(),
            mode: Mode::Guidance,
            detect_object: true,
            stream: false,
            model: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["mode"], "guidance");
        assert_eq!(json["detectObject"], true);
        assert!(json.get("model").is_none());
    }
}
