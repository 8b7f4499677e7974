//! Lookout - camera narration and hands-free guidance
//!
//! This library provides the core of the Lookout assistant:
//! - Frame capture, downscaling and perceptual fingerprints
//! - Scene analysis against a remote vision-language service
//! - Speech output with a remote synthesizer and an on-device fallback
//! - A mode controller that paces single-shot narration and periodic guidance
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Mode Controller                    │
//! │    Narration (tap)   │   Guidance (timer + health)   │
//! └──────┬──────────────┬───────────────┬───────────────┘
//!        │              │               │
//! ┌──────▼─────┐ ┌──────▼──────┐ ┌──────▼──────────────┐
//! │  Capture   │ │  Analysis   │ │  Speech Coordinator  │
//! │ fingerprint│ │  session    │ │  remote │ device     │
//! └──────┬─────┘ └──────┬──────┘ └─────────────────────┘
//!        │              │
//!   Result cache    Analysis backend (HTTP / SSE)
//! ```

pub mod analysis;
pub mod cache;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod mode;
pub mod speech;

pub use analysis::{AnalysisError, AnalysisResult, AnalysisSession};
pub use cache::{History, ResultCache};
pub use capture::{Fingerprint, Frame, FrameCapturer};
pub use config::Config;
pub use controller::{ControllerConfig, ControllerEvent, CycleOutcome, ModeController};
pub use error::{Error, Result};
pub use mode::Mode;
pub use speech::{SpeechCoordinator, SpeechOutput, SpeechRequest, VoiceSettings};
