//! Speech output
//!
//! [`SpeechCoordinator`] is the single authority for audio output. It picks
//! between the remote synthesizer and the on-device fallback, guarantees at
//! most one utterance at a time, and tells interested parties when speech
//! ends so they can resume without talking over it.

mod device;
mod playback;
mod tts;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use device::SystemSynthesizer;
pub use playback::AudioPlayback;
pub use tts::{RemoteSynthesizer, TtsProvider};

use crate::{Error, Result};

/// Shorter texts go straight to the on-device synthesizer
pub const MIN_REMOTE_CHARS: usize = 10;

/// Urgency of a speech request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information
    Low,
    /// Descriptions
    #[default]
    Normal,
    /// Errors and mode announcements; interrupts whatever is speaking
    High,
}

impl Priority {
    /// Whether a request at this priority interrupts active speech
    #[must_use]
    pub const fn preempts(self) -> bool {
        matches!(self, Self::High)
    }
}

/// Speaking rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechSpeed {
    /// Slower than conversational
    Slow,
    /// Conversational
    #[default]
    Normal,
    /// Faster than conversational
    Fast,
}

impl SpeechSpeed {
    /// Rate multiplier applied by synthesizers
    #[must_use]
    pub const fn rate(self) -> f32 {
        match self {
            Self::Slow => 0.75,
            Self::Normal => 1.0,
            Self::Fast => 1.25,
        }
    }

    /// Descriptor sent to speech services
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Normal => "normal",
            Self::Fast => "fast",
        }
    }

    /// Parse a user-supplied speed name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "slow" => Some(Self::Slow),
            "normal" | "medium" => Some(Self::Normal),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Which synthesizer the user prefers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisBackend {
    /// Network synthesizer, falling back to the device on failure
    #[default]
    Remote,
    /// Always use the on-device synthesizer
    Device,
}

impl SynthesisBackend {
    /// Parse a user-supplied backend name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "remote" | "cloud" | "network" => Some(Self::Remote),
            "device" | "local" | "system" => Some(Self::Device),
            _ => None,
        }
    }
}

/// User-adjustable voice settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Preferred synthesizer
    pub backend: SynthesisBackend,
    /// Remote voice identifier (e.g. "alloy")
    pub voice: String,
    /// Speaking rate
    pub speed: SpeechSpeed,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            backend: SynthesisBackend::Remote,
            voice: "alloy".to_string(),
            speed: SpeechSpeed::Normal,
        }
    }
}

/// A single utterance to be spoken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    /// Text to speak
    pub text: String,
    /// Remote voice identifier
    pub voice: String,
    /// Speaking rate
    pub speed: SpeechSpeed,
    /// Urgency
    pub priority: Priority,
    /// Skip the remote synthesizer
    pub force_fallback: bool,
}

impl SpeechRequest {
    /// Build a request using the user's voice settings
    #[must_use]
    pub fn new(text: impl Into<String>, settings: &VoiceSettings, priority: Priority) -> Self {
        Self {
            text: text.into(),
            voice: settings.voice.clone(),
            speed: settings.speed,
            priority,
            force_fallback: settings.backend == SynthesisBackend::Device,
        }
    }
}

/// How a speech request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Spoken to the end
    Completed,
    /// Interrupted by a higher-priority request or `cancel_all`
    Cancelled,
}

/// One-shot callback fired when the current utterance ends
pub type SpeechEndListener = Box<dyn FnOnce() + Send>;

/// Speech output as seen by the rest of the system
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Whether an utterance is currently active
    fn is_speaking(&self) -> bool;

    /// Speak a request, resolving when it completes or is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the text is empty or no synthesizer could speak it
    async fn speak(&self, request: SpeechRequest) -> Result<SpeechOutcome>;

    /// Register a one-shot listener for the end of the current utterance
    fn on_speech_end(&self, listener: SpeechEndListener);

    /// Stop all output and drop pending listeners without firing them
    fn cancel_all(&self);
}

/// Result of asking the remote synthesizer for audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesis {
    /// Playable audio (MP3)
    Audio(Vec<u8>),
    /// The service asked the caller to use the on-device synthesizer
    UseFallback(String),
}

/// Network text-to-speech
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize audio for `text`
    ///
    /// # Errors
    ///
    /// Returns error on network, credential, or rate-limit failures
    async fn synthesize(&self, text: &str, voice: &str, speed: SpeechSpeed) -> Result<Synthesis>;
}

/// Plays synthesized audio
///
/// Dropping the returned future must stop playback.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play audio to completion
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be decoded or played
    async fn play(&self, audio: Vec<u8>) -> Result<()>;
}

/// Always-available on-device synthesizer
///
/// Dropping the returned future must stop speech.
#[async_trait]
pub trait DeviceSynthesizer: Send + Sync {
    /// Speak `text` to completion
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot synthesize speech
    async fn speak(&self, text: &str, speed: SpeechSpeed) -> Result<()>;
}

/// The utterance currently holding the output
struct ActiveUtterance {
    id: u64,
    priority: Priority,
    cancel: CancellationToken,
    /// Cancelled once the utterance has released its synthesizer
    stopped: CancellationToken,
}

/// A claim on the output
struct Slot {
    id: u64,
    cancel: CancellationToken,
    stopped: CancellationToken,
    /// The preempted utterance, which must go quiet before this one starts
    preempted: Option<CancellationToken>,
}

#[derive(Default)]
struct SpeechState {
    active: Option<ActiveUtterance>,
    listeners: Vec<SpeechEndListener>,
    next_id: u64,
    /// Bumped by `cancel_all` to release queued requests
    epoch: u64,
}

/// Serializes speech across the remote and on-device synthesizers
pub struct SpeechCoordinator {
    remote: Option<Arc<dyn SpeechSynthesizer>>,
    sink: Arc<dyn AudioSink>,
    device: Arc<dyn DeviceSynthesizer>,
    state: Mutex<SpeechState>,
    /// `true` while no utterance is active
    idle: watch::Sender<bool>,
}

impl SpeechCoordinator {
    /// Create a coordinator
    ///
    /// Without a remote synthesizer every request uses the device.
    #[must_use]
    pub fn new(
        remote: Option<Arc<dyn SpeechSynthesizer>>,
        sink: Arc<dyn AudioSink>,
        device: Arc<dyn DeviceSynthesizer>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            remote,
            sink,
            device,
            state: Mutex::new(SpeechState::default()),
            idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeechState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Wait until the output is free (or this request may preempt), then claim it
    ///
    /// Returns `None` if `cancel_all` ran while waiting.
    async fn acquire(&self, priority: Priority) -> Option<Slot> {
        let epoch = self.lock().epoch;

        loop {
            let mut idle_rx = self.idle.subscribe();
            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return None;
                }

                let must_wait = state.active.is_some() && !priority.preempts();
                if !must_wait {
                    let preempted = state.active.take().map(|previous| {
                        tracing::debug!(utterance = previous.id, "preempting active speech");
                        previous.cancel.cancel();
                        previous.stopped
                    });

                    state.next_id += 1;
                    let slot = Slot {
                        id: state.next_id,
                        cancel: CancellationToken::new(),
                        stopped: CancellationToken::new(),
                        preempted,
                    };
                    state.active = Some(ActiveUtterance {
                        id: slot.id,
                        priority,
                        cancel: slot.cancel.clone(),
                        stopped: slot.stopped.clone(),
                    });
                    self.idle.send_replace(false);
                    return Some(slot);
                }
            }

            // Sender lives as long as `self`
            let _ = idle_rx.wait_for(|idle| *idle).await;
        }
    }

    /// Release the output if `id` still holds it and fire listeners
    fn release(&self, id: u64) {
        let listeners = {
            let mut state = self.lock();
            if state.active.as_ref().is_none_or(|active| active.id != id) {
                return;
            }
            state.active = None;
            std::mem::take(&mut state.listeners)
        };

        self.idle.send_replace(true);

        tracing::trace!(utterance = id, listeners = listeners.len(), "speech ended");
        for listener in listeners {
            listener();
        }
    }

    /// Pick a synthesizer and speak
    async fn render(&self, request: &SpeechRequest) -> Result<()> {
        let short = request.text.chars().count() < MIN_REMOTE_CHARS;

        if let Some(remote) = self.remote.as_ref().filter(|_| !request.force_fallback && !short) {
            match remote
                .synthesize(&request.text, &request.voice, request.speed)
                .await
            {
                Ok(Synthesis::Audio(audio)) => match self.sink.play(audio).await {
                    Ok(()) => return Ok(()),
                    Err(e) => tracing::warn!(error = %e, "playback failed, using device synthesizer"),
                },
                Ok(Synthesis::UseFallback(reason)) => {
                    tracing::debug!(reason = %reason, "speech service requested device synthesizer");
                }
                Err(e) => tracing::warn!(error = %e, "remote TTS failed, using device synthesizer"),
            }
        }

        self.device
            .speak(&request.text, request.speed)
            .await
            .map_err(|e| match e {
                Error::SynthesisUnavailable(_) => e,
                other => Error::SynthesisUnavailable(other.to_string()),
            })
    }
}

/// Marks an utterance stopped and frees the output, even if the speaking
/// future is dropped midway
struct Release<'a> {
    coordinator: &'a SpeechCoordinator,
    id: u64,
    stopped: CancellationToken,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.stopped.cancel();
        self.coordinator.release(self.id);
    }
}

#[async_trait]
impl SpeechOutput for SpeechCoordinator {
    fn is_speaking(&self) -> bool {
        self.lock().active.is_some()
    }

    async fn speak(&self, request: SpeechRequest) -> Result<SpeechOutcome> {
        if request.text.trim().is_empty() {
            return Err(Error::Speech("cannot speak empty text".to_string()));
        }

        let Some(slot) = self.acquire(request.priority).await else {
            return Ok(SpeechOutcome::Cancelled);
        };
        let _release = Release {
            coordinator: self,
            id: slot.id,
            stopped: slot.stopped,
        };

        tracing::debug!(
            utterance = slot.id,
            priority = ?request.priority,
            chars = request.text.len(),
            "speaking"
        );

        // Dropping the render future stops playback or kills the synthesizer
        tokio::select! {
            biased;
            () = slot.cancel.cancelled() => Ok(SpeechOutcome::Cancelled),
            rendered = async {
                if let Some(preempted) = &slot.preempted {
                    preempted.cancelled().await;
                }
                self.render(&request).await
            } => rendered.map(|()| SpeechOutcome::Completed),
        }
    }

    fn on_speech_end(&self, listener: SpeechEndListener) {
        self.lock().listeners.push(listener);
    }

    fn cancel_all(&self) {
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.listeners.clear();
            if let Some(active) = state.active.take() {
                tracing::debug!(utterance = active.id, priority = ?active.priority, "speech cancelled");
                active.cancel.cancel();
            }
        }
        self.idle.send_replace(true);
    }
}
