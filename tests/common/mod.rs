//! Shared test fakes
//!
//! Every collaborator of the controller and the speech coordinator has an
//! in-memory stand-in here so tests run without a camera, network or audio.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};

use lookout::analysis::{AnalysisBackend, AnalysisError, AnalysisRequest, AnalysisSession, BackendResponse};
use lookout::capture::{FrameCapturer, FrameSource};
use lookout::controller::{ControllerConfig, ControllerEvent, ModeController};
use lookout::speech::{
    AudioSink, DeviceSynthesizer, Priority, SpeechEndListener, SpeechOutcome, SpeechOutput, SpeechRequest,
    SpeechSpeed, SpeechSynthesizer, Synthesis,
};
use lookout::{Error, Mode, Result};

/// Four flat quadrants; `inverted` swaps light and dark
#[must_use]
pub fn scene(inverted: bool) -> DynamicImage {
    let img = GrayImage::from_fn(64, 48, |x, y| {
        let dark = matches!((x < 32, y < 24), (true, true) | (false, false));
        Luma([if dark != inverted { 40 } else { 200 }])
    });
    DynamicImage::ImageLuma8(img)
}

/// Vertical stripes, far from both quadrant scenes
#[must_use]
pub fn stripes() -> DynamicImage {
    let img = GrayImage::from_fn(64, 48, |x, _| Luma([if (x / 8) % 2 == 0 { 30 } else { 220 }]));
    DynamicImage::ImageLuma8(img)
}

/// A camera whose current picture can be swapped by the test
pub struct FakeCamera {
    image: Mutex<DynamicImage>,
    ready: AtomicBool,
}

impl FakeCamera {
    pub fn new(image: DynamicImage) -> Arc<Self> {
        Arc::new(Self {
            image: Mutex::new(image),
            ready: AtomicBool::new(true),
        })
    }

    pub fn show(&self, image: DynamicImage) {
        *self.image.lock().unwrap() = image;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSource for FakeCamera {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn read_frame(&self) -> Result<DynamicImage> {
        Ok(self.image.lock().unwrap().clone())
    }
}

/// One scripted backend reply
pub enum Reply {
    /// Answer with a single body
    Text(String),
    /// Answer after a delay
    Slow(String, Duration),
    /// Fail
    Fail(AnalysisError),
    /// Never answer
    Hang,
}

/// Backend that plays back scripted replies, then repeats a default
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Reply>>,
    fallback: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<AnalysisRequest>>,
}

impl ScriptedBackend {
    pub fn new(fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<AnalysisRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn submit(&self, request: AnalysisRequest) -> std::result::Result<BackendResponse, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            None => Ok(BackendResponse::Complete(self.fallback.clone())),
            Some(Reply::Text(text)) => Ok(BackendResponse::Complete(text)),
            Some(Reply::Slow(text, delay)) => {
                tokio::time::sleep(delay).await;
                Ok(BackendResponse::Complete(text))
            }
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) => futures::future::pending().await,
        }
    }
}

/// Speech output that records requests and finishes them instantly
#[derive(Default)]
pub struct RecordingSpeech {
    spoken: Mutex<Vec<SpeechRequest>>,
    listeners: Mutex<Vec<SpeechEndListener>>,
    cancels: AtomicUsize,
}

impl RecordingSpeech {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spoken(&self) -> Vec<(String, Priority)> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.text.clone(), r.priority))
            .collect()
    }

    pub fn spoken_at(&self, priority: Priority) -> Vec<String> {
        self.spoken()
            .into_iter()
            .filter(|(_, p)| *p == priority)
            .map(|(text, _)| text)
            .collect()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechOutput for RecordingSpeech {
    fn is_speaking(&self) -> bool {
        false
    }

    async fn speak(&self, request: SpeechRequest) -> Result<SpeechOutcome> {
        self.spoken.lock().unwrap().push(request);
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap());
        for listener in listeners {
            listener();
        }
        Ok(SpeechOutcome::Completed)
    }

    fn on_speech_end(&self, listener: SpeechEndListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn cancel_all(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().clear();
    }
}

/// A controller wired to fakes
pub struct Harness {
    pub controller: ModeController,
    pub events: tokio::sync::mpsc::UnboundedReceiver<ControllerEvent>,
    pub camera: Arc<FakeCamera>,
    pub backend: Arc<ScriptedBackend>,
    pub speech: Arc<RecordingSpeech>,
}

impl Harness {
    pub fn new(fallback: &str) -> Self {
        Self::with_config(fallback, ControllerConfig::default())
    }

    pub fn with_config(fallback: &str, config: ControllerConfig) -> Self {
        let camera = FakeCamera::new(scene(false));
        let backend = ScriptedBackend::new(fallback);
        let speech = RecordingSpeech::new();

        let (controller, events) = ModeController::new(
            FrameCapturer::new(camera.clone()),
            AnalysisSession::new(backend.clone()),
            speech.clone(),
            config,
        );

        Self {
            controller,
            events,
            camera,
            backend,
            speech,
        }
    }

    /// Wait for the first event matching `pred`, failing after a minute of
    /// (possibly virtual) time
    pub async fn wait_for<F>(&mut self, pred: F) -> ControllerEvent
    where
        F: FnMut(&ControllerEvent) -> bool,
    {
        next_matching(&mut self.events, pred).await
    }

    /// Drain events already published
    pub fn drain(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Wait for the first event on `events` matching `pred`, failing after a
/// minute of (possibly virtual) time
pub async fn next_matching<F>(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ControllerEvent>,
    mut pred: F,
) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("controller dropped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Whether an event is a description delivered in `mode`
pub fn described_in(mode: Mode) -> impl FnMut(&ControllerEvent) -> bool {
    move |event| matches!(event, ControllerEvent::Described(result) if result.mode == mode)
}

/// Let spawned tasks run without advancing time
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Remote synthesizer with a fixed behavior
pub struct FakeRemote {
    pub behavior: RemoteBehavior,
    calls: AtomicUsize,
}

#[derive(Clone, Copy)]
pub enum RemoteBehavior {
    Audio,
    UseFallback,
    Fail,
}

impl FakeRemote {
    pub fn new(behavior: RemoteBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeRemote {
    async fn synthesize(&self, text: &str, _voice: &str, _speed: SpeechSpeed) -> Result<Synthesis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RemoteBehavior::Audio => Ok(Synthesis::Audio(text.as_bytes().to_vec())),
            RemoteBehavior::UseFallback => Ok(Synthesis::UseFallback("quota exhausted".to_string())),
            RemoteBehavior::Fail => Err(Error::Tts("service unavailable".to_string())),
        }
    }
}

/// Tracks how many utterances are audible at once
#[derive(Default)]
pub struct Audible {
    now: AtomicUsize,
    peak: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

impl Audible {
    fn enter(&self) {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self, text: String) {
        self.now.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().unwrap().push(text);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

/// Leaves the audible set when dropped, so cancelled playback is counted too
struct Playing<'a>(&'a Audible, Option<String>);

impl Drop for Playing<'_> {
    fn drop(&mut self) {
        if let Some(text) = self.1.take() {
            self.0.leave(text);
        } else {
            self.0.now.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Speakers that "play" for a fixed duration per utterance
pub struct FakeSink {
    pub audible: Arc<Audible>,
    duration: Duration,
}

impl FakeSink {
    pub fn new(audible: Arc<Audible>, duration: Duration) -> Arc<Self> {
        Arc::new(Self { audible, duration })
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, audio: Vec<u8>) -> Result<()> {
        self.audible.enter();
        let mut playing = Playing(&self.audible, None);
        tokio::time::sleep(self.duration).await;
        playing.1 = Some(String::from_utf8_lossy(&audio).into_owned());
        Ok(())
    }
}

/// On-device synthesizer that "speaks" for a fixed duration
pub struct FakeDevice {
    pub audible: Arc<Audible>,
    duration: Duration,
    available: bool,
    calls: AtomicUsize,
}

impl FakeDevice {
    pub fn new(audible: Arc<Audible>, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            audible,
            duration,
            available: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unavailable(audible: Arc<Audible>) -> Arc<Self> {
        Arc::new(Self {
            audible,
            duration: Duration::ZERO,
            available: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSynthesizer for FakeDevice {
    async fn speak(&self, text: &str, _speed: SpeechSpeed) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(Error::SynthesisUnavailable("no engine".to_string()));
        }

        self.audible.enter();
        let mut playing = Playing(&self.audible, None);
        tokio::time::sleep(self.duration).await;
        playing.1 = Some(text.to_string());
        Ok(())
    }
}

/// Poll `cond` on a short (possibly virtual) interval until it holds
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
