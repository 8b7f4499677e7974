//! Mode controller
//!
//! Orchestrates capture → fingerprint → cache → analysis → speech. Both
//! modes share one cycle function, parameterized by a [`ModePolicy`]:
//!
//! - Narration runs one cycle per user trigger and ignores triggers while a
//!   cycle (including its speech) is in flight.
//! - Guidance runs a cycle immediately, then on a fixed period, skipping ticks
//!   while busy or speaking. A health check forces an extra cycle when the
//!   loop has stalled, and each spoken result schedules the next cycle shortly
//!   after the utterance ends.
//!
//! Every mode switch bumps an epoch. Timers belong to the epoch that started
//! them and are aborted on the next switch; late results from a superseded
//! epoch or cycle are discarded.

mod policy;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use policy::{ControllerConfig, GuidanceTiming, ModePolicy, RateLimitPolicy, TimingOverrides};

use crate::Result;
use crate::analysis::{AnalysisError, AnalysisParams, AnalysisResult, AnalysisSession, SessionUpdate};
use crate::cache::{History, ResultCache};
use crate::capture::{Fingerprint, FrameCapturer, fingerprint};
use crate::mode::Mode;
use crate::speech::{Priority, SpeechOutcome, SpeechOutput, SpeechRequest, VoiceSettings};

/// Spoken once guidance failures reach the retry ceiling
const STALL_WARNING: &str = "Guidance is having trouble. Say refresh to try again.";

/// Spoken when rate-limit retries are exhausted
const RETRIES_EXHAUSTED: &str = "The service is still busy. Please try again later.";

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    /// User tapped to describe the scene
    Tap,
    /// User asked to identify a single object
    Detect,
    /// First guidance cycle after entering the mode
    Start,
    /// Guidance period elapsed
    Tick,
    /// Follow-up after a spoken guidance result
    Paced,
    /// Guidance stalled
    HealthCheck,
    /// User forced a refresh
    Manual,
    /// Automatic retry after rate limiting
    RateLimitRetry {
        /// 1-based retry number
        attempt: u32,
        /// Whether the original action was a detect
        detect_object: bool,
        /// Retry generation of the mode when the retry was scheduled
        generation: u64,
    },
}

impl CycleTrigger {
    /// Forced cycles may start while another cycle is in flight
    const fn is_forced(self) -> bool {
        matches!(self, Self::HealthCheck | Self::Manual)
    }

    /// Periodic cycles are skipped while speech is playing
    const fn is_periodic(self) -> bool {
        matches!(self, Self::Tick | Self::Paced)
    }

    /// Cycles started directly by the user
    const fn is_user_action(self) -> bool {
        matches!(self, Self::Tap | Self::Detect | Self::Manual)
    }

    /// Cycles held back while a rate-limit wait is pending
    const fn respects_backoff(self) -> bool {
        matches!(self, Self::Start | Self::Tick | Self::Paced | Self::HealthCheck)
    }

    const fn detect_object(self) -> bool {
        matches!(
            self,
            Self::Detect
                | Self::RateLimitRetry {
                    detect_object: true,
                    ..
                }
        )
    }

    const fn retry_attempt(self) -> u32 {
        match self {
            Self::RateLimitRetry { attempt, .. } => attempt,
            _ => 0,
        }
    }
}

impl std::fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tap => f.write_str("tap"),
            Self::Detect => f.write_str("detect"),
            Self::Start => f.write_str("start"),
            Self::Tick => f.write_str("tick"),
            Self::Paced => f.write_str("paced"),
            Self::HealthCheck => f.write_str("health-check"),
            Self::Manual => f.write_str("manual"),
            Self::RateLimitRetry { attempt, .. } => write!(f, "retry-{attempt}"),
        }
    }
}

/// Why a cycle did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is in flight
    Busy,
    /// Speech is playing
    Speaking,
    /// The frame matches the last delivered one
    Duplicate,
    /// The cycle belongs to a mode that is not active
    WrongMode,
    /// Waiting out a rate limit
    BackingOff,
    /// Guidance stopped after a credential error
    Halted,
    /// A rate-limit retry whose action was already satisfied or replaced
    Outdated,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Busy => "busy",
            Self::Speaking => "speaking",
            Self::Duplicate => "scene unchanged",
            Self::WrongMode => "wrong mode",
            Self::BackingOff => "rate limited",
            Self::Halted => "halted",
            Self::Outdated => "retry outdated",
        };
        f.write_str(reason)
    }
}

/// Why a cycle failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleFailure {
    /// No frame could be captured
    #[error("capture unavailable: {0}")]
    Capture(String),

    /// The backend failed
    #[error(transparent)]
    Analysis(AnalysisError),
}

impl CycleFailure {
    /// Short sentence suitable for speaking to the user
    #[must_use]
    pub fn spoken(&self) -> String {
        match self {
            Self::Capture(_) => "The camera is not ready.".to_string(),
            Self::Analysis(e) => e.spoken(),
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A description was delivered
    Described(AnalysisResult),
    /// Nothing to do
    Skipped(SkipReason),
    /// The cycle failed
    Failed(CycleFailure),
    /// A mode switch or forced cycle replaced this one; its result was dropped
    Superseded,
}

/// Progress published for the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A new mode became active
    ModeChanged(Mode),
    /// A cycle began
    Started {
        /// Active mode
        mode: Mode,
        /// What started it
        trigger: CycleTrigger,
    },
    /// Text so far
    Partial {
        /// Active mode
        mode: Mode,
        /// Cumulative text
        text: String,
    },
    /// A supplementary lookup is running
    Enriching {
        /// Active mode
        mode: Mode,
    },
    /// A description was delivered
    Described(AnalysisResult),
    /// A cycle did nothing
    Skipped {
        /// Mode of the cycle
        mode: Mode,
        /// What started it
        trigger: CycleTrigger,
        /// Why it was skipped
        reason: SkipReason,
    },
    /// A cycle failed
    Failed {
        /// Mode of the cycle
        mode: Mode,
        /// What started it
        trigger: CycleTrigger,
        /// What went wrong
        failure: CycleFailure,
    },
    /// Guidance failures reached the retry ceiling
    StallWarning {
        /// Consecutive failures
        retries: u32,
    },
    /// A rate-limited action will be retried
    RetryScheduled {
        /// Mode of the retried cycle
        mode: Mode,
        /// 1-based retry number
        attempt: u32,
        /// Delay before the retry
        after: Duration,
    },
}

/// Bookkeeping for one mode's loop
#[derive(Debug, Default)]
struct ModeState {
    last_fingerprint: Option<Fingerprint>,
    last_success: Option<Instant>,
    retries: u32,
    backoff_until: Option<Instant>,
    /// Bumped by user actions and successes; pending retries from an older
    /// generation are dropped
    retry_generation: u64,
}

struct State {
    mode: Mode,
    epoch: u64,
    /// Cycle currently allowed to apply its result
    busy: Option<u64>,
    next_cycle: u64,
    cache: ResultCache,
    history: History,
    narration: ModeState,
    guidance: ModeState,
    /// Stall baseline before the first guidance success
    guidance_since: Instant,
    guidance_halted: bool,
    paced_pending: bool,
    voice: VoiceSettings,
    timers: Vec<JoinHandle<()>>,
}

impl State {
    fn mode_state(&mut self, mode: Mode) -> &mut ModeState {
        match mode {
            Mode::Narration => &mut self.narration,
            Mode::Guidance => &mut self.guidance,
        }
    }

    fn is_current(&self, epoch: u64, cycle: u64) -> bool {
        self.epoch == epoch && self.busy == Some(cycle)
    }
}

struct Inner {
    capturer: FrameCapturer,
    session: AnalysisSession,
    speech: Arc<dyn SpeechOutput>,
    config: ControllerConfig,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

/// Clears the busy flag when a cycle ends, however it ends
struct BusyGuard<'a> {
    inner: &'a Inner,
    cycle: u64,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if state.busy == Some(self.cycle) {
            state.busy = None;
        }
    }
}

/// Drives the capture/analysis/speech pipeline in the active mode
#[derive(Clone)]
pub struct ModeController {
    inner: Arc<Inner>,
}

impl ModeController {
    /// Create a controller in narration mode
    ///
    /// Returns the controller and the receiver for its events.
    #[must_use]
    pub fn new(
        capturer: FrameCapturer,
        session: AnalysisSession,
        speech: Arc<dyn SpeechOutput>,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let state = State {
            mode: Mode::Narration,
            epoch: 0,
            busy: None,
            next_cycle: 0,
            cache: ResultCache::new(config.cache_entries),
            history: History::new(config.history_entries),
            narration: ModeState::default(),
            guidance: ModeState::default(),
            guidance_since: Instant::now(),
            guidance_halted: false,
            paced_pending: false,
            voice: VoiceSettings::default(),
            timers: Vec::new(),
        };

        let inner = Arc::new(Inner {
            capturer,
            session,
            speech,
            config,
            state: Mutex::new(state),
            events,
        });

        (Self { inner }, events_rx)
    }

    /// Active mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    /// Consecutive failures in the active mode
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        let mut state = self.inner.lock();
        let mode = state.mode;
        state.mode_state(mode).retries
    }

    /// Whether a cycle is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.lock().busy.is_some()
    }

    /// Delivered descriptions, newest first
    #[must_use]
    pub fn history(&self) -> Vec<AnalysisResult> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Current voice settings
    #[must_use]
    pub fn voice(&self) -> VoiceSettings {
        self.inner.lock().voice.clone()
    }

    /// Replace the voice settings used for subsequent speech
    pub fn set_voice(&self, voice: VoiceSettings) {
        tracing::debug!(backend = ?voice.backend, voice = %voice.voice, speed = voice.speed.as_str(), "voice settings changed");
        self.inner.lock().voice = voice;
    }

    /// Describe the scene once (narration only)
    pub async fn trigger(&self) -> CycleOutcome {
        self.inner.run_cycle(Mode::Narration, CycleTrigger::Tap).await
    }

    /// Identify the object in view (narration only)
    pub async fn detect(&self) -> CycleOutcome {
        self.inner.run_cycle(Mode::Narration, CycleTrigger::Detect).await
    }

    /// Run a cycle now, overriding busy state, similarity and pending retries
    ///
    /// In guidance this also resumes a loop halted by a credential error.
    pub async fn force_refresh(&self) -> CycleOutcome {
        let (mode, resume) = {
            let mut state = self.inner.lock();
            let mode = state.mode;
            let mode_state = state.mode_state(mode);
            mode_state.retries = 0;
            mode_state.backoff_until = None;

            let resume = mode == Mode::Guidance && state.guidance_halted;
            state.guidance_halted = false;
            (mode, resume.then_some(state.epoch))
        };

        if let Some(epoch) = resume {
            tracing::info!("resuming guidance");
            self.inner.start_guidance_timers(epoch);
        }

        self.inner.run_cycle(mode, CycleTrigger::Manual).await
    }

    /// Switch modes, fully quiescing the previous one
    ///
    /// Returns `false` if `mode` is already active.
    pub fn switch_mode(&self, mode: Mode) -> bool {
        let (epoch, timers) = {
            let mut state = self.inner.lock();
            if state.mode == mode {
                return false;
            }

            state.mode = mode;
            state.epoch += 1;
            state.busy = None;
            state.paced_pending = false;
            state.guidance_halted = false;
            if mode == Mode::Guidance {
                state.guidance_since = Instant::now();
                state.guidance.retries = 0;
            }
            (state.epoch, std::mem::take(&mut state.timers))
        };

        for timer in timers {
            timer.abort();
        }
        self.inner.speech.cancel_all();

        tracing::info!(mode = %mode, epoch, "mode switched");
        self.inner.emit(ControllerEvent::ModeChanged(mode));

        // Announce first, then start the mode's own cycle
        let inner = Arc::clone(&self.inner);
        let entry = tokio::spawn(async move {
            inner.speak(mode.announcement().to_string(), Priority::High).await;
            if mode == Mode::Guidance {
                inner.run_cycle(Mode::Guidance, CycleTrigger::Start).await;
            }
        });
        self.inner.track(epoch, entry);

        if mode == Mode::Guidance {
            self.inner.start_guidance_timers(epoch);
        }

        true
    }

    /// Speak the most recent description again
    ///
    /// Returns `false` if nothing has been described yet.
    ///
    /// # Errors
    ///
    /// Returns error if no synthesizer could speak
    pub async fn repeat_last(&self) -> Result<bool> {
        let (text, voice) = {
            let state = self.inner.lock();
            match state.history.latest() {
                Some(latest) => (latest.text.clone(), state.voice.clone()),
                None => return Ok(false),
            }
        };

        self.inner
            .speech
            .speak(SpeechRequest::new(text, &voice, Priority::Normal))
            .await?;
        Ok(true)
    }

    /// Stop all timers and speech
    pub fn shutdown(&self) {
        let timers = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.busy = None;
            std::mem::take(&mut state.timers)
        };

        for timer in timers {
            timer.abort();
        }
        self.inner.speech.cancel_all();
        tracing::debug!("controller shut down");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: ControllerEvent) {
        // The UI may have gone away
        let _ = self.events.send(event);
    }

    /// Decide whether a cycle may start and claim the busy flag
    fn admit(&self, mode: Mode, trigger: CycleTrigger) -> std::result::Result<(u64, u64), SkipReason> {
        let mut state = self.lock();

        if state.mode != mode {
            return Err(SkipReason::WrongMode);
        }
        if mode == Mode::Guidance && state.guidance_halted && trigger != CycleTrigger::Manual {
            return Err(SkipReason::Halted);
        }
        let generation = state.mode_state(mode).retry_generation;
        if matches!(trigger, CycleTrigger::RateLimitRetry { generation: scheduled, .. } if scheduled != generation) {
            return Err(SkipReason::Outdated);
        }
        if trigger.respects_backoff()
            && state
                .mode_state(mode)
                .backoff_until
                .is_some_and(|until| Instant::now() < until)
        {
            return Err(SkipReason::BackingOff);
        }
        if state.busy.is_some() && !trigger.is_forced() {
            return Err(SkipReason::Busy);
        }
        if trigger.is_periodic() && self.speech.is_speaking() {
            return Err(SkipReason::Speaking);
        }

        if trigger.is_user_action() {
            state.mode_state(mode).retry_generation += 1;
        }

        state.next_cycle += 1;
        let cycle = state.next_cycle;
        if let Some(stuck) = state.busy.replace(cycle) {
            tracing::warn!(stuck, cycle, trigger = %trigger, "forced cycle supersedes in-flight cycle");
        }

        Ok((state.epoch, cycle))
    }

    /// One capture → fingerprint → cache → analyze → speak cycle
    async fn run_cycle(self: &Arc<Self>, mode: Mode, trigger: CycleTrigger) -> CycleOutcome {
        let (epoch, cycle) = match self.admit(mode, trigger) {
            Ok(ticket) => ticket,
            Err(reason) => {
                tracing::trace!(mode = %mode, trigger = %trigger, reason = %reason, "cycle skipped");
                if reason == SkipReason::Speaking {
                    self.pace_after_speech();
                }
                self.emit(ControllerEvent::Skipped { mode, trigger, reason });
                return CycleOutcome::Skipped(reason);
            }
        };
        let _busy = BusyGuard { inner: self, cycle };

        tracing::debug!(mode = %mode, trigger = %trigger, cycle, "cycle started");
        self.emit(ControllerEvent::Started { mode, trigger });

        let policy = self.config.policy(mode).for_trigger(trigger);

        let frame = match self.capturer.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                return self.fail(mode, trigger, epoch, cycle, &policy, CycleFailure::Capture(e.to_string()));
            }
        };
        let fingerprint = fingerprint(&frame);

        let cached = {
            let mut state = self.lock();
            if !state.is_current(epoch, cycle) {
                return CycleOutcome::Superseded;
            }

            let mode_state = state.mode_state(mode);
            let distance = mode_state.last_fingerprint.map(|last| last.distance(fingerprint));
            let since_success = mode_state.last_success.map(|at| at.elapsed());

            if distance.is_some_and(|d| policy.should_skip(d, since_success)) {
                tracing::debug!(mode = %mode, fingerprint = %fingerprint, "scene unchanged");
                self.emit(ControllerEvent::Skipped {
                    mode,
                    trigger,
                    reason: SkipReason::Duplicate,
                });
                return CycleOutcome::Skipped(SkipReason::Duplicate);
            }

            state.cache.get(fingerprint, mode).map(AnalysisResult::as_cached)
        };

        let result = if let Some(hit) = cached {
            tracing::debug!(mode = %mode, fingerprint = %fingerprint, "cache hit");
            hit
        } else {
            let params = AnalysisParams {
                mode,
                detect_object: trigger.detect_object(),
                enrich: policy.enrich,
            };

            let analyzed = self
                .session
                .analyze(&frame, fingerprint, params, |update| {
                    self.on_session_update(mode, epoch, cycle, update);
                })
                .await;

            match analyzed {
                Ok(result) => result,
                Err(e) => return self.fail(mode, trigger, epoch, cycle, &policy, CycleFailure::Analysis(e)),
            }
        };

        let voice = {
            let mut state = self.lock();
            if !state.is_current(epoch, cycle) {
                tracing::debug!(mode = %mode, cycle, "late result discarded");
                return CycleOutcome::Superseded;
            }

            if !result.was_cached {
                state.cache.put(fingerprint, mode, result.clone());
            }
            state.history.push(result.clone());

            let mode_state = state.mode_state(mode);
            mode_state.last_fingerprint = Some(fingerprint);
            mode_state.last_success = Some(Instant::now());
            mode_state.retries = 0;
            mode_state.backoff_until = None;
            mode_state.retry_generation += 1;

            state.voice.clone()
        };

        tracing::info!(mode = %mode, trigger = %trigger, cached = result.was_cached, "scene described");
        self.emit(ControllerEvent::Described(result.clone()));

        let request = SpeechRequest::new(result.text.clone(), &voice, Priority::Normal);
        match self.speech.speak(request).await {
            Ok(SpeechOutcome::Completed) if mode == Mode::Guidance => self.schedule_paced(epoch),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "description could not be spoken"),
        }

        CycleOutcome::Described(result)
    }

    /// Record a failure, announce it per policy and schedule any retry
    fn fail(
        self: &Arc<Self>,
        mode: Mode,
        trigger: CycleTrigger,
        epoch: u64,
        cycle: u64,
        policy: &ModePolicy,
        failure: CycleFailure,
    ) -> CycleOutcome {
        let (retries, generation) = {
            let mut state = self.lock();
            if !state.is_current(epoch, cycle) {
                return CycleOutcome::Superseded;
            }

            let mode_state = state.mode_state(mode);
            mode_state.retries += 1;
            if let CycleFailure::Analysis(AnalysisError::RateLimited { retry_after }) = &failure {
                mode_state.backoff_until = Some(Instant::now() + *retry_after);
            }
            (mode_state.retries, mode_state.retry_generation)
        };

        tracing::warn!(mode = %mode, trigger = %trigger, retries, error = %failure, "cycle failed");
        self.emit(ControllerEvent::Failed {
            mode,
            trigger,
            failure: failure.clone(),
        });

        match &failure {
            CycleFailure::Analysis(AnalysisError::RateLimited { retry_after }) => {
                let attempt = trigger.retry_attempt() + 1;
                match self.config.rate_limit.delay_for_attempt(attempt, *retry_after) {
                    Some(delay) => {
                        let retry = CycleTrigger::RateLimitRetry {
                            attempt,
                            detect_object: trigger.detect_object(),
                            generation,
                        };
                        self.schedule_retry(mode, epoch, retry, delay);
                        let wait = AnalysisError::RateLimited { retry_after: delay };
                        self.announce(epoch, wait.spoken());
                    }
                    None => self.announce(epoch, RETRIES_EXHAUSTED.to_string()),
                }
            }
            CycleFailure::Analysis(AnalysisError::InvalidCredential) => {
                if mode == Mode::Guidance {
                    self.halt_guidance(epoch);
                }
                self.announce(epoch, failure.spoken());
            }
            _ if policy.speak_errors => self.announce(epoch, failure.spoken()),
            _ if retries == policy.retry_ceiling => {
                self.emit(ControllerEvent::StallWarning { retries });
                self.announce(epoch, STALL_WARNING.to_string());
            }
            _ => {}
        }

        CycleOutcome::Failed(failure)
    }

    fn on_session_update(&self, mode: Mode, epoch: u64, cycle: u64, update: SessionUpdate) {
        if !self.lock().is_current(epoch, cycle) {
            return;
        }

        match update {
            SessionUpdate::Started => tracing::trace!(mode = %mode, "analysis accepted"),
            SessionUpdate::Partial(text) => self.emit(ControllerEvent::Partial { mode, text }),
            SessionUpdate::Enriching => self.emit(ControllerEvent::Enriching { mode }),
        }
    }

    /// Speak and wait, logging failures
    async fn speak(&self, text: String, priority: Priority) {
        let voice = self.lock().voice.clone();
        if let Err(e) = self.speech.speak(SpeechRequest::new(text, &voice, priority)).await {
            tracing::warn!(error = %e, "announcement could not be spoken");
        }
    }

    /// Speak at high priority without waiting
    ///
    /// The announcement belongs to `epoch`; a mode switch drops it even if it
    /// has not started speaking yet.
    fn announce(self: &Arc<Self>, epoch: u64, text: String) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.speak(text, Priority::High).await;
        });
        self.track(epoch, handle);
    }

    /// Keep a task so the next mode switch can abort it
    fn track(&self, epoch: u64, handle: JoinHandle<()>) {
        let mut state = self.lock();
        if state.epoch != epoch {
            drop(state);
            handle.abort();
            return;
        }

        state.timers.retain(|timer| !timer.is_finished());
        state.timers.push(handle);
    }

    /// Run a cycle after `delay`, unless the epoch ends first
    fn spawn_cycle(self: &Arc<Self>, epoch: u64, delay: Duration, mode: Mode, trigger: CycleTrigger) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run_cycle(mode, trigger).await;
        });
        self.track(epoch, handle);
    }

    fn schedule_retry(self: &Arc<Self>, mode: Mode, epoch: u64, retry: CycleTrigger, delay: Duration) {
        let attempt = retry.retry_attempt();
        tracing::info!(mode = %mode, attempt, delay_secs = delay.as_secs(), "rate limited, retry scheduled");
        self.emit(ControllerEvent::RetryScheduled {
            mode,
            attempt,
            after: delay,
        });
        self.spawn_cycle(epoch, delay, mode, retry);
    }

    /// Schedule the next guidance cycle shortly after speech ended
    fn schedule_paced(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.lock();
            state.paced_pending = false;
            if state.epoch != epoch || state.mode != Mode::Guidance || state.guidance_halted {
                return;
            }
        }

        self.spawn_cycle(epoch, self.config.timing.settle, Mode::Guidance, CycleTrigger::Paced);
    }

    /// Resume guidance once the current utterance ends
    fn pace_after_speech(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.lock();
            if state.paced_pending || state.mode != Mode::Guidance {
                return;
            }
            state.paced_pending = true;
            state.epoch
        };

        let inner = Arc::downgrade(self);
        self.speech.on_speech_end(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.schedule_paced(epoch);
            }
        }));
    }

    /// Start the periodic tick and the health check
    fn start_guidance_timers(self: &Arc<Self>, epoch: u64) {
        let timing = self.config.timing.clone();

        let inner = Arc::clone(self);
        let period = timing.period;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                inner.run_cycle(Mode::Guidance, CycleTrigger::Tick).await;
            }
        });
        self.track(epoch, ticker);

        let inner = Arc::clone(self);
        let health_interval = timing.health_interval;
        let health = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + health_interval, health_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                inner.health_check().await;
            }
        });
        self.track(epoch, health);
    }

    /// Force a cycle if guidance has stalled below the retry ceiling
    async fn health_check(self: &Arc<Self>) {
        let (since_success, retries) = {
            let state = self.lock();
            if state.mode != Mode::Guidance || state.guidance_halted {
                return;
            }
            // A success from an earlier guidance session says nothing about this one
            let baseline = state
                .guidance
                .last_success
                .map_or(state.guidance_since, |at| at.max(state.guidance_since));
            (baseline.elapsed(), state.guidance.retries)
        };

        let ceiling = self.config.guidance.retry_ceiling;
        if self.config.timing.should_force_cycle(since_success, retries, ceiling) {
            tracing::info!(stalled_secs = since_success.as_secs(), retries, "guidance stalled, forcing a cycle");
            self.run_cycle(Mode::Guidance, CycleTrigger::HealthCheck).await;
        }
    }

    /// Stop guidance timers until the user re-enters guidance or refreshes
    fn halt_guidance(&self, epoch: u64) {
        let timers = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }
            state.guidance_halted = true;
            std::mem::take(&mut state.timers)
        };

        tracing::warn!("guidance halted");
        for timer in timers {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_health_checks_and_manual_refresh_are_forced() {
        assert!(CycleTrigger::HealthCheck.is_forced());
        assert!(CycleTrigger::Manual.is_forced());
        assert!(!CycleTrigger::Tick.is_forced());
        assert!(!CycleTrigger::Tap.is_forced());
    }

    #[test]
    fn retries_remember_detect() {
        let retry = CycleTrigger::RateLimitRetry {
            attempt: 2,
            detect_object: true,
            generation: 0,
        };
        assert!(retry.detect_object());
        assert_eq!(retry.retry_attempt(), 2);
        assert_eq!(retry.to_string(), "retry-2");
        assert_eq!(CycleTrigger::Tap.retry_attempt(), 0);
        assert!(!retry.is_user_action());
        assert!(CycleTrigger::Tap.is_user_action());
    }

    #[test]
    fn failures_have_spoken_forms() {
        let capture = CycleFailure::Capture("no camera".into());
        assert_eq!(capture.spoken(), "The camera is not ready.");

        let limited = CycleFailure::Analysis(AnalysisError::RateLimited {
            retry_after: Duration::from_secs(60),
        });
        assert!(limited.spoken().contains("60 seconds"));
    }
}
