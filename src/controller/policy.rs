//! Per-mode cycle policy and guidance timing

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CycleTrigger;
use crate::cache::{CACHE_MAX_ENTRIES, HISTORY_MAX_ENTRIES};
use crate::mode::Mode;

/// How a capture cycle behaves in one mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModePolicy {
    /// Maximum Hamming distance at which two frames count as the same scene
    pub similarity_threshold: u32,
    /// Skip frames similar to the last delivered one
    pub skip_similar: bool,
    /// Similar frames are re-analyzed once the last success is at least this old
    ///
    /// `None` skips similar frames regardless of age.
    pub min_refresh: Option<Duration>,
    /// Consecutive failures before guidance warns audibly
    pub retry_ceiling: u32,
    /// Speak every failure rather than only at the ceiling
    pub speak_errors: bool,
    /// Allow a supplementary lookup after completion
    pub enrich: bool,
}

impl ModePolicy {
    /// Single-shot narration
    #[must_use]
    pub const fn narration() -> Self {
        Self {
            similarity_threshold: 6,
            skip_similar: true,
            min_refresh: None,
            retry_ceiling: 3,
            speak_errors: true,
            enrich: true,
        }
    }

    /// Periodic guidance
    #[must_use]
    pub const fn guidance() -> Self {
        Self {
            similarity_threshold: 3,
            skip_similar: true,
            min_refresh: Some(Duration::from_secs(15)),
            retry_ceiling: 3,
            speak_errors: false,
            enrich: false,
        }
    }

    /// The policy applied to one cycle
    ///
    /// Detect, forced and retried cycles never skip similar frames.
    #[must_use]
    pub fn for_trigger(&self, trigger: CycleTrigger) -> Self {
        let skip_similar = self.skip_similar
            && matches!(
                trigger,
                CycleTrigger::Tap | CycleTrigger::Start | CycleTrigger::Tick | CycleTrigger::Paced
            );

        Self {
            skip_similar,
            ..self.clone()
        }
    }

    /// Whether a frame this close to the last delivered one should be skipped
    ///
    /// `since_success` is the age of the last successful cycle, if any.
    #[must_use]
    pub fn should_skip(&self, distance: u32, since_success: Option<Duration>) -> bool {
        if !self.skip_similar || distance > self.similarity_threshold {
            return false;
        }

        match (self.min_refresh, since_success) {
            (None, _) => true,
            (Some(min), Some(age)) => age < min,
            (Some(_), None) => false,
        }
    }
}

/// Guidance loop cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceTiming {
    /// Interval between cycle starts
    pub period: Duration,
    /// Interval between health checks
    pub health_interval: Duration,
    /// Age of the last success after which the loop counts as stalled
    pub stall_after: Duration,
    /// Pause between the end of a spoken result and the next cycle
    pub settle: Duration,
}

impl Default for GuidanceTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(4),
            health_interval: Duration::from_secs(10),
            stall_after: Duration::from_secs(12),
            settle: Duration::from_millis(500),
        }
    }
}

impl GuidanceTiming {
    /// Whether a health check should force an extra cycle
    #[must_use]
    pub fn should_force_cycle(&self, since_success: Duration, retries: u32, ceiling: u32) -> bool {
        since_success > self.stall_after && retries < ceiling
    }
}

/// Automatic retries after rate limiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Retries of the same action before a new user action is required
    pub max_retries: u32,
    /// Longest wait honored from a retry-after value
    pub max_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RateLimitPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once exhausted
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Duration) -> Option<Duration> {
        (attempt <= self.max_retries).then(|| retry_after.min(self.max_delay))
    }
}

/// Everything the controller needs to know about pacing and retention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Narration policy
    pub narration: ModePolicy,
    /// Guidance policy
    pub guidance: ModePolicy,
    /// Guidance cadence
    pub timing: GuidanceTiming,
    /// Rate-limit retries
    pub rate_limit: RateLimitPolicy,
    /// Result cache capacity
    pub cache_entries: usize,
    /// History capacity
    pub history_entries: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            narration: ModePolicy::narration(),
            guidance: ModePolicy::guidance(),
            timing: GuidanceTiming::default(),
            rate_limit: RateLimitPolicy::default(),
            cache_entries: CACHE_MAX_ENTRIES,
            history_entries: HISTORY_MAX_ENTRIES,
        }
    }
}

impl ControllerConfig {
    /// Policy for a mode
    #[must_use]
    pub const fn policy(&self, mode: Mode) -> &ModePolicy {
        match mode {
            Mode::Narration => &self.narration,
            Mode::Guidance => &self.guidance,
        }
    }
}

/// Serializable overrides for the guidance cadence, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOverrides {
    /// Guidance period
    pub period_ms: Option<u64>,
    /// Health-check interval
    pub health_interval_ms: Option<u64>,
    /// Stall window
    pub stall_after_ms: Option<u64>,
    /// Settle delay after speech
    pub settle_ms: Option<u64>,
    /// Minimum refresh age for similar guidance frames
    pub min_refresh_ms: Option<u64>,
    /// Guidance retry ceiling
    pub retry_ceiling: Option<u32>,
    /// Narration similarity threshold
    pub narration_threshold: Option<u32>,
    /// Guidance similarity threshold
    pub guidance_threshold: Option<u32>,
    /// Result cache capacity
    pub cache_entries: Option<usize>,
    /// History capacity
    pub history_entries: Option<usize>,
}

impl TimingOverrides {
    /// Apply overrides on top of the defaults
    #[must_use]
    pub fn apply(&self, mut config: ControllerConfig) -> ControllerConfig {
        let ms = Duration::from_millis;

        if let Some(v) = self.period_ms {
            config.timing.period = ms(v.max(1));
        }
        if let Some(v) = self.health_interval_ms {
            config.timing.health_interval = ms(v.max(1));
        }
        if let Some(v) = self.stall_after_ms {
            config.timing.stall_after = ms(v);
        }
        if let Some(v) = self.settle_ms {
            config.timing.settle = ms(v);
        }
        if let Some(v) = self.min_refresh_ms {
            config.guidance.min_refresh = Some(ms(v));
        }
        if let Some(v) = self.retry_ceiling {
            config.guidance.retry_ceiling = v;
            config.narration.retry_ceiling = v;
        }
        if let Some(v) = self.narration_threshold {
            config.narration.similarity_threshold = v.min(64);
        }
        if let Some(v) = self.guidance_threshold {
            config.guidance.similarity_threshold = v.min(64);
        }
        if let Some(v) = self.cache_entries {
            config.cache_entries = v.max(1);
        }
        if let Some(v) = self.history_entries {
            config.history_entries = v.max(1);
        }

        config
    }
}
