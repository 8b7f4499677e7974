//! Result cache and description history

use std::collections::{HashMap, VecDeque};

use crate::analysis::AnalysisResult;
use crate::capture::Fingerprint;
use crate::mode::Mode;

/// Default maximum cache entries
pub const CACHE_MAX_ENTRIES: usize = 10;

/// Default maximum history entries
pub const HISTORY_MAX_ENTRIES: usize = 5;

/// Bounded (fingerprint, mode) → result cache
///
/// Avoids re-querying the backend for near-identical frames. Eviction is
/// FIFO by insertion order; with a working set this small recency tracking
/// buys nothing.
#[derive(Debug)]
pub struct ResultCache {
    entries: HashMap<(Fingerprint, Mode), AnalysisResult>,
    order: VecDeque<(Fingerprint, Mode)>,
    max_entries: usize,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CACHE_MAX_ENTRIES)
    }
}

impl ResultCache {
    /// Create a cache holding at most `max_entries` results
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a result for this exact fingerprint and mode
    #[must_use]
    pub fn get(&self, fingerprint: Fingerprint, mode: Mode) -> Option<&AnalysisResult> {
        self.entries.get(&(fingerprint, mode))
    }

    /// Store a result, evicting the oldest entry once over capacity
    ///
    /// Replacing an existing key keeps its original insertion position.
    pub fn put(&mut self, fingerprint: Fingerprint, mode: Mode, result: AnalysisResult) {
        let key = (fingerprint, mode);
        if self.entries.insert(key, result).is_some() {
            return;
        }

        self.order.push_back(key);
        while self.order.len() > self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                tracing::trace!(fingerprint = %oldest.0, mode = %oldest.1, "cache entry evicted");
            }
        }
    }

    /// Number of cached results
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Most-recent-first list of delivered descriptions, shared across modes
#[derive(Debug)]
pub struct History {
    entries: VecDeque<AnalysisResult>,
    max_entries: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_MAX_ENTRIES)
    }
}

impl History {
    /// Create a history holding at most `max_entries` results
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a result as the newest entry
    pub fn push(&mut self, result: AnalysisResult) {
        self.entries.push_front(result);
        self.entries.truncate(self.max_entries);
    }

    /// Newest entry
    #[must_use]
    pub fn latest(&self) -> Option<&AnalysisResult> {
        self.entries.front()
    }

    /// Entries, newest first
    pub fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.entries.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str, mode: Mode, bits: u64) -> AnalysisResult {
        AnalysisResult::new(text.to_string(), mode, Fingerprint::from_bits(bits))
    }

    #[test]
    fn returns_what_was_stored() {
        let mut cache = ResultCache::default();
        let fp = Fingerprint::from_bits(42);
        cache.put(fp, Mode::Narration, result("a chair", Mode::Narration, 42));

        assert_eq!(cache.get(fp, Mode::Narration).unwrap().text, "a chair");
    }

    #[test]
    fn never_crosses_modes() {
        let mut cache = ResultCache::default();
        let fp = Fingerprint::from_bits(42);
        cache.put(fp, Mode::Narration, result("a chair", Mode::Narration, 42));

        assert!(cache.get(fp, Mode::Guidance).is_none());
    }

    #[test]
    fn evicts_first_inserted() {
        let mut cache = ResultCache::new(10);
        for bits in 0..=10 {
            cache.put(
                Fingerprint::from_bits(bits),
                Mode::Guidance,
                result("scene", Mode::Guidance, bits),
            );
        }

        assert_eq!(cache.len(), 10);
        assert!(cache.get(Fingerprint::from_bits(0), Mode::Guidance).is_none());
        assert!(cache.get(Fingerprint::from_bits(1), Mode::Guidance).is_some());
        assert!(cache.get(Fingerprint::from_bits(10), Mode::Guidance).is_some());
    }

    #[test]
    fn replacing_keeps_position() {
        let mut cache = ResultCache::new(2);
        let a = Fingerprint::from_bits(1);
        let b = Fingerprint::from_bits(2);
        cache.put(a, Mode::Narration, result("old", Mode::Narration, 1));
        cache.put(b, Mode::Narration, result("b", Mode::Narration, 2));
        cache.put(a, Mode::Narration, result("new", Mode::Narration, 1));
        assert_eq!(cache.len(), 2);

        // `a` is still the oldest key
        cache.put(Fingerprint::from_bits(3), Mode::Narration, result("c", Mode::Narration, 3));
        assert!(cache.get(a, Mode::Narration).is_none());
        assert!(cache.get(b, Mode::Narration).is_some());
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let mut history = History::default();
        for i in 0..7 {
            let mode = if i % 2 == 0 { Mode::Narration } else { Mode::Guidance };
            history.push(result(&format!("scene {i}"), mode, i));
        }

        assert_eq!(history.len(), 5);
        let texts: Vec<_> = history.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["scene 6", "scene 5", "scene 4", "scene 3", "scene 2"]);
        assert_eq!(history.latest().unwrap().text, "scene 6");
    }
}
