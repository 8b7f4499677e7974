//! Operating modes

use serde::{Deserialize, Serialize};

/// Which capture loop is active
///
/// Exactly one mode is active at a time. `Narration` describes the view once
/// per user trigger; `Guidance` narrates periodically for navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Single-shot description on user trigger
    #[default]
    Narration,
    /// Timer-driven narration for navigation
    Guidance,
}

impl Mode {
    /// Tag sent to the analysis backend
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Narration => "narration",
            Self::Guidance => "guidance",
        }
    }

    /// Spoken when the mode becomes active
    #[must_use]
    pub const fn announcement(self) -> &'static str {
        match self {
            Self::Narration => "Narration mode. Tap to describe what is in front of you.",
            Self::Guidance => "Guidance mode. I will describe your surroundings as you move.",
        }
    }

    /// Parse a user-supplied mode name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "narration" | "narrate" | "n" => Some(Self::Narration),
            "guidance" | "guide" | "g" => Some(Self::Guidance),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_names() {
        assert_eq!(Mode::parse("Guidance"), Some(Mode::Guidance));
        assert_eq!(Mode::parse(" narrate "), Some(Mode::Narration));
        assert_eq!(Mode::parse("g"), Some(Mode::Guidance));
        assert_eq!(Mode::parse("walk"), None);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Guidance).unwrap(), "\"guidance\"");
    }
}
