//! On-device speech synthesis
//!
//! Shells out to whichever local synthesizer the host has. The child is
//! killed when the speaking future is dropped, which is how cancellation
//! reaches it. Text never appears where the engine could parse it as an
//! option: it goes through stdin, or after `--` for engines without stdin
//! input.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{DeviceSynthesizer, SpeechSpeed};
use crate::{Error, Result};

/// Words per minute at normal speed
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

/// Known local synthesizers, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    EspeakNg,
    Espeak,
    Say,
    SpdSay,
}

impl Engine {
    const ALL: [Self; 4] = [Self::EspeakNg, Self::Espeak, Self::Say, Self::SpdSay];

    const fn program(self) -> &'static str {
        match self {
            Self::EspeakNg => "espeak-ng",
            Self::Espeak => "espeak",
            Self::Say => "say",
            Self::SpdSay => "spd-say",
        }
    }

    /// Whether the engine reads the text from stdin
    const fn reads_stdin(self) -> bool {
        !matches!(self, Self::SpdSay)
    }

    /// Command-line arguments for speaking `text` at `speed`
    #[allow(clippy::cast_possible_truncation)]
    fn args(self, text: &str, speed: SpeechSpeed) -> Vec<String> {
        let wpm = (BASE_WORDS_PER_MINUTE * speed.rate()).round() as i32;
        match self {
            Self::EspeakNg | Self::Espeak => vec!["-s".into(), wpm.to_string(), "--stdin".into()],
            Self::Say => vec!["-r".into(), wpm.to_string(), "-f".into(), "-".into()],
            // spd-say takes a relative rate in -100..=100 and returns immediately without -w
            Self::SpdSay => {
                let rate = ((speed.rate() - 1.0) * 100.0).round() as i32;
                vec!["-w".into(), "-r".into(), rate.to_string(), "--".into(), text.into()]
            }
        }
    }
}

/// Speaks through a local command-line synthesizer
pub struct SystemSynthesizer {
    engine: Option<(Engine, PathBuf)>,
}

impl SystemSynthesizer {
    /// Find the first available synthesizer on `PATH`
    #[must_use]
    pub fn detect() -> Self {
        let engine = Engine::ALL
            .iter()
            .find_map(|engine| which::which(engine.program()).ok().map(|path| (*engine, path)));

        match &engine {
            Some((engine, path)) => {
                tracing::debug!(engine = engine.program(), path = %path.display(), "device synthesizer found");
            }
            None => tracing::warn!("no device speech synthesizer found on PATH"),
        }

        Self { engine }
    }

    /// Whether a synthesizer was found
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.engine.is_some()
    }
}

#[async_trait]
impl DeviceSynthesizer for SystemSynthesizer {
    async fn speak(&self, text: &str, speed: SpeechSpeed) -> Result<()> {
        let (engine, path) = self.engine.as_ref().ok_or_else(|| {
            Error::SynthesisUnavailable("no device speech synthesizer installed".to_string())
        })?;

        let failed = |e: std::io::Error| Error::SynthesisUnavailable(format!("{}: {e}", engine.program()));

        let stdin = if engine.reads_stdin() { Stdio::piped() } else { Stdio::null() };
        let mut child = tokio::process::Command::new(path)
            .args(engine.args(text, speed))
            .kill_on_drop(true)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(failed)?;

        if let Some(mut input) = child.stdin.take() {
            input.write_all(text.as_bytes()).await.map_err(failed)?;
            // Closing stdin tells the engine the text is complete
            drop(input);
        }

        let status = child.wait().await.map_err(failed)?;

        if !status.success() {
            return Err(Error::SynthesisUnavailable(format!(
                "{} exited with {status}",
                engine.program()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn espeak_rate_follows_speed() {
        let args = Engine::EspeakNg.args("hello", SpeechSpeed::Fast);
        assert_eq!(args, ["-s", "219", "--stdin"]);
    }

    #[test]
    fn spd_say_uses_relative_rate() {
        let args = Engine::SpdSay.args("hello", SpeechSpeed::Slow);
        assert_eq!(args, ["-w", "-r", "-25", "--", "hello"]);
    }

    #[test]
    fn leading_dash_text_is_never_an_option() {
        let text = "-5 degrees, icy path";
        for engine in Engine::ALL {
            let args = engine.args(text, SpeechSpeed::Normal);
            if engine.reads_stdin() {
                assert!(!args.iter().any(|a| a == text), "{engine:?} passed text as an argument");
            } else {
                let separator = args.iter().position(|a| a == "--").unwrap();
                assert_eq!(args[separator + 1..], [text]);
            }
        }
    }

    #[tokio::test]
    async fn missing_engine_is_unavailable() {
        let synth = SystemSynthesizer { engine: None };
        assert!(!synth.is_available());

        let err = synth.speak("hello", SpeechSpeed::Normal).await.unwrap_err();
        assert!(matches!(err, Error::SynthesisUnavailable(_)));
    }
}
