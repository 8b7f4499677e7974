use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use lookout::analysis::AnalysisParams;
use lookout::capture::{FrameCapturer, SnapshotSource, fingerprint};
use lookout::controller::ControllerEvent;
use lookout::speech::{
    AudioPlayback, AudioSink, Priority, SpeechCoordinator, SpeechOutput, SpeechSpeed, SystemSynthesizer,
    SynthesisBackend,
};
use lookout::{Config, Mode, ModeController, SpeechRequest};

/// Lookout - Camera narration and hands-free guidance
#[derive(Parser)]
#[command(name = "lookout", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/lookout/config.toml)
    #[arg(short, long, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive session reading commands from stdin
    Run,
    /// Describe an image file once and print the result
    Describe {
        /// Image to describe
        image: PathBuf,
        /// Identify a single object instead of the whole scene
        #[arg(long)]
        detect: bool,
    },
    /// Speak text through the speech coordinator
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the speech output.")]
        text: String,
        /// Always use the on-device synthesizer
        #[arg(long)]
        device: bool,
    },
    /// Compare the fingerprints of two images
    Fingerprint {
        /// First image
        a: PathBuf,
        /// Second image
        b: PathBuf,
    },
}

/// Stands in for speakers when no output device could be opened
struct NoAudio(String);

#[async_trait]
impl AudioSink for NoAudio {
    async fn play(&self, _audio: Vec<u8>) -> lookout::Result<()> {
        Err(lookout::Error::Audio(self.0.clone()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,lookout=info",
        1 => "info,lookout=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(&config).await,
        Command::Describe { image, detect } => describe(&config, image, detect).await,
        Command::Say { text, device } => say(&config, &text, device).await,
        Command::Fingerprint { a, b } => compare(&config, &a, &b).await,
    }
}

/// Build the speech coordinator from configuration
fn speech_output(config: &Config) -> anyhow::Result<Arc<SpeechCoordinator>> {
    let remote = config.remote_synthesizer()?;

    let sink: Arc<dyn AudioSink> = match AudioPlayback::new() {
        Ok(playback) => Arc::new(playback),
        Err(e) => {
            tracing::warn!(error = %e, "audio output unavailable, remote speech disabled");
            Arc::new(NoAudio(e.to_string()))
        }
    };

    let device = SystemSynthesizer::detect();
    if !device.is_available() {
        tracing::warn!("no on-device speech engine found (espeak-ng, espeak, say, spd-say)");
    }

    Ok(Arc::new(SpeechCoordinator::new(remote, sink, Arc::new(device))))
}

/// Interactive session
async fn run_session(config: &Config) -> anyhow::Result<()> {
    let capturer = FrameCapturer::new(config.frame_source()?);
    let session = config.analysis_session()?;
    let speech = speech_output(config)?;

    let (controller, mut events) =
        ModeController::new(capturer, session, speech, config.controller.clone());
    controller.set_voice(config.speech.voice.clone());

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    tracing::info!("lookout ready - type a command (tap, detect, guidance, narration, repeat, history, refresh, quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        if !handle_command(&controller, line.trim()) {
            break;
        }
    }

    controller.shutdown();
    printer.abort();
    tracing::info!("lookout stopped");
    Ok(())
}

/// Dispatch one stdin command; returns `false` to quit
fn handle_command(controller: &ModeController, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').map_or((line, ""), |(c, a)| (c, a.trim()));

    match command {
        "" => {}
        "quit" | "exit" => return false,
        "tap" | "describe" => {
            let controller = controller.clone();
            tokio::spawn(async move {
                let outcome = controller.trigger().await;
                tracing::debug!(?outcome, "tap finished");
            });
        }
        "detect" => {
            let controller = controller.clone();
            tokio::spawn(async move {
                let outcome = controller.detect().await;
                tracing::debug!(?outcome, "detect finished");
            });
        }
        "refresh" => {
            let controller = controller.clone();
            tokio::spawn(async move {
                let outcome = controller.force_refresh().await;
                tracing::debug!(?outcome, "refresh finished");
            });
        }
        "repeat" => {
            let controller = controller.clone();
            tokio::spawn(async move {
                match controller.repeat_last().await {
                    Ok(true) => {}
                    Ok(false) => println!("nothing to repeat"),
                    Err(e) => tracing::warn!(error = %e, "repeat failed"),
                }
            });
        }
        "history" => {
            for (i, result) in controller.history().iter().enumerate() {
                let cached = if result.was_cached { " (cached)" } else { "" };
                println!(
                    "{:2}. [{}] {}{cached} {}",
                    i + 1,
                    result.timestamp.format("%H:%M:%S"),
                    result.mode,
                    result.text
                );
            }
        }
        "backend" => match SynthesisBackend::parse(arg) {
            Some(backend) => {
                let mut voice = controller.voice();
                voice.backend = backend;
                controller.set_voice(voice);
            }
            None => println!("usage: backend remote|device"),
        },
        "speed" => match SpeechSpeed::parse(arg) {
            Some(speed) => {
                let mut voice = controller.voice();
                voice.speed = speed;
                controller.set_voice(voice);
            }
            None => println!("usage: speed slow|normal|fast"),
        },
        "voice" if !arg.is_empty() => {
            let mut voice = controller.voice();
            voice.voice = arg.to_string();
            controller.set_voice(voice);
        }
        other => match Mode::parse(other) {
            Some(mode) => {
                if !controller.switch_mode(mode) {
                    println!("already in {mode} mode");
                }
            }
            None => println!("unknown command: {line}"),
        },
    }

    true
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::ModeChanged(mode) => println!("mode: {mode}"),
        ControllerEvent::Started { mode, trigger } => println!("[{mode}] {trigger}..."),
        ControllerEvent::Partial { text, .. } => println!("  … {text}"),
        ControllerEvent::Enriching { .. } => println!("  looking up details..."),
        ControllerEvent::Described(result) => {
            let cached = if result.was_cached { " (cached)" } else { "" };
            println!("[{}]{cached} {}", result.mode, result.text);
        }
        ControllerEvent::Skipped { mode, trigger, reason } => {
            tracing::debug!(mode = %mode, trigger = %trigger, reason = %reason, "cycle skipped");
        }
        ControllerEvent::Failed { mode, failure, .. } => println!("[{mode}] error: {failure}"),
        ControllerEvent::StallWarning { retries } => {
            println!("guidance stalled after {retries} failures - type refresh");
        }
        ControllerEvent::RetryScheduled { attempt, after, .. } => {
            println!("retry {attempt} in {}s", after.as_secs());
        }
    }
}

/// Describe one image file
async fn describe(config: &Config, image: PathBuf, detect: bool) -> anyhow::Result<()> {
    let session = config.analysis_session()?;
    let capturer = FrameCapturer::new(Arc::new(SnapshotSource::new(image)));

    let frame = capturer.capture().await?;
    let fp = fingerprint(&frame);
    tracing::debug!(fingerprint = %fp, dimensions = %frame.target_dimensions(), "frame captured");

    let params = AnalysisParams {
        detect_object: detect,
        ..AnalysisParams::for_mode(Mode::Narration)
    };

    let result = session
        .analyze(&frame, fp, params, |update| tracing::trace!(?update, "session update"))
        .await?;

    println!("{}", result.text);
    Ok(())
}

/// Speak text once
async fn say(config: &Config, text: &str, device: bool) -> anyhow::Result<()> {
    let speech = speech_output(config)?;

    let mut voice = config.speech.voice.clone();
    if device {
        voice.backend = SynthesisBackend::Device;
    }

    let outcome = speech.speak(SpeechRequest::new(text, &voice, Priority::Normal)).await?;
    tracing::info!(?outcome, "speech finished");
    Ok(())
}

/// Print the fingerprint distance between two images
async fn compare(config: &Config, a: &Path, b: &Path) -> anyhow::Result<()> {
    let capture = |path: &Path| FrameCapturer::new(Arc::new(SnapshotSource::new(path.to_path_buf())));

    let fa = fingerprint(&capture(a).capture().await?);
    let fb = fingerprint(&capture(b).capture().await?);
    let distance = fa.distance(fb);

    println!("{fa}  {}", a.display());
    println!("{fb}  {}", b.display());
    println!("distance: {distance}");
    for mode in [Mode::Narration, Mode::Guidance] {
        let threshold = config.controller.policy(mode).similarity_threshold;
        let verdict = if fa.is_similar(fb, threshold) { "similar" } else { "different" };
        println!("{mode} (threshold {threshold}): {verdict}");
    }

    Ok(())
}
