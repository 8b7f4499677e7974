//! Camera frame sources
//!
//! The camera itself is an OS capability; these adapters pull a still image
//! either from a snapshot file kept fresh by an external grabber, or by
//! running a capture command that writes one encoded frame to stdout.

use std::path::PathBuf;

use async_trait::async_trait;
use image::DynamicImage;

use crate::{Error, Result};

/// A live video feed that can hand out its current frame
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Whether the source is attached and ready to produce frames
    fn is_ready(&self) -> bool {
        true
    }

    /// Read the current frame at full resolution
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnavailable` if no frame can be read
    async fn read_frame(&self) -> Result<DynamicImage>;
}

/// Reads the most recent frame from an image file on disk
pub struct SnapshotSource {
    path: PathBuf,
}

impl SnapshotSource {
    /// Create a source reading from `path`
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl FrameSource for SnapshotSource {
    fn is_ready(&self) -> bool {
        self.path.is_file()
    }

    async fn read_frame(&self) -> Result<DynamicImage> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::CaptureUnavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;

        decode(&bytes)
    }
}

/// Runs a capture command and decodes the image it prints to stdout
///
/// For example `ffmpeg -loglevel error -f v4l2 -i /dev/video0 -frames:v 1 -f image2pipe -`.
pub struct CommandSource {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSource {
    /// Parse a whitespace-separated command line
    ///
    /// # Errors
    ///
    /// Returns error if the command line is empty or the program is not on `PATH`
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("camera command is empty".to_string()))?;

        let program = which::which(program)
            .map_err(|e| Error::Config(format!("camera command {program} not found: {e}")))?;

        Ok(Self {
            program,
            args: parts.map(ToString::to_string).collect(),
        })
    }
}

#[async_trait]
impl FrameSource for CommandSource {
    async fn read_frame(&self) -> Result<DynamicImage> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::CaptureUnavailable(format!("camera command failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CaptureUnavailable(format!(
                "camera command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        decode(&output.stdout)
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(Error::CaptureUnavailable("camera produced no data".to_string()));
    }

    image::load_from_memory(bytes)
        .map_err(|e| Error::CaptureUnavailable(format!("cannot decode frame: {e}")))
}
