//! Frame capture
//!
//! Pulls a still from the video source, downscales it so requests stay small,
//! and encodes it as a low-quality JPEG. The analysis model copes with
//! compression artifacts far better than it copes with latency.

mod fingerprint;
mod source;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

pub use fingerprint::{Fingerprint, fingerprint};
pub use source::{CommandSource, FrameSource, SnapshotSource};

use crate::{Error, Result};

/// Largest frame sent to the analysis backend
pub const MAX_DIMENSIONS: Dimensions = Dimensions {
    width: 400,
    height: 300,
};

/// JPEG quality for encoded frames (0-100)
pub const JPEG_QUALITY: u8 = 50;

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Dimensions {
    /// Create dimensions
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale down to fit within `max`, preserving aspect ratio
    ///
    /// Never upscales. Each side is at least one pixel.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn fit_within(self, max: Self) -> Self {
        if self.width <= max.width && self.height <= max.height {
            return self;
        }

        let scale = f64::min(
            f64::from(max.width) / f64::from(self.width),
            f64::from(max.height) / f64::from(self.height),
        );

        Self {
            width: ((f64::from(self.width) * scale).round() as u32).clamp(1, max.width),
            height: ((f64::from(self.height) * scale).round() as u32).clamp(1, max.height),
        }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A captured, downscaled and encoded camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    encoded: Vec<u8>,
    image: DynamicImage,
    captured_at: DateTime<Utc>,
    source: Dimensions,
    target: Dimensions,
}

impl Frame {
    /// Encoded JPEG bytes
    #[must_use]
    pub fn jpeg(&self) -> &[u8] {
        &self.encoded
    }

    /// Downscaled pixels the JPEG was encoded from
    #[must_use]
    pub const fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// When the frame was captured
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Dimensions of the camera frame
    #[must_use]
    pub const fn source_dimensions(&self) -> Dimensions {
        self.source
    }

    /// Dimensions after downscaling
    #[must_use]
    pub const fn target_dimensions(&self) -> Dimensions {
        self.target
    }

    /// Consume the frame, returning the encoded bytes
    #[must_use]
    pub fn into_jpeg(self) -> Vec<u8> {
        self.encoded
    }
}

/// Downscale and encode a raw camera image
///
/// # Errors
///
/// Returns `Error::CaptureUnavailable` if the image is empty (the feed has no
/// picture yet) or cannot be encoded
pub fn encode_frame(raw: &DynamicImage, max: Dimensions, quality: u8) -> Result<Frame> {
    let source = Dimensions::new(raw.width(), raw.height());
    if source.width == 0 || source.height == 0 {
        return Err(Error::CaptureUnavailable(
            "video source has no picture yet".to_string(),
        ));
    }

    let target = source.fit_within(max);
    let image = if target == source {
        raw.clone()
    } else {
        raw.resize_exact(target.width, target.height, FilterType::Triangle)
    };

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode_image(&image.to_rgb8())
        .map_err(|e| Error::CaptureUnavailable(format!("cannot encode frame: {e}")))?;

    Ok(Frame {
        encoded,
        image,
        captured_at: Utc::now(),
        source,
        target,
    })
}

/// Captures frames from a source
#[derive(Clone)]
pub struct FrameCapturer {
    source: Arc<dyn FrameSource>,
    max: Dimensions,
    quality: u8,
}

impl FrameCapturer {
    /// Create a capturer with the default size bound and quality
    #[must_use]
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            max: MAX_DIMENSIONS,
            quality: JPEG_QUALITY,
        }
    }

    /// Override the size bound and JPEG quality
    #[must_use]
    pub fn with_limits(mut self, max: Dimensions, quality: u8) -> Self {
        self.max = max;
        self.quality = quality.clamp(1, 100);
        self
    }

    /// Capture the current frame
    ///
    /// Encoding runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnavailable` if the source is not ready or the
    /// frame cannot be read or encoded
    pub async fn capture(&self) -> Result<Frame> {
        if !self.source.is_ready() {
            return Err(Error::CaptureUnavailable(
                "camera is not ready".to_string(),
            ));
        }

        let raw = self.source.read_frame().await?;
        let (max, quality) = (self.max, self.quality);

        let frame = tokio::task::spawn_blocking(move || encode_frame(&raw, max, quality))
            .await
            .map_err(|e| Error::CaptureUnavailable(format!("encoder task failed: {e}")))??;

        tracing::trace!(
            source = %frame.source,
            target = %frame.target,
            bytes = frame.encoded.len(),
            "frame captured"
        );

        Ok(frame)
    }
}
