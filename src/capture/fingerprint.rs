//! Perceptual fingerprints for near-duplicate frame detection

use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};

use super::Frame;

/// Side of the luminance grid the hash is computed on (8×8 = 64 bits)
const GRID: u32 = 8;

/// 64-bit mean-luminance hash of a frame
///
/// Each bit records whether one cell of an 8×8 downsample is brighter than
/// the image's mean luminance. Robust to noise and lighting drift, sensitive
/// to camera movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Wrap raw hash bits
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw hash bits
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Hash an image
    #[must_use]
    pub fn of_image(image: &DynamicImage) -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .hash_size(GRID, GRID)
            .to_hasher();

        let hash = hasher.hash_image(image);
        let bits = hash
            .as_bytes()
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));

        Self(bits)
    }

    /// Number of differing bits
    #[must_use]
    pub const fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Whether `other` is within `threshold` bits of this fingerprint
    #[must_use]
    pub const fn is_similar(self, other: Self, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Fingerprint a captured frame
#[must_use]
pub fn fingerprint(frame: &Frame) -> Fingerprint {
    Fingerprint::of_image(frame.image())
}
