//! Parameter types for encode operations.
//!
//! These structs describe *what* to produce, not *how*. They sit between the
//! pipeline (which decides the target) and the [`encode`](super::encode)
//! functions (which do the pixel work).
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality in `[0, 1]`. Validated on construction.
//! - [`PNG_QUALITY`]: The fixed, lossless-equivalent quality every PNG target uses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quality pinned for PNG targets. PNG is lossless, so the value only exists
/// to keep per-format bookkeeping uniform.
pub const PNG_QUALITY: Quality = Quality(1.0);

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("quality must be within 0.0..=1.0, got {0}")]
pub struct InvalidQuality(pub f32);

/// Quality setting for lossy image encoding (0.0 = worst, 1.0 = best).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Quality(f32);

impl Quality {
    pub fn new(value: f32) -> Result<Self, InvalidQuality> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidQuality(value))
        }
    }

    /// Like [`Quality::new`] but clamps out-of-range input instead of failing.
    /// NaN maps to the default.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self::default();
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// Quality on the 1–100 scale the JPEG and WEBP encoders take.
    pub fn percent(self) -> u8 {
        (self.0 * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(0.8)
    }
}

impl TryFrom<f32> for Quality {
    type Error = InvalidQuality;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for f32 {
    fn from(q: Quality) -> Self {
        q.0
    }
}
