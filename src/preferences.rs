//! Last-used format and per-format quality.
//!
//! The pipeline reads preferences once at construction and writes them back
//! whenever the format or a quality changes. Storage is behind the
//! [`Preferences`] trait:
//!
//! | Adapter | Storage |
//! |---|---|
//! | [`TomlPreferences`] | a TOML file, created on first save |
//! | [`MemoryPreferences`] | process memory (tests, runs without a preferences file) |

use crate::imaging::Quality;
use crate::types::OutputFormat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PreferencesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// What gets remembered between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredPreferences {
    pub format: Option<OutputFormat>,
    pub jpeg_quality: Option<Quality>,
    pub webp_quality: Option<Quality>,
}

impl StoredPreferences {
    /// Quality last chosen for a lossy format.
    pub fn quality_for(&self, format: OutputFormat) -> Option<Quality> {
        match format {
            OutputFormat::Jpeg => self.jpeg_quality,
            OutputFormat::Webp => self.webp_quality,
            OutputFormat::Png => None,
        }
    }

    /// Remember `quality` for `format`. PNG has nothing to remember.
    pub fn set_quality(&mut self, format: OutputFormat, quality: Quality) {
        match format {
            OutputFormat::Jpeg => self.jpeg_quality = Some(quality),
            OutputFormat::Webp => self.webp_quality = Some(quality),
            OutputFormat::Png => {}
        }
    }
}

pub trait Preferences: Send + Sync {
    /// Stored values, or defaults when nothing was stored yet.
    fn load(&self) -> Result<StoredPreferences, PreferencesError>;

    fn save(&self, prefs: &StoredPreferences) -> Result<(), PreferencesError>;
}

/// Preferences kept in a TOML file.
pub struct TomlPreferences {
    path: PathBuf,
}

impl TomlPreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Preferences for TomlPreferences {
    fn load(&self) -> Result<StoredPreferences, PreferencesError> {
        if !self.path.exists() {
            return Ok(StoredPreferences::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    fn save(&self, prefs: &StoredPreferences) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string(prefs)?)?;
        debug!(path = %self.path.display(), "saved preferences");
        Ok(())
    }
}

/// Preferences that live only as long as the value.
#[derive(Default)]
pub struct MemoryPreferences {
    stored: Mutex<StoredPreferences>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(prefs: StoredPreferences) -> Self {
        Self {
            stored: Mutex::new(prefs),
        }
    }

    pub fn snapshot(&self) -> StoredPreferences {
        self.stored.lock().clone()
    }
}

impl Preferences for MemoryPreferences {
    fn load(&self) -> Result<StoredPreferences, PreferencesError> {
        Ok(self.snapshot())
    }

    fn save(&self, prefs: &StoredPreferences) -> Result<(), PreferencesError> {
        *self.stored.lock() = prefs.clone();
        Ok(())
    }
}
