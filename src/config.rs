//! Pipeline configuration module.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a user file overrides any subset of them.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [batch]
//! max_files = 30          # Items a batch may hold
//! chunk_size = 2          # Items transcoded at once
//! chunk_pause_ms = 100    # Pause between chunks
//!
//! [stall]
//! timeout_secs = 20       # Time an attempt gets before it counts as stalled
//! threshold = 90          # Progress (0-100) that exempts an attempt from the deadline
//! retries = 1             # Fresh attempts after a stall
//!
//! [defaults]
//! format = "jpeg"         # jpeg, png or webp
//! jpeg_quality = 0.8      # 0.0-1.0
//! webp_quality = 0.8      # 0.0-1.0
//!
//! [preferences]
//! path = "~/.heic-batch/preferences.toml"
//! ```
//!
//! ## Partial Configuration
//!
//! Config files are sparse. Override just the values you want:
//!
//! ```toml
//! [defaults]
//! format = "webp"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::Quality;
use crate::scheduler::SchedulerConfig;
use crate::stall::StallPolicy;
use crate::types::OutputFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Pipeline configuration loaded from `config.toml`.
///
/// All fields have sensible defaults. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Batch size and chunking.
    pub batch: BatchConfig,
    /// Stall deadline and retries.
    pub stall: StallConfig,
    /// Format and qualities used when no preferences are stored.
    pub defaults: DefaultsConfig,
    pub preferences: PreferencesConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_files == 0 {
            return Err(ConfigError::Validation(
                "batch.max_files must be at least 1".into(),
            ));
        }
        if self.batch.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "batch.chunk_size must be at least 1".into(),
            ));
        }
        if self.stall.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "stall.timeout_secs must be at least 1".into(),
            ));
        }
        if self.stall.threshold > 100 {
            return Err(ConfigError::Validation(
                "stall.threshold must be 0-100".into(),
            ));
        }
        for (key, value) in [
            ("defaults.jpeg_quality", self.defaults.jpeg_quality),
            ("defaults.webp_quality", self.defaults.webp_quality),
        ] {
            if Quality::new(value).is_err() {
                return Err(ConfigError::Validation(format!(
                    "{key} must be between 0.0 and 1.0"
                )));
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            chunk_size: self.batch.chunk_size,
            chunk_pause: Duration::from_millis(self.batch.chunk_pause_ms),
            stall: StallPolicy {
                timeout: Duration::from_secs(self.stall.timeout_secs),
                threshold: self.stall.threshold,
                retries: self.stall.retries,
            },
        }
    }

    /// Starting quality for a format. PNG has none to choose.
    pub fn default_quality(&self, format: OutputFormat) -> Quality {
        match format {
            OutputFormat::Jpeg => Quality::clamped(self.defaults.jpeg_quality),
            OutputFormat::Webp => Quality::clamped(self.defaults.webp_quality),
            OutputFormat::Png => crate::imaging::PNG_QUALITY,
        }
    }

    /// Preferences file with a leading `~/` expanded.
    pub fn preferences_path(&self) -> Option<PathBuf> {
        self.preferences.path.as_deref().map(expand_home)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Maximum number of items a batch may hold.
    pub max_files: usize,
    /// Items transcoded concurrently. Bounds peak memory.
    pub chunk_size: usize,
    pub chunk_pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_files: 30,
            chunk_size: crate::scheduler::DEFAULT_CHUNK_SIZE,
            chunk_pause_ms: crate::scheduler::DEFAULT_CHUNK_PAUSE.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StallConfig {
    pub timeout_secs: u64,
    /// Progress (0-100) at which a late attempt is allowed to finish.
    pub threshold: u8,
    pub retries: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        let policy = StallPolicy::default();
        Self {
            timeout_secs: policy.timeout.as_secs(),
            threshold: policy.threshold,
            retries: policy.retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    pub format: OutputFormat,
    pub jpeg_quality: f32,
    pub webp_quality: f32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            jpeg_quality: Quality::default().value(),
            webp_quality: Quality::default().value(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreferencesConfig {
    /// Where last-used format and qualities are kept. Omit to keep them in
    /// memory only.
    pub path: Option<String>,
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(PipelineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<PipelineConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, or stock defaults when no path is given.
///
/// An explicitly named file that does not exist is an error; a missing
/// default file is not.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = match path {
        Some(p) => Some(load_raw_config(p)?.ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", p.display()),
            ))
        })?),
        None => None,
    };
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# heic-batch Configuration
# ========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Batching
# ---------------------------------------------------------------------------
[batch]
# Maximum number of files a batch may hold. Extra files are left out.
max_files = 30

# Files converted at the same time. Decoded images are large, so this is
# what bounds peak memory.
chunk_size = 2

# Pause between chunks, in milliseconds.
chunk_pause_ms = 100

# ---------------------------------------------------------------------------
# Stall detection
# ---------------------------------------------------------------------------
[stall]
# Seconds a conversion attempt gets before it counts as stalled.
timeout_secs = 20

# Progress (0-100) at which a late attempt is left to finish anyway.
threshold = 90

# Fresh attempts granted after a stall. A further stall fails the file.
retries = 1

# ---------------------------------------------------------------------------
# Defaults (used when no preferences have been stored yet)
# ---------------------------------------------------------------------------
[defaults]
# Output format: "jpeg", "png" or "webp".
format = "jpeg"

# Encoding quality, 0.0 (smallest) to 1.0 (best). PNG is always lossless.
jpeg_quality = 0.8
webp_quality = 0.8

# ---------------------------------------------------------------------------
# Preferences
# ---------------------------------------------------------------------------
[preferences]
# File that remembers the last format and per-format quality.
# Omit to keep them for the current run only.
# path = "~/.heic-batch/preferences.toml"
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch.max_files, 30);
        assert_eq!(config.batch.chunk_size, 2);
        assert_eq!(config.batch.chunk_pause_ms, 100);
        assert_eq!(config.stall.timeout_secs, 20);
        assert_eq!(config.stall.threshold, 90);
        assert_eq!(config.stall.retries, 1);
        assert_eq!(config.defaults.format, OutputFormat::Jpeg);
        assert_eq!(config.preferences.path, None);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[defaults]
format = "webp"
"#;
        let config: PipelineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.format, OutputFormat::Webp);
        // Unspecified defaults preserved
        assert_eq!(config.defaults.webp_quality, 0.8);
        assert_eq!(config.batch.max_files, 30);
    }

    #[test]
    fn scheduler_config_from_file_values() {
        let toml = r#"
[batch]
chunk_size = 4
chunk_pause_ms = 0

[stall]
timeout_secs = 5
retries = 2
"#;
        let config: PipelineConfig = toml::from_str(toml).unwrap();
        let sched = config.scheduler_config();
        assert_eq!(sched.chunk_size, 4);
        assert!(sched.chunk_pause.is_zero());
        assert_eq!(sched.stall.timeout, Duration::from_secs(5));
        assert_eq!(sched.stall.threshold, 90);
        assert_eq!(sched.stall.retries, 2);
    }

    #[test]
    fn default_quality_per_format() {
        let mut config = PipelineConfig::default();
        config.defaults.jpeg_quality = 0.6;
        assert_eq!(config.default_quality(OutputFormat::Jpeg).value(), 0.6);
        assert_eq!(config.default_quality(OutputFormat::Webp).value(), 0.8);
        assert_eq!(config.default_quality(OutputFormat::Png).value(), 1.0);
    }

    #[test]
    fn preferences_path_expands_home() {
        let config = PipelineConfig {
            preferences: PreferencesConfig {
                path: Some("/tmp/prefs.toml".into()),
            },
            ..Default::default()
        };
        assert_eq!(config.preferences_path(), Some(PathBuf::from("/tmp/prefs.toml")));

        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/x.toml"), Path::new(&home).join("x.toml"));
        }
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_without_path_is_default() {
        assert_eq!(load_config(None).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[batch]
max_files = 10

[defaults]
jpeg_quality = 0.5
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.batch.max_files, 10);
        assert_eq!(config.defaults.jpeg_quality, 0.5);
        // Unspecified values should be defaults
        assert_eq!(config.batch.chunk_size, 2);
        assert_eq!(config.stall.timeout_secs, 20);
    }

    #[test]
    fn load_config_missing_explicit_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = load_config(Some(&tmp.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Toml(_))));
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn zero_chunk_size_rejected() {
        let mut config = PipelineConfig::default();
        config.batch.chunk_size = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("chunk_size"));
    }

    #[test]
    fn zero_max_files_rejected() {
        let mut config = PipelineConfig::default();
        config.batch.max_files = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn threshold_over_100_rejected() {
        let mut config = PipelineConfig::default();
        config.stall.threshold = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn quality_out_of_range_rejected() {
        let mut config = PipelineConfig::default();
        config.defaults.webp_quality = 1.5;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("defaults.webp_quality"));
    }

    #[test]
    fn validation_runs_through_load_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[stall]\ntimeout_secs = 0\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Validation(_))
        ));
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_scalar_override() {
        let base: toml::Value = toml::from_str("a = 1").unwrap();
        let overlay: toml::Value = toml::from_str("a = 2").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged.get("a").unwrap().as_integer(), Some(2));
    }

    #[test]
    fn merge_toml_preserves_base_keys() {
        let base = stock_defaults_value().unwrap();
        let overlay: toml::Value = toml::from_str("[batch]\nmax_files = 5").unwrap();
        let merged = merge_toml(base, overlay);
        let batch = merged.get("batch").unwrap();
        assert_eq!(batch.get("max_files").unwrap().as_integer(), Some(5));
        assert_eq!(batch.get("chunk_size").unwrap().as_integer(), Some(2));
        assert!(merged.get("stall").is_some());
    }

    // =========================================================================
    // Unknown key rejection tests
    // =========================================================================

    #[test]
    fn unknown_key_rejected() {
        let toml_str = r#"
[batch]
max_file = 30
"#;
        let result: Result<PipelineConfig, _> = toml::from_str(toml_str);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn unknown_section_rejected() {
        let result: Result<PipelineConfig, _> = toml::from_str("[stalls]\nretries = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_format_rejected() {
        let result: Result<PipelineConfig, _> = toml::from_str("[defaults]\nformat = \"gif\"\n");
        assert!(result.is_err());
    }

    // =========================================================================
    // Stock config tests
    // =========================================================================

    #[test]
    fn stock_config_parses_to_defaults() {
        let config: PipelineConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }
}
