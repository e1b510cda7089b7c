//! User-facing messages and CLI output.
//!
//! Logs go through `tracing`; everything a user is meant to read is built
//! here. Each `format_*` function is pure and returns strings, with a
//! `print_*` wrapper for stdout.
//!
//! # Output Format
//!
//! ## Convert
//!
//! ```text
//! Please wait while we convert your images
//! Successfully converted 3 images to JPEG with quality 0.8
//!
//! 001 IMG_0001.jpg (812.4 KB)
//! 002 IMG_0002.jpg (790.1 KB)
//! 003 IMG_0003.jpg (1.2 MB)
//! ```
//!
//! ## Detect
//!
//! ```text
//! IMG_0001.HEIC: image/heic
//! really-a-jpeg.heic: image/jpeg (not HEIC/HEIF)
//! notes.txt: unknown
//! ```
//!
//! # Conversion messages
//!
//! The completion message depends on what started the run. A PNG target never
//! mentions quality; a format change names the format; a quality change names
//! the quality. "processed" replaces "converted" when the batch held inputs
//! that were not HEIC/HEIF.

use crate::imaging::Detection;
use crate::pipeline::{BatchSnapshot, ConversionTrigger, Notification};
use crate::types::{ConversionTarget, OutputFormat};

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Quality with at most two decimals and no trailing zeros: `0.8`, `0.75`, `1`.
pub fn format_quality(quality: f32) -> String {
    let fixed = format!("{:.2}", quality);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Human-readable byte size.
pub fn format_size(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

fn images(count: usize) -> String {
    if count == 1 {
        "1 image".to_string()
    } else {
        format!("{} images", count)
    }
}

// ============================================================================
// Conversion messages
// ============================================================================

pub fn conversion_message(
    count: usize,
    target: ConversionTarget,
    includes_non_heic: bool,
    trigger: ConversionTrigger,
) -> String {
    let verb = if includes_non_heic {
        "processed"
    } else {
        "converted"
    };
    let lead = format!("Successfully {} {}", verb, images(count));
    let format = target.format();
    let quality = format_quality(target.quality().value());

    if format == OutputFormat::Png {
        return format!("{} to PNG", lead);
    }
    match trigger {
        ConversionTrigger::Format => format!("{} to {}", lead, format),
        ConversionTrigger::Quality => format!("{} with quality {}", lead, quality),
        ConversionTrigger::Submit => format!("{} to {} with quality {}", lead, format, quality),
    }
}

pub fn start_message(trigger: ConversionTrigger) -> &'static str {
    match trigger {
        ConversionTrigger::Submit => "Please wait while we convert your images",
        ConversionTrigger::Format => "Please wait while we convert your images to the new format",
        ConversionTrigger::Quality => {
            "Please wait while we convert your images to the new quality"
        }
    }
}

/// One line per notification. `None` for notifications with nothing to say.
pub fn format_notification(notification: &Notification) -> Option<String> {
    match notification {
        Notification::BatchAccepted {
            excluded: 0, ..
        } => None,
        Notification::BatchAccepted {
            accepted,
            excluded,
            limit,
        } => Some(format!(
            "Too many files: added {}, left out {} (limit is {})",
            accepted, excluded, limit
        )),
        Notification::ConversionStarted { trigger, .. } => Some(start_message(*trigger).to_string()),
        Notification::ConversionComplete {
            succeeded: 0,
            failed,
            ..
        } => Some(format!("No images could be converted ({} failed)", failed)),
        Notification::ConversionComplete {
            trigger,
            target,
            succeeded,
            failed,
            includes_non_heic,
        } => {
            let message = conversion_message(*succeeded, *target, *includes_non_heic, *trigger);
            Some(match failed {
                0 => message,
                n => format!("{} ({} failed)", message, n),
            })
        }
        Notification::ItemFailed { name, reason, .. } => {
            Some(format!("Failed to convert {}: {}", name, reason))
        }
        Notification::StallRetry { name, attempt, .. } => Some(format!(
            "{} is taking longer than expected, retrying (attempt {})",
            name, attempt
        )),
        Notification::StallRetryExhausted { name, .. } => {
            Some(format!("{} stalled again and was skipped", name))
        }
    }
}

pub fn print_notification(notification: &Notification) {
    if let Some(line) = format_notification(notification) {
        println!("{}", line);
    }
}

// ============================================================================
// Batch summary
// ============================================================================

/// Items of a batch with their artifact sizes.
pub fn format_batch(snapshot: &BatchSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, item) in snapshot.items.iter().enumerate() {
        let line = match item.artifact_len {
            Some(len) => format!(
                "{} {} ({})",
                format_index(i + 1),
                item.display_name,
                format_size(len)
            ),
            None => format!("{} {} ({}%)", format_index(i + 1), item.display_name, item.progress),
        };
        lines.push(line);
    }
    lines
}

pub fn print_batch(snapshot: &BatchSnapshot) {
    for line in format_batch(snapshot) {
        println!("{}", line);
    }
}

// ============================================================================
// Detection
// ============================================================================

pub fn format_detection(name: &str, detection: &Detection) -> String {
    match (detection.actual_mime, detection.is_expected_container) {
        (Some(mime), true) => format!("{}: {}", name, mime),
        (Some(mime), false) => format!("{}: {} (not HEIC/HEIF)", name, mime),
        (None, _) => format!("{}: unknown", name),
    }
}
