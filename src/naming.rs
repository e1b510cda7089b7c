//! Display names for converted items.
//!
//! Every item shows as `<stem>.<ext>`, where `ext` follows the current
//! target format:
//! - `IMG_0042.HEIC` converted to JPEG → "IMG_0042.jpg"
//! - the same item switched to WEBP → "IMG_0042.webp"
//! - renamed to `My Photo` → "My Photo.webp"
//!
//! Stems are sanitized the same way however they arrive: the characters
//! `<>:"/\|?*` are removed, surrounding whitespace is trimmed, and an empty
//! result becomes `image`.

use crate::types::OutputFormat;

/// Stem used when nothing usable is left after sanitizing.
pub const FALLBACK_STEM: &str = "image";

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Strip forbidden characters and surrounding whitespace.
pub fn sanitize_stem(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !FORBIDDEN.contains(c)).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Source file name without its final extension.
///
/// A leading dot is part of the name, not an extension separator.
pub fn source_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// Name shown for a freshly accepted source at `format`.
pub fn display_name(source_name: &str, format: OutputFormat) -> String {
    format!(
        "{}.{}",
        sanitize_stem(source_stem(source_name)),
        format.extension()
    )
}

/// User-proposed name, validated, with the target's extension appended.
///
/// A proposal that already ends in that extension is not given a second one.
pub fn validate_file_name(proposed: &str, format: OutputFormat) -> String {
    let stem = strip_extension(proposed.trim(), format);
    format!("{}.{}", sanitize_stem(stem), format.extension())
}

/// Carry a display name over to a new format, keeping any rename.
pub fn retarget(display: &str, from: OutputFormat, to: OutputFormat) -> String {
    format!("{}.{}", strip_extension(display, from), to.extension())
}

fn strip_extension(name: &str, format: OutputFormat) -> &str {
    let suffix_len = format.extension().len() + 1;
    if name.len() > suffix_len && name.is_char_boundary(name.len() - suffix_len) {
        let (stem, suffix) = name.split_at(name.len() - suffix_len);
        if suffix.starts_with('.') && suffix[1..].eq_ignore_ascii_case(format.extension()) {
            return stem;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_replaces_extension() {
        assert_eq!(display_name("IMG_0042.HEIC", OutputFormat::Jpeg), "IMG_0042.jpg");
        assert_eq!(display_name("photo.heif", OutputFormat::Png), "photo.png");
        assert_eq!(display_name("scan.jpeg", OutputFormat::Webp), "scan.webp");
    }

    #[test]
    fn display_name_only_strips_last_extension() {
        assert_eq!(display_name("trip.day1.heic", OutputFormat::Jpeg), "trip.day1.jpg");
    }

    #[test]
    fn display_name_without_extension() {
        assert_eq!(display_name("noext", OutputFormat::Png), "noext.png");
        assert_eq!(display_name(".hidden", OutputFormat::Png), ".hidden.png");
    }

    #[test]
    fn display_name_sanitizes_source() {
        assert_eq!(display_name("a:b?.heic", OutputFormat::Jpeg), "ab.jpg");
        assert_eq!(display_name("***.heic", OutputFormat::Jpeg), "image.jpg");
    }

    #[test]
    fn rename_appends_extension() {
        assert_eq!(validate_file_name("My Photo", OutputFormat::Webp), "My Photo.webp");
    }

    #[test]
    fn rename_empty_falls_back() {
        assert_eq!(validate_file_name("", OutputFormat::Jpeg), "image.jpg");
        assert_eq!(validate_file_name("   ", OutputFormat::Jpeg), "image.jpg");
        assert_eq!(validate_file_name("<>|", OutputFormat::Png), "image.png");
    }

    #[test]
    fn rename_strips_forbidden_characters() {
        assert_eq!(
            validate_file_name(r#" a<b>c:d"e/f\g|h?i*j "#, OutputFormat::Jpeg),
            "abcdefghij.jpg"
        );
    }

    #[test]
    fn rename_does_not_double_extension() {
        assert_eq!(validate_file_name("beach.jpg", OutputFormat::Jpeg), "beach.jpg");
        assert_eq!(validate_file_name("beach.JPG", OutputFormat::Jpeg), "beach.jpg");
        assert_eq!(validate_file_name("beach.png", OutputFormat::Jpeg), "beach.png.jpg");
    }

    #[test]
    fn rename_round_trip_is_stable() {
        let once = validate_file_name("My Photo", OutputFormat::Jpeg);
        assert_eq!(validate_file_name(&once, OutputFormat::Jpeg), once);
    }

    #[test]
    fn retarget_keeps_custom_stem() {
        assert_eq!(
            retarget("My Photo.jpg", OutputFormat::Jpeg, OutputFormat::Webp),
            "My Photo.webp"
        );
        assert_eq!(retarget("x.png", OutputFormat::Png, OutputFormat::Png), "x.png");
    }

    #[test]
    fn non_ascii_names_survive() {
        assert_eq!(display_name("фото.heic", OutputFormat::Jpeg), "фото.jpg");
        assert_eq!(validate_file_name("日本", OutputFormat::Png), "日本.png");
    }
}
