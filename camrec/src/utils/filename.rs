//! Segment file naming.
//!
//! The capture process names every segment after its local start time
//! (`2024-05-01_13-00-00.mkv`) inside a per-camera directory. Camera ids are
//! sanitized before they become directory names.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// strftime pattern of a segment file stem.
pub const SEGMENT_STEM_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitize a string for use as a single path component on every platform.
///
/// Control and reserved characters become `_` (runs collapse into one),
/// leading/trailing spaces and dots are trimmed, Windows device names get a
/// `_` prefix and an empty result becomes `unnamed`.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || WINDOWS_INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    let is_reserved = WINDOWS_RESERVED_NAMES
        .iter()
        .any(|reserved| upper == *reserved || upper.starts_with(&format!("{}.", reserved)));
    if is_reserved {
        return format!("_{}", trimmed);
    }

    trimmed.to_string()
}

/// Output template handed to ffmpeg's segment muxer (`-strftime 1`).
pub fn segment_output_template(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", SEGMENT_STEM_FORMAT, extension))
}

/// File name of a segment starting at `start`.
pub fn segment_file_name(start: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}.{}",
        start.with_timezone(&Local).format(SEGMENT_STEM_FORMAT),
        extension
    )
}

/// Parse the start time encoded in a segment file name.
///
/// Returns `None` for files that do not follow the segment naming scheme.
pub fn parse_segment_start(path: &Path) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;
    let naive = NaiveDateTime::parse_from_str(stem, SEGMENT_STEM_FORMAT).ok()?;
    // Ambiguous local times (DST fold) resolve to the earlier instant.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Whether `path` has the segment extension (case-insensitive).
pub fn has_segment_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_sanitize_camera_ids() {
        assert_eq!(sanitize_filename("front-door"), "front-door");
        assert_eq!(sanitize_filename("yard/east"), "yard_east");
        assert_eq!(sanitize_filename("a<>:\"b"), "a_b");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("  cam 1  "), "cam 1");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for input in ["yard/east", "CON", "  cam  ", "a??b"] {
            let once = sanitize_filename(input);
            assert_eq!(once, sanitize_filename(&once), "input: {}", input);
        }
    }

    #[test]
    fn test_segment_name_parses_back() {
        let start = Utc::now().with_nanosecond(0).unwrap();
        let name = segment_file_name(start, "mkv");
        let parsed = parse_segment_start(Path::new(&name)).unwrap();
        assert_eq!(parsed, start);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(parse_segment_start(Path::new("ffmpeg.log")).is_none());
        assert!(parse_segment_start(Path::new("2024-13-01_00-00-00.mkv")).is_none());
    }

    #[test]
    fn test_output_template() {
        let template = segment_output_template(Path::new("/srv/rec/gate"), "mkv");
        assert_eq!(
            template,
            PathBuf::from("/srv/rec/gate/%Y-%m-%d_%H-%M-%S.mkv")
        );
        assert!(has_segment_extension(Path::new("a.MKV"), "mkv"));
        assert!(!has_segment_extension(Path::new("a.log"), "mkv"));
    }
}
