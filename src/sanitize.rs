// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Filename and location sanitization for reconstructed files.
//!
//! Names come straight off the wire (URLs, SMB paths, MIME headers) and are untrusted. The
//! sanitized result never escapes the output directory, never contains characters that are
//! reserved on common filesystems, and never collides with a file that already exists.
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};

use crate::constants::{MAX_FILENAME_LENGTH, MAX_LOCATION_LENGTH};

pub const RESERVED_CHARS: [char; 7] = [':', '*', '?', '"', '<', '>', '|'];

const DEVICE_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const EXECUTABLE_EXTENSIONS: [&str; 17] = [
    "exe", "dll", "sys", "scr", "com", "cpl", "msi", "bat", "cmd", "ps1", "vbs", "js", "jar",
    "hta", "pif", "lnk", "wsf",
];

const UNNAMED: &str = "unnamed";

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn url_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Splits `name` into stem and extension. Names without a stem (".bashrc") have no extension.
pub fn split_extension(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
}

/// True for `CON`, `nul.txt`, `LPT3` and the other DOS device names, in any case.
pub fn is_reserved_device_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment).trim();
    DEVICE_NAMES
        .iter()
        .any(|device| device.eq_ignore_ascii_case(stem))
}

/// Appends `_` to filenames with a known executable extension.
pub fn defang_filename(filename: &str) -> String {
    match split_extension(filename) {
        Some((_, ext))
            if EXECUTABLE_EXTENSIONS
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)) =>
        {
            format!("{filename}_")
        }
        _ => filename.to_string(),
    }
}

fn truncate_preserving_extension(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    match split_extension(name) {
        Some((stem, ext)) if ext.chars().count() + 2 <= max => {
            let keep = max - ext.chars().count() - 1;
            let stem: String = stem.chars().take(keep).collect();
            format!("{stem}.{ext}")
        }
        _ => name.chars().take(max).collect(),
    }
}

fn is_allowed_name_char(c: char) -> bool {
    !RESERVED_CHARS.contains(&c) && !is_separator(c) && !c.is_control()
}

/// Filters an extension handed in by a carver or sniffer the same way filenames are filtered.
/// Returns `None` when nothing usable is left.
pub fn sanitize_extension(extension: &str) -> Option<String> {
    let cleaned: String = extension.chars().filter(|c| is_allowed_name_char(*c)).collect();
    let cleaned = cleaned.trim().trim_matches(['.', ' ']);
    (!cleaned.is_empty()).then(|| cleaned.chars().take(MAX_FILENAME_LENGTH / 2).collect())
}

fn sanitize_filename(
    filename: &str,
    sniffed_extension: Option<&str>,
    defang: bool,
) -> String {
    let decoded = url_decode(filename);
    let cleaned: String = decoded
        .chars()
        .filter(|c| is_allowed_name_char(*c))
        .collect();
    let mut name = cleaned
        .trim()
        .trim_start_matches('.')
        .trim_end_matches(['.', ' '])
        .to_string();
    if name.is_empty() {
        name = UNNAMED.to_string();
    }

    if let Some(ext) = sniffed_extension {
        match split_extension(&name) {
            None => name = format!("{name}.{ext}"),
            Some((stem, current)) if current.eq_ignore_ascii_case("octet-stream") => {
                name = format!("{stem}.{ext}");
            }
            Some(_) => {}
        }
    }

    if defang {
        name = defang_filename(&name);
    }
    // truncating can turn "AUXILIARY.txt" into "AUX.txt", so the device check comes after
    let name = truncate_preserving_extension(&name, MAX_FILENAME_LENGTH);
    if is_reserved_device_name(&name) {
        truncate_preserving_extension(&format!("_{name}"), MAX_FILENAME_LENGTH)
    } else {
        name
    }
}

fn neutralize_device_name(segment: &str) -> String {
    if is_reserved_device_name(segment) {
        format!("_{segment}")
    } else {
        segment.to_string()
    }
}

fn sanitize_location(location: &str) -> String {
    let decoded = url_decode(location);
    let cleaned: String = decoded
        .chars()
        .filter(|c| !RESERVED_CHARS.contains(c) && !c.is_control())
        .map(|c| if is_separator(c) { '/' } else { c })
        .collect();

    // dropping dot-only segments collapses both ".." and "/./"
    let segments: Vec<String> = cleaned
        .split('/')
        .map(|s| s.trim().trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .collect();

    // capping can cut the last segment down to a device name, and the "_" prefix can push the
    // location back over the cap, so repeat until both hold
    let mut location = segments.join("/");
    loop {
        let capped: String = location.chars().take(MAX_LOCATION_LENGTH).collect();
        let neutralized = capped
            .trim_end_matches(['/', '.', ' '])
            .split('/')
            .map(neutralize_device_name)
            .collect::<Vec<_>>()
            .join("/");
        if neutralized.chars().count() <= MAX_LOCATION_LENGTH {
            return neutralized;
        }
        location = neutralized;
    }
}

/// Sanitizes a (filename, location) pair as announced by a dissector.
///
/// Directory parts embedded in the filename move to the location. The sniffed extension is
/// applied when the filename has none or only a generic `octet-stream` suffix.
pub fn sanitize_filename_and_location(
    filename: &str,
    location: &str,
    sniffed_extension: Option<&str>,
    defang: bool,
) -> (String, String) {
    let (location, filename) = match filename.rfind(is_separator) {
        Some(idx) => {
            let dir = &filename[..idx];
            let location = if location.is_empty() {
                dir.to_string()
            } else {
                format!("{location}/{dir}")
            };
            (location, &filename[idx + 1..])
        }
        None => (location.to_string(), filename),
    };
    (
        sanitize_filename(filename, sniffed_extension, defang),
        sanitize_location(&location),
    )
}

/// Returns `path` if nothing exists there, otherwise the first free `name[n].ext` sibling.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNNAMED.to_string());
    let (stem, ext) = match split_extension(&file_name) {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file_name.as_str(), None),
    };
    let mut i: u64 = 1;
    loop {
        let candidate = match ext {
            Some(ext) => parent.join(format!("{stem}[{i}].{ext}")),
            None => parent.join(format!("{stem}[{i}]")),
        };
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}
