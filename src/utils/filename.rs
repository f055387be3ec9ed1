//! Filename sanitization and truncation.
//!
//! Generated filenames come from untrusted post titles and URLs, so they are
//! scrubbed of characters that are invalid on Windows, Linux, or macOS while
//! preserving valid Unicode, then capped to a configured length with the
//! extension kept intact.

/// Whether a character can never appear in a filename. Windows has the
/// strictest rules, so its character set is scrubbed everywhere.
fn is_scrubbed(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

/// Device names Windows reserves outright; `COM1`-`COM9` and `LPT1`-`LPT9`
/// are matched separately.
const RESERVED_DEVICE_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

/// Whether the name (ignoring any extension) collides with a Windows device
/// name, case-insensitively.
fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    let upper = stem.to_ascii_uppercase();
    if RESERVED_DEVICE_NAMES.contains(&upper.as_str()) {
        return true;
    }
    match upper.as_bytes() {
        [b'C', b'O', b'M', digit] | [b'L', b'P', b'T', digit] => {
            digit.is_ascii_digit() && *digit != b'0'
        }
        _ => false,
    }
}

/// Sanitize a string for use as a filename on all platforms.
///
/// Runs of invalid characters become a single underscore, leading/trailing
/// spaces and dots are dropped, and reserved device names get a leading
/// underscore. An input that scrubs down to nothing becomes `"unnamed"`.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if is_scrubbed(c) {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }

    let out = out.trim_matches([' ', '.']);
    if out.is_empty() {
        return "unnamed".to_string();
    }
    if is_reserved_name(out) {
        return format!("_{out}");
    }
    out.to_string()
}

/// Cap a filename at `max_len` bytes, keeping the extension.
///
/// The base name is cut on a char boundary to make room for the extension.
/// When the extension alone exceeds the cap, its tail wins. A `max_len` of
/// zero disables truncation.
pub fn truncate_filename(filename: &str, max_len: usize) -> String {
    if max_len == 0 || filename.len() <= max_len {
        return filename.to_string();
    }

    let ext = match filename.rfind('.') {
        // A leading dot is a hidden-file prefix, not an extension.
        Some(idx) if idx > 0 => &filename[idx..],
        _ => "",
    };

    if ext.len() >= max_len {
        let mut start = ext.len() - max_len;
        while !ext.is_char_boundary(start) {
            start += 1;
        }
        return ext[start..].to_string();
    }

    let base = &filename[..filename.len() - ext.len()];
    let mut cut = max_len - ext.len();
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{ext}", &base[..cut])
}
