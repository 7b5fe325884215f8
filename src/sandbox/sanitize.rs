/// Longest segment produced, leaving room for the uniqueness suffix
pub const MAX_SEGMENT_LEN: usize = 50;

/// Used whenever sanitization leaves nothing behind
pub const FALLBACK_NAME: &str = "project";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turns an arbitrary caller-supplied name into a safe directory segment
///
/// The output is never empty, contains only `[A-Za-z0-9_-]`, is at most
/// [`MAX_SEGMENT_LEN`] characters long and never matches a reserved device
/// name. Everything outside the allowed set (separators, dots, control
/// characters, non-ASCII) is folded into `-`.
pub fn sanitize(raw: Option<&str>) -> String {
    let raw = raw.unwrap_or_default();

    let mut out = String::with_capacity(raw.len().min(MAX_SEGMENT_LEN));
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let mut name = trim_separators(&out).to_string();
    if name.len() > MAX_SEGMENT_LEN {
        // ASCII only at this point, so byte truncation is safe
        name.truncate(MAX_SEGMENT_LEN);
        name = trim_separators(&name).to_string();
    }

    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    if is_reserved(&name) {
        name.insert(0, '_');
    }

    name
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c| c == '-' || c == '_')
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}
