/// Largest byte index at or before `max_bytes` that falls on a UTF-8
/// character boundary.
#[inline]
fn char_boundary_at(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Truncate to a byte budget with a visible marker (UTF-8 safe).
#[inline]
pub fn truncate_with_marker(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...[truncated]", &s[..char_boundary_at(s, max_len)])
    }
}

/// Truncate to a byte budget without a marker, borrowing (UTF-8 safe).
#[inline]
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        &s[..char_boundary_at(s, max_len)]
    }
}

/// Truncate to a character budget with a visible marker.
///
/// Counts characters, not bytes, so the cap is stable across scripts.
/// Used for captured results and task previews where limits are
/// specified in characters.
#[inline]
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars).collect();
    format!("{}...[truncated]", kept)
}

/// First segment of a UUID-style id for operator-facing output.
#[inline]
pub fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}
