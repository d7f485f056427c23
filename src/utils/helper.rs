use std::time::Duration;

/// Canonical form of a user-typed ticker: trimmed, upper-cased
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Truncate a string to a maximum length
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Parse an environment-style number, falling back to `default`
pub fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

/// Milliseconds as a `Duration`, clamped to at least one
pub fn duration_from_millis(millis: u64) -> Duration {
    Duration::from_millis(millis.max(1))
}
