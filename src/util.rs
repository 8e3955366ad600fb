//! Shared utility functions used across the codebase.

use chrono::{DateTime, SecondsFormat, Utc};

/// Return the value of `$HOME`, falling back to `/root`.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    format_timestamp(Utc::now())
}

/// Fixed-width RFC3339 (millisecond precision, `Z` suffix) so stored
/// timestamps compare correctly as strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate `value` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Sanitize a string for use as a filename.
pub fn sanitize_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

/// Deduplicate and trim a list of tool names, preserving order.
pub fn sanitize_tool_list(tools: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tool in tools {
        let trimmed = tool.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_keeps_short_values() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll...");
    }

    #[test]
    fn timestamps_sort_as_strings() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert!(format_timestamp(early).ends_with('Z'));
    }

    #[test]
    fn sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("Daily report / EU"), "Daily_report___EU");
        assert_eq!(sanitize_filename("   "), "task");
    }

    #[test]
    fn sanitize_tool_list_deduplicates_and_trims() {
        let tools = vec![
            " Bash ".to_string(),
            "Read".to_string(),
            "Bash".to_string(),
            "".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(sanitize_tool_list(&tools), vec!["Bash", "Read"]);
    }
}
