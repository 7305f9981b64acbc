const FALLBACK_TITLE: &str = "New Chat";

/// Derive a conversation title from the first user message.
///
/// Uses the first non-empty line, strips surrounding quotes, and truncates on a
/// character boundary with a trailing `...`.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let cleaned = first_line.trim_matches('"').trim_matches('\'').trim();

    if cleaned.is_empty() {
        return FALLBACK_TITLE.to_string();
    }

    if cleaned.chars().count() > max_chars {
        let keep = max_chars.saturating_sub(3);
        let truncated: String = cleaned.chars().take(keep).collect();
        format!("{}...", truncated.trim_end())
    } else {
        cleaned.to_string()
    }
}
