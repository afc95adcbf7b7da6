use std::sync::OnceLock;

use regex::Regex;

pub(crate) const PATH_PLACEHOLDER: &str = "[path]";

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(/[^\s]+|[A-Za-z]:\\[^\s]+)").expect("path pattern is a valid regex")
    })
}

/// Returns at most `max_chars` characters of `text` and whether anything was cut.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Replaces filesystem-path-like substrings and caps the result at `max_chars`.
///
/// A trailing `...` marks a capped message.
pub fn redact_error_text(text: &str, max_chars: usize) -> String {
    let redacted = path_pattern().replace_all(text, PATH_PLACEHOLDER);
    let (mut out, truncated) = excerpt(&redacted, max_chars);
    if truncated {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_and_windows_paths_are_redacted() {
        let text = "Error: cannot open /home/alice/.claude/settings.json or C:\\Users\\bob\\x.txt";
        let out = redact_error_text(text, 1000);
        assert_eq!(out, "Error: cannot open [path] or [path]");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let (out, truncated) = excerpt("ééééé", 3);
        assert_eq!(out, "ééé");
        assert!(truncated);

        let (out, truncated) = excerpt("short", 10);
        assert_eq!(out, "short");
        assert!(!truncated);
    }

    #[test]
    fn long_messages_are_capped() {
        let text = "error ".repeat(400);
        let out = redact_error_text(&text, 1000);
        assert_eq!(out.chars().count(), 1003);
        assert!(out.ends_with("..."));
    }
}
