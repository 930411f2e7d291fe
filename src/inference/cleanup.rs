//! Response text cleanup.
//!
//! Thinking models occasionally emit invisible unicode, exotic spacing and
//! stray escape characters that render badly in the game chat box.

use std::sync::LazyLock;

use regex::Regex;

static NEWLINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"  +").expect("valid regex"));
static PUNCTUATION_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s\-\.…]+$").expect("valid regex"));
static BLANK_LINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n").expect("valid regex"));

/// Clean model output for display in chat.
pub fn clean_response_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let normalized: String = text
        .chars()
        .filter(|c| !matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{feff}'))
        .map(|c| match c {
            '\u{00a0}' | '\u{2007}' | '\u{202f}' | '\u{2009}' | '\u{200a}' => ' ',
            '\u{2011}' => '-',
            other => other,
        })
        .collect();

    let text = strip_stray_backslashes(&normalized);
    let text = NEWLINE_RUNS.replace_all(&text, "\n\n");
    let text = SPACE_RUNS.replace_all(&text, " ");
    let text = PUNCTUATION_LINES.replace_all(&text, "");
    let text = BLANK_LINE_RUNS.replace_all(&text, "\n\n");

    text.trim().to_string()
}

/// Drop a backslash unless it is escaped or starts a recognised escape.
fn strip_stray_backslashes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == '\\' {
            let prev_is_backslash = i > 0 && chars[i - 1] == '\\';
            let next_is_escape = chars.get(i + 1).is_some_and(|n| {
                matches!(n, '\\' | 'n' | 'r' | 't' | '"' | '\'' | '[' | ']' | '{' | '}')
            });
            if !prev_is_backslash && !next_is_escape {
                continue;
            }
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_removes_zero_width() {
        assert_eq!(clean_response_text("he\u{200b}llo\u{feff}"), "hello");
    }

    #[test]
    fn test_clean_normalizes_spaces_and_hyphens() {
        assert_eq!(clean_response_text("a\u{00a0}b non\u{2011}stop"), "a b non-stop");
    }

    #[test]
    fn test_clean_collapses_whitespace() {
        assert_eq!(clean_response_text("one   two\n\n\n\nthree"), "one two\n\nthree");
    }

    #[test]
    fn test_clean_strips_stray_backslash() {
        assert_eq!(clean_response_text(r"it\'s a \zombie"), r"it\'s a zombie");
        assert_eq!(clean_response_text(r"path C:\\x"), r"path C:\\x");
    }

    #[test]
    fn test_clean_drops_ellipsis_lines() {
        assert_eq!(clean_response_text("Done!\n...\nBye"), "Done!\n\nBye");
    }

    #[test]
    fn test_clean_empty() {
        assert_eq!(clean_response_text(""), "");
        assert_eq!(clean_response_text("   "), "");
    }
}
