//! Struggle context extraction with privacy gating.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}
fn default_max_snippet_chars() -> usize {
    300
}

/// Client privacy flags controlling what leaves the editor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_true")]
    pub send_code_snippet: bool,
    #[serde(default = "default_true")]
    pub send_file_path: bool,
    #[serde(default = "default_max_snippet_chars")]
    pub max_snippet_chars: usize,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            send_code_snippet: true,
            send_file_path: true,
            max_snippet_chars: default_max_snippet_chars(),
        }
    }
}

/// Code context attached to a trigger submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StruggleContext {
    pub file_key: String,
    /// Present only when `send_file_path` permits.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub language_id: Option<String>,
    /// +/- 2 lines around `line`, truncated to `max_snippet_chars`. Present
    /// only when `send_code_snippet` permits.
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub diagnostics_errors: Vec<String>,
}

impl StruggleContext {
    /// Assemble a context, applying privacy gates.
    ///
    /// `content` is the file text the snippet is cut from; `line` is
    /// 1-indexed.
    #[must_use]
    pub fn build(
        file_key: &str,
        file_path: Option<&str>,
        language_id: Option<&str>,
        content: Option<&str>,
        line: Option<u32>,
        diagnostics_errors: Vec<String>,
        privacy: &PrivacyConfig,
    ) -> Self {
        let snippet = if privacy.send_code_snippet {
            match (content, line) {
                (Some(text), Some(line)) => {
                    Some(snippet_around(text, line, 2, privacy.max_snippet_chars))
                }
                _ => None,
            }
        } else {
            None
        };

        Self {
            file_key: file_key.to_string(),
            file_path: if privacy.send_file_path {
                file_path.map(str::to_string)
            } else {
                None
            },
            language_id: language_id.map(str::to_string),
            snippet,
            line,
            diagnostics_errors,
        }
    }
}

/// Cut a window of `radius` lines either side of `line` (1-indexed) out of
/// `content`, truncated to `max_chars` on a char boundary.
#[must_use]
pub fn snippet_around(content: &str, line: u32, radius: u32, max_chars: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let center = (line.max(1) as usize - 1).min(lines.len() - 1);
    let start = center.saturating_sub(radius as usize);
    let end = (center + radius as usize + 1).min(lines.len());

    let mut snippet = lines[start..end].join("\n");
    if snippet.chars().count() > max_chars {
        snippet = snippet.chars().take(max_chars).collect();
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: &str = "line one\nline two\nline three\nline four\nline five\nline six";

    #[test]
    fn snippet_covers_two_lines_each_side() {
        let snippet = snippet_around(CONTENT, 3, 2, 300);
        assert_eq!(
            snippet,
            "line one\nline two\nline three\nline four\nline five"
        );
    }

    #[test]
    fn snippet_clamps_at_file_edges() {
        assert_eq!(snippet_around(CONTENT, 1, 2, 300), "line one\nline two\nline three");
        let tail = snippet_around(CONTENT, 6, 2, 300);
        assert_eq!(tail, "line four\nline five\nline six");
    }

    #[test]
    fn snippet_truncates_to_char_budget() {
        let snippet = snippet_around(CONTENT, 3, 2, 10);
        assert_eq!(snippet.chars().count(), 10);
    }

    #[test]
    fn snippet_handles_out_of_range_line() {
        let snippet = snippet_around(CONTENT, 999, 2, 300);
        assert!(snippet.contains("line six"));
    }

    #[test]
    fn privacy_flags_gate_path_and_snippet() {
        let privacy = PrivacyConfig {
            send_code_snippet: false,
            send_file_path: false,
            max_snippet_chars: 300,
        };
        let context = StruggleContext::build(
            "src/main.rs",
            Some("/home/dev/project/src/main.rs"),
            Some("rust"),
            Some(CONTENT),
            Some(3),
            vec!["E0308".to_string()],
            &privacy,
        );
        assert!(context.file_path.is_none());
        assert!(context.snippet.is_none());
        assert_eq!(context.language_id.as_deref(), Some("rust"));
        assert_eq!(context.diagnostics_errors.len(), 1);
    }

    #[test]
    fn permissive_privacy_includes_everything() {
        let context = StruggleContext::build(
            "src/main.rs",
            Some("/home/dev/project/src/main.rs"),
            Some("rust"),
            Some(CONTENT),
            Some(3),
            vec![],
            &PrivacyConfig::default(),
        );
        assert!(context.file_path.is_some());
        assert!(context.snippet.unwrap().contains("line three"));
    }
}
