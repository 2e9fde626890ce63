//! Pulls a single executable snippet out of a free-text model reply.

use regex::Regex;
use std::sync::OnceLock;

/// First fenced block, optionally tagged with a language name on the fence
/// line. The tag is only treated as a tag when it sits alone before a
/// newline; otherwise the text belongs to the snippet.
fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:[A-Za-z0-9_+#.-]+[ \t]*\r?\n)?(.*?)```").expect("fence regex")
    })
}

/// Extract the first fenced code block from `text`, or the whole text when no
/// fence is present (the reply is then treated as code verbatim).
///
/// Always returns a (possibly empty) string; later blocks are discarded.
pub fn extract_code(text: &str) -> String {
    if let Some(caps) = fence_re().captures(text) {
        return caps[1].trim().to_string();
    }
    text.trim().to_string()
}
