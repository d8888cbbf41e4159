use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Fixed-size digest of a pane capture
pub type ContentDigest = [u8; 32];

/// CSI/OSC escape sequences that survive `capture-pane -e` style output
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

/// Strip escapes, trailing whitespace and trailing blank lines.
///
/// Cursor redraws and right-padding change the raw bytes of a capture
/// without any new output; they must not register as a delta.
pub fn normalize_capture(content: &str) -> String {
    let stripped = RE_ANSI.replace_all(content, "");
    let mut lines: Vec<&str> = stripped.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

pub fn content_digest(content: &str) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(normalize_capture(content).as_bytes());
    hasher.finalize().into()
}
