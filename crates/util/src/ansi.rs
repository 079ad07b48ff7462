//! Removal of terminal control sequences from captured output.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

static ANSI_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").expect("valid ansi regex")
});

/// Strips CSI, OSC and two-byte escape sequences.
pub fn strip_ansi(input: &[u8]) -> Vec<u8> {
    if !input.contains(&0x1b) {
        return input.to_vec();
    }
    ANSI_SEQUENCE.replace_all(input, &b""[..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_color_and_title_sequences() {
        assert_eq!(strip_ansi(b"\x1b[31mred\x1b[0m"), b"red");
        assert_eq!(strip_ansi(b"\x1b]0;title\x07text"), b"text");
        assert_eq!(strip_ansi(b"plain"), b"plain");
    }
}
