//! Log display helpers.
//!
//! Raw transactions can be hundreds of characters and carry enough
//! information to identify the spender; log lines show a truncated form.

use std::fmt;

/// Display a hex string as `head...tail` with its length.
pub struct RedactedHex<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 16 {
            write!(f, "{}...{} ({} chars)", &s[..8], &s[s.len() - 4..], s.len())
        } else {
            write!(f, "{}", s)
        }
    }
}

impl<'a> fmt::Debug for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Display an inbound text frame capped to a preview length.
///
/// Inbound text is untrusted and may not be ASCII; truncation is by
/// character, never mid-codepoint.
pub struct FramePreview<'a>(pub &'a str);

impl<'a> fmt::Display for FramePreview<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.chars().count() > 48 {
            let head: String = s.chars().take(45).collect();
            write!(f, "{head}...")
        } else {
            write!(f, "{s}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_hex_long() {
        let hx = "0100000001aabbccddeeff00112233445566778899";
        let shown = format!("{}", RedactedHex(hx));
        assert!(shown.starts_with("01000000"));
        assert!(shown.contains("..."));
        assert!(shown.contains("chars"));
    }

    #[test]
    fn test_redacted_hex_short_passthrough() {
        assert_eq!(format!("{}", RedactedHex("aabb")), "aabb");
    }

    #[test]
    fn test_frame_preview_caps_length() {
        let long = "x".repeat(200);
        let shown = format!("{}", FramePreview(&long));
        assert_eq!(shown.len(), 48);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn test_frame_preview_survives_multibyte_input() {
        let long = "é".repeat(100);
        let shown = format!("{}", FramePreview(&long));
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), 48);
    }
}
