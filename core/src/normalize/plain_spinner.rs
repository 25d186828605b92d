use std::sync::LazyLock;

use relay_protocol::NormalizedEvent;
use regex_lite::Regex;

use super::OutputNormalizer;
use super::incomplete_utf8_suffix;

// CSI sequences, OSC sequences (BEL or ST terminated), and
// single-character escapes.
static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(
        "\u{1b}\\[[0-9;?]*[ -/]*[@-~]|\u{1b}\\][^\u{7}\u{1b}]*(\u{7}|\u{1b}\\\\)|\u{1b}[@-Z\\\\-_]",
    )
    .unwrap();
    re
});

/// Front-end for providers that decorate a TTY-oriented stream with ANSI
/// cursor control and a braille spinner. Everything decorative is stripped;
/// the surviving text is a chunk like any other. Live streaming for this
/// protocol is withheld upstream, so ordering inside a feed is all that
/// matters here.
pub struct PlainSpinnerNormalizer {
    pending: Vec<u8>,
}

impl PlainSpinnerNormalizer {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn events_for(raw: &str) -> Vec<NormalizedEvent> {
        let stripped = ANSI.replace_all(raw, "");
        let text: String = stripped
            .chars()
            .filter(|c| {
                let braille = ('\u{2800}'..='\u{28ff}').contains(c);
                let control = c.is_control() && *c != '\n';
                !braille && !control
            })
            .collect();
        if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![NormalizedEvent::Chunk { text }]
        }
    }
}

impl OutputNormalizer for PlainSpinnerNormalizer {
    fn feed(&mut self, bytes: &[u8]) -> Vec<NormalizedEvent> {
        self.pending.extend_from_slice(bytes);
        // Hold back a split multi-byte character for the next read.
        let cut = self.pending.len() - incomplete_utf8_suffix(&self.pending);
        let ready: Vec<u8> = self.pending.drain(..cut).collect();
        Self::events_for(&String::from_utf8_lossy(&ready))
    }

    fn finish(&mut self) -> Vec<NormalizedEvent> {
        let tail = std::mem::take(&mut self.pending);
        Self::events_for(&String::from_utf8_lossy(&tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn only_text(events: Vec<NormalizedEvent>) -> String {
        events
            .into_iter()
            .filter_map(|e| match e {
                NormalizedEvent::Chunk { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn csi_sequences_are_stripped() {
        let mut n = PlainSpinnerNormalizer::new();
        let events = n.feed(b"\x1b[2K\x1b[1Gworking\x1b[0m on it\n");
        assert_eq!(only_text(events), "working on it\n");
    }

    #[test]
    fn braille_spinner_glyphs_are_stripped() {
        let mut n = PlainSpinnerNormalizer::new();
        let events = n.feed("⠋ thinking ⠙\ndone".as_bytes());
        assert_eq!(only_text(events), " thinking \ndone");
    }

    #[test]
    fn carriage_returns_go_newlines_stay() {
        let mut n = PlainSpinnerNormalizer::new();
        let events = n.feed(b"line one\r\nline two\n");
        assert_eq!(only_text(events), "line one\nline two\n");
    }

    #[test]
    fn multibyte_char_split_across_reads_survives() {
        let mut n = PlainSpinnerNormalizer::new();
        let bytes = "réponse".as_bytes();
        // Split inside the two-byte "é".
        let mut text = only_text(n.feed(&bytes[..2]));
        text.push_str(&only_text(n.feed(&bytes[2..])));
        text.push_str(&only_text(n.finish()));
        assert_eq!(text, "réponse");
    }

    #[test]
    fn spinner_glyph_split_across_reads_is_still_stripped() {
        let mut n = PlainSpinnerNormalizer::new();
        let bytes = "⠋ done\n".as_bytes();
        // The three-byte braille glyph arrives one byte at a time.
        let mut text = only_text(n.feed(&bytes[..1]));
        text.push_str(&only_text(n.feed(&bytes[1..2])));
        text.push_str(&only_text(n.feed(&bytes[2..])));
        assert_eq!(text, " done\n");
    }

    #[test]
    fn pure_decoration_yields_no_events() {
        let mut n = PlainSpinnerNormalizer::new();
        assert!(n.feed("\x1b[2K⠧\r".as_bytes()).is_empty());
    }
}
