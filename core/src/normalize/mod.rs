//! Protocol front-ends. Each provider writes stdout in its own dialect;
//! a normalizer turns raw bytes into [`NormalizedEvent`]s so the rest of
//! the pipeline never sees provider-specific framing.

mod json_lines;
mod plain_filtered;
mod plain_spinner;

pub use json_lines::JsonLinesNormalizer;
pub use plain_filtered::PlainFilteredNormalizer;
pub use plain_spinner::PlainSpinnerNormalizer;

use relay_protocol::NormalizedEvent;
use relay_protocol::OutputProtocol;

/// Stateful byte-stream translator. `feed` may be called with arbitrary
/// chunk boundaries; implementations buffer partial frames internally.
pub trait OutputNormalizer: Send {
    fn feed(&mut self, bytes: &[u8]) -> Vec<NormalizedEvent>;

    /// Drain whatever is still buffered once the stream has closed.
    fn finish(&mut self) -> Vec<NormalizedEvent>;
}

pub fn normalizer_for(protocol: OutputProtocol) -> Box<dyn OutputNormalizer> {
    match protocol {
        OutputProtocol::JsonLines => Box::new(JsonLinesNormalizer::new()),
        OutputProtocol::PlainFiltered => Box::new(PlainFilteredNormalizer::new()),
        OutputProtocol::PlainSpinner => Box::new(PlainSpinnerNormalizer::new()),
    }
}

/// Length of a trailing UTF-8 sequence that is still missing continuation
/// bytes. Pipe reads land on arbitrary boundaries, so lossy decoders must
/// hold these bytes back for the next feed instead of mangling a split
/// character into replacement characters.
pub(crate) fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A UTF-8 sequence is at most four bytes; anything further back is
    // either complete or genuinely invalid and left to lossy decoding.
    let floor = len.saturating_sub(4);
    for i in (floor..len).rev() {
        let byte = bytes[i];
        if byte < 0x80 {
            return 0;
        }
        if byte >= 0xc0 {
            let width = match byte {
                0xf0..=0xf7 => 4,
                0xe0..=0xef => 3,
                _ => 2,
            };
            return if len - i < width { len - i } else { 0 };
        }
        // Continuation byte, keep walking back to its lead byte.
    }
    0
}

#[cfg(test)]
mod tests {
    use super::incomplete_utf8_suffix;

    #[test]
    fn complete_text_has_no_held_suffix() {
        assert_eq!(incomplete_utf8_suffix(b""), 0);
        assert_eq!(incomplete_utf8_suffix(b"ascii"), 0);
        assert_eq!(incomplete_utf8_suffix("réponse".as_bytes()), 0);
    }

    #[test]
    fn split_sequences_are_held_back() {
        // "é" is c3 a9; only the lead byte has arrived.
        assert_eq!(incomplete_utf8_suffix(b"r\xc3"), 1);
        // Three of four bytes of a supplementary-plane character.
        let emoji = "🚀".as_bytes();
        assert_eq!(incomplete_utf8_suffix(&emoji[..3]), 3);
        // A braille glyph missing its last continuation byte.
        let braille = "⠋".as_bytes();
        assert_eq!(incomplete_utf8_suffix(&braille[..2]), 2);
    }

    #[test]
    fn stray_continuation_bytes_are_not_held() {
        // No lead byte in sight: invalid input, lossy decoding handles it.
        assert_eq!(incomplete_utf8_suffix(b"\x80\x80\x80\x80\x80"), 0);
    }
}
