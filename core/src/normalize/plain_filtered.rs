use relay_protocol::NormalizedEvent;

use super::OutputNormalizer;
use super::incomplete_utf8_suffix;

/// Line-level denylist for providers that mix telemetry chatter into
/// stdout. Lines carrying any of these markers are dropped wholesale; the
/// survivors are re-joined so one pipe read stays one chunk.
const NOISE_MARKERS: [&str; 6] = [
    "[DEBUG]",
    "[INFO]",
    "Loaded cached credentials",
    "Flushing log events",
    "MCP STDERR",
    "Attempting to authenticate",
];

pub struct PlainFilteredNormalizer {
    pending: Vec<u8>,
}

impl PlainFilteredNormalizer {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn events_for(raw: &str) -> Vec<NormalizedEvent> {
        let kept: Vec<&str> = raw
            .lines()
            .filter(|line| !NOISE_MARKERS.iter().any(|marker| line.contains(marker)))
            .collect();
        let text = kept.join("\n");
        let text = text.trim();
        if text.is_empty() {
            Vec::new()
        } else {
            vec![NormalizedEvent::Chunk {
                text: text.to_string(),
            }]
        }
    }
}

impl OutputNormalizer for PlainFilteredNormalizer {
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
