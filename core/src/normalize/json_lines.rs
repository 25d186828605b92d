use relay_protocol::NormalizedEvent;
use serde::Deserialize;
use tracing::debug;

use super::OutputNormalizer;

/// Stream of newline-delimited JSON frames. The first `system`/`init`
/// frame carries the provider's own session id; `assistant` frames carry
/// text deltas; the trailing `result` frame signals success or failure.
/// Unparseable lines are logged and skipped, never fatal.
pub struct JsonLinesNormalizer {
    pending: Vec<u8>,
    correlated: bool,
}

#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl JsonLinesNormalizer {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            correlated: false,
        }
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<NormalizedEvent> {
        let trimmed = line.strip_suffix(b"\r").unwrap_or(line);
        if trimmed.is_empty() {
            return None;
        }
        let frame: Frame = match serde_json::from_slice(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("dropping unparseable frame: {err}");
                return Some(NormalizedEvent::Ignored);
            }
        };
        match frame.kind.as_str() {
            "system" if frame.subtype.as_deref() == Some("init") => {
                if self.correlated {
                    return Some(NormalizedEvent::Ignored);
                }
                self.correlated = true;
                frame
                    .session_id
                    .map(|id| NormalizedEvent::Correlation { id })
            }
            "assistant" => {
                let text: String = frame
                    .message
                    .into_iter()
                    .flat_map(|m| m.content)
                    .filter(|block| block.kind == "text")
                    .filter_map(|block| block.text)
                    .collect();
                if text.is_empty() {
                    Some(NormalizedEvent::Ignored)
                } else {
                    Some(NormalizedEvent::Chunk { text })
                }
            }
            "result" => {
                if frame.is_error.unwrap_or(false) {
                    let message = frame
                        .result
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "provider reported an error".to_string());
                    Some(NormalizedEvent::Error { message })
                } else {
                    Some(NormalizedEvent::Ignored)
                }
            }
            _ => Some(NormalizedEvent::Ignored),
        }
    }
}

impl OutputNormalizer for JsonLinesNormalizer {
    fn feed(&mut self, bytes: &[u8]) -> Vec<NormalizedEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(event) = self.handle_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<NormalizedEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let tail = std::mem::take(&mut self.pending);
        self.handle_line(&tail).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunks(events: Vec<NormalizedEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e {
                NormalizedEvent::Chunk { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_frame_yields_correlation_once() {
        let mut n = JsonLinesNormalizer::new();
        let events = n.feed(
            b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"abc\"}\n\
              {\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"def\"}\n",
        );
        let ids: Vec<String> = events
            .into_iter()
            .filter_map(|e| match e {
                NormalizedEvent::Correlation { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["abc".to_string()]);
    }

    #[test]
    fn correlation_precedes_chunks_in_stream_order() {
        let mut n = JsonLinesNormalizer::new();
        let events = n.feed(
            b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"t1\"}\n\
              {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"first\"}]}}\n\
              {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"second\"}]}}\n",
        );
        let meaningful: Vec<NormalizedEvent> = events
            .into_iter()
            .filter(|e| *e != NormalizedEvent::Ignored)
            .collect();
        assert_eq!(
            meaningful,
            vec![
                NormalizedEvent::Correlation {
                    id: "t1".to_string()
                },
                NormalizedEvent::Chunk {
                    text: "first".to_string()
                },
                NormalizedEvent::Chunk {
                    text: "second".to_string()
                },
            ]
        );
    }

    #[test]
    fn assistant_text_blocks_are_concatenated() {
        let mut n = JsonLinesNormalizer::new();
        let events = n.feed(
            b"{\"type\":\"assistant\",\"message\":{\"content\":[\
              {\"type\":\"text\",\"text\":\"Hello \"},\
              {\"type\":\"tool_use\",\"name\":\"Bash\"},\
              {\"type\":\"text\",\"text\":\"world\"}]}}\n",
        );
        assert_eq!(chunks(events), vec!["Hello world".to_string()]);
    }

    #[test]
    fn partial_lines_are_buffered_across_feeds() {
        let mut n = JsonLinesNormalizer::new();
        let first = n.feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",");
        assert!(chunks(first).is_empty());
        let second = n.feed(b"\"text\":\"split\"}]}}\n");
        assert_eq!(chunks(second), vec!["split".to_string()]);
    }

    #[test]
    fn malformed_lines_are_ignored_not_fatal() {
        let mut n = JsonLinesNormalizer::new();
        let events = n.feed(
            b"not json at all\n\
              {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}\n",
        );
        assert_eq!(chunks(events), vec!["ok".to_string()]);
    }

    #[test]
    fn error_result_maps_to_error_event() {
        let mut n = JsonLinesNormalizer::new();
        let events = n.feed(b"{\"type\":\"result\",\"is_error\":true,\"result\":\"quota exceeded\"}\n");
        assert_eq!(
            events,
            vec![NormalizedEvent::Error {
                message: "quota exceeded".to_string()
            }]
        );
    }

    #[test]
    fn finish_drains_an_unterminated_frame() {
        let mut n = JsonLinesNormalizer::new();
        assert!(n
            .feed(b"{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"tail\"}]}}")
            .is_empty());
        assert_eq!(chunks(n.finish()), vec!["tail".to_string()]);
    }
}
