use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// A single provider-agnostic event recovered from raw process output.
///
/// Normalizers turn protocol-specific frames into these; the orchestrator
/// routes them to the response buffer, the session store, or the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// The provider announced its native thread/session identifier.
    Correlation { id: String },
    /// A span of assistant response text, in stream order.
    Chunk { text: String },
    /// A provider-reported failure carried inside the output protocol.
    Error { message: String },
    /// A frame that carried no information the relay cares about.
    Ignored,
}

/// A coalesced unit of response text emitted by the response buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedIncrement {
    pub text: String,
    pub is_final: bool,
}

/// The sink protocol: everything a client sees for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TurnEvent {
    SessionCreated {
        session_id: String,
    },
    Response {
        content: String,
        is_final: bool,
    },
    Error {
        message: String,
    },
    Complete {
        exit_code: i32,
        is_new_session: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn turn_event_wire_shape() {
        let event = TurnEvent::Complete {
            exit_code: 0,
            is_new_session: true,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "type": "complete",
                "exitCode": 0,
                "isNewSession": true,
            })
        );
    }

    #[test]
    fn response_event_uses_camel_case_fields() {
        let event = TurnEvent::Response {
            content: "hi".to_string(),
            is_final: false,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"isFinal\":false"), "{json}");
    }
}
