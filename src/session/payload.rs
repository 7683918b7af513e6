//! Classification of received data frames.

use serde::{Deserialize, Serialize};

use super::{Frame, SessionId};

/// How received frames are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Try JSON, fall back to text.
    #[default]
    Auto,
    /// JSON only; frames that do not decode are dropped.
    Json,
    /// Never decode.
    Text,
}

/// A classified message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    /// Text form, re-serializing JSON.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text.clone(),
        }
    }
}

/// A data frame received on a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub session_id: SessionId,
    pub payload: Payload,
}

impl MessageFormat {
    /// Classify raw bytes. `None` means the frame should be dropped.
    pub fn classify(self, bytes: &[u8]) -> Option<Payload> {
        match self {
            MessageFormat::Auto => Some(
                serde_json::from_slice(bytes)
                    .map(Payload::Json)
                    .unwrap_or_else(|_| Payload::Text(String::from_utf8_lossy(bytes).into_owned())),
            ),
            MessageFormat::Json => serde_json::from_slice(bytes).ok().map(Payload::Json),
            MessageFormat::Text => Some(Payload::Text(String::from_utf8_lossy(bytes).into_owned())),
        }
    }

    /// Classify a data frame. Control frames yield `None`.
    pub fn classify_frame(self, frame: &Frame) -> Option<Payload> {
        match frame {
            Frame::Text(text) => self.classify(text.as_bytes()),
            Frame::Binary(data) => self.classify(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_prefers_json() {
        let payload = MessageFormat::Auto.classify(br#"{"price": 10}"#).unwrap();
        assert_eq!(payload, Payload::Json(json!({"price": 10})));

        let payload = MessageFormat::Auto.classify(b"hello").unwrap();
        assert_eq!(payload, Payload::Text("hello".into()));
    }

    #[test]
    fn forced_json_drops_undecodable_frames() {
        assert!(MessageFormat::Json.classify(b"not json").is_none());
        assert!(MessageFormat::Json
            .classify_frame(&Frame::Binary(br#"[1,2]"#.to_vec()))
            .is_some());
    }

    #[test]
    fn text_never_decodes() {
        let payload = MessageFormat::Text.classify(br#"{"a":1}"#).unwrap();
        assert_eq!(payload, Payload::Text(r#"{"a":1}"#.into()));
        assert!(MessageFormat::Text.classify_frame(&Frame::Ping(vec![])).is_none());
    }
}
