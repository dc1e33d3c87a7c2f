//! UI message stream events and their server-sent-event framing.
//!
//! Each event is one JSON object tagged by `type`, sent as `data: <json>\n\n`. The stream is
//! terminated by `data: [DONE]`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::Role;

/// Response header announcing the UI message stream protocol.
pub const UI_MESSAGE_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_MESSAGE_STREAM_VERSION: &str = "v1";
/// Payload of the terminating frame.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProtocolEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    FinishStep,
    #[serde(rename_all = "camelCase")]
    MessageMetadata {
        message_metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
    Finish,
    /// Any event kind this crate does not model. Only produced when decoding.
    #[serde(other)]
    Unknown,
}

impl ProtocolEvent {
    pub fn start(metadata: &AnswerMetadata) -> Self {
        ProtocolEvent::Start {
            message_id: Some(metadata.id.to_string()),
            message_metadata: serde_json::to_value(metadata).ok(),
        }
    }

    pub fn pii_metadata(pii: &[String]) -> Self {
        ProtocolEvent::MessageMetadata {
            message_metadata: serde_json::json!({ "pii": pii }),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        ProtocolEvent::Error {
            error_text: text.into(),
        }
    }

    /// Stable kind name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::Start { .. } => "start",
            ProtocolEvent::StartStep => "start-step",
            ProtocolEvent::TextStart { .. } => "text-start",
            ProtocolEvent::TextDelta { .. } => "text-delta",
            ProtocolEvent::TextEnd { .. } => "text-end",
            ProtocolEvent::FinishStep => "finish-step",
            ProtocolEvent::MessageMetadata { .. } => "message-metadata",
            ProtocolEvent::Error { .. } => "error",
            ProtocolEvent::Finish => "finish",
            ProtocolEvent::Unknown => "unknown",
        }
    }

    /// False for pure lifecycle markers.
    pub fn is_content_bearing(&self) -> bool {
        !matches!(
            self,
            ProtocolEvent::StartStep | ProtocolEvent::FinishStep | ProtocolEvent::Finish
        )
    }
}

/// Metadata attached to the `start` event of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMetadata {
    pub id: Uuid,
    #[serde(with = "millis_rfc3339")]
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub role: Role,
    pub conversation_id: Uuid,
}

impl AnswerMetadata {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            date: Utc::now(),
            role: Role::Answer,
            conversation_id,
        }
    }
}

mod millis_rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// JSON payload for one event (the part after `data: `).
pub fn encode(event: &ProtocolEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// A complete SSE frame for one event.
pub fn frame(event: &ProtocolEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", encode(event)?))
}

pub fn done_frame() -> String {
    format!("data: {}\n\n", DONE_SENTINEL)
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    Data(String),
    Done,
}

/// Incremental decoder for server-sent events arriving in arbitrary chunks.
///
/// `data:` lines accumulate until the blank line that ends the event and are joined with
/// `\n`. Comments (`:`-prefixed lines) and other fields such as `event:` or `id:` are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseData> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            if let Some(data) = self.feed_line(&line) {
                out.push(data);
            }
        }
        out
    }

    /// Ends the stream: a trailing line without its newline and an event without its blank
    /// line are both dispatched.
    pub fn finish(&mut self) -> Option<SseData> {
        let rest = std::mem::take(&mut self.buffer);
        let flushed = if rest.is_empty() {
            None
        } else {
            self.feed_line(&rest)
        };
        flushed.or_else(|| self.dispatch())
    }

    fn feed_line(&mut self, line: &str) -> Option<SseData> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return self.dispatch();
        }
        let value = if line == "data" {
            ""
        } else {
            let value = line.strip_prefix("data:")?;
            value.strip_prefix(' ').unwrap_or(value)
        };
        match &mut self.data {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_string()),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseData> {
        let data = self.data.take()?;
        if data.trim() == DONE_SENTINEL {
            return Some(SseData::Done);
        }
        if data.is_empty() {
            return None;
        }
        Some(SseData::Data(data))
    }
}

/// Drains decodable text from `pending`, which collects raw body chunks.
///
/// Invalid bytes become U+FFFD; an incomplete sequence at the end stays buffered so the next
/// chunk can complete it.
pub fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(text) => {
                out.push_str(text);
                start = pending.len();
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[start..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_code_point_waits_for_next_chunk() {
        let bytes = "Stéphane".as_bytes();
        let mut pending = bytes[..3].to_vec();
        assert_eq!(take_utf8(&mut pending), "St");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[3..]);
        assert_eq!(take_utf8(&mut pending), "éphane");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_byte_keeps_trailing_partial_sequence() {
        let mask = "█".as_bytes();
        let mut pending = b"a\xffb".to_vec();
        pending.extend_from_slice(&mask[..2]);
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}b");
        assert_eq!(pending, mask[..2].to_vec());
        pending.extend_from_slice(&mask[2..]);
        assert_eq!(take_utf8(&mut pending), "█");
        assert!(pending.is_empty());
    }

    #[test]
    fn events_use_kebab_case_type_tags() {
        let delta = ProtocolEvent::TextDelta {
            id: "t1".into(),
            delta: "Hello".into(),
        };
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"type": "text-delta", "id": "t1", "delta": "Hello"})
        );
        assert_eq!(
            serde_json::to_value(ProtocolEvent::Finish).unwrap(),
            json!({"type": "finish"})
        );
        assert_eq!(
            serde_json::to_value(ProtocolEvent::error("boom")).unwrap(),
            json!({"type": "error", "errorText": "boom"})
        );
    }

    #[test]
    fn start_event_carries_answer_metadata() {
        let conversation_id = Uuid::new_v4();
        let meta = AnswerMetadata::new(conversation_id);
        let value = serde_json::to_value(ProtocolEvent::start(&meta)).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["messageId"], meta.id.to_string());
        assert_eq!(value["messageMetadata"]["type"], "answer");
        assert_eq!(value["messageMetadata"]["conversationId"], conversation_id.to_string());
        assert!(value["messageMetadata"]["date"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn pii_metadata_shape() {
        let value =
            serde_json::to_value(ProtocolEvent::pii_metadata(&["John Doe".into()])).unwrap();
        assert_eq!(
            value,
            json!({"type": "message-metadata", "messageMetadata": {"pii": ["John Doe"]}})
        );
    }

    #[test]
    fn unknown_kinds_decode_without_error() {
        let event: ProtocolEvent =
            serde_json::from_str(r#"{"type":"reasoning-delta","id":"r","delta":"x"}"#).unwrap();
        assert_eq!(event, ProtocolEvent::Unknown);
    }

    #[test]
    fn frames_and_decoder_agree_across_split_chunks() {
        let frame = frame(&ProtocolEvent::StartStep).unwrap();
        assert_eq!(frame, "data: {\"type\":\"start-step\"}\n\n");

        let mut decoder = SseDecoder::new();
        let (a, b) = frame.split_at(9);
        assert!(decoder.push(a).is_empty());
        assert_eq!(
            decoder.push(b),
            vec![SseData::Data("{\"type\":\"start-step\"}".into())]
        );
        assert_eq!(decoder.push(": keepalive\n\ndata:[DONE]\n\n"), vec![SseData::Done]);
    }

    #[test]
    fn multi_line_data_is_joined_per_event() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.push("event: message\nid: 7\ndata: {\"a\":\ndata: 1}\n\ndata: x\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseData::Data("{\"a\":\n1}".into()),
                SseData::Data("x".into()),
            ]
        );
        assert!(decoder.push("data: pending\n").is_empty());
        assert_eq!(decoder.finish(), Some(SseData::Data("pending".into())));
    }

    #[test]
    fn decoder_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: {\"a\":1}").is_empty());
        assert_eq!(decoder.finish(), Some(SseData::Data("{\"a\":1}".into())));
        assert_eq!(decoder.finish(), None);
    }
}
