//! History codec: live UI messages <-> persisted chat turns.
//!
//! The PII list travels in message metadata while streaming and in `ChatTurn::pii` once
//! stored, so an answer restores to the same tokens on every load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::protocol::ProtocolEvent;
use crate::redaction::RenderedText;
use crate::schema::{ChatTurn, Conversation, Role};
use crate::store::ConversationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiPart {
    Text {
        text: String,
    },
    /// Reasoning, tool calls, files and anything else without plain text.
    #[serde(other)]
    Other,
}

/// A message as the chat client accumulates it from the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: UiRole,
    #[serde(default)]
    pub parts: Vec<UiPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UiMessage {
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: UiRole::User,
            parts: vec![UiPart::Text { text: text.into() }],
            metadata: None,
        }
    }

    /// Text parts joined in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                UiPart::Text { text } => Some(text.as_str()),
                UiPart::Other => None,
            })
            .collect()
    }

    /// `metadata.pii` when it is a list of strings.
    pub fn pii(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("pii"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Stable turn id for a message id that is not a UUID.
fn turn_id(message_id: &str) -> Uuid {
    Uuid::parse_str(message_id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, message_id.as_bytes()))
}

/// Maps live messages to storable turns.
///
/// System messages are dropped, as are messages with no text; `pii` is attached only when
/// the text references one of its values.
pub fn to_conversation_turns(messages: &[UiMessage]) -> Vec<ChatTurn> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                UiRole::User => Role::Question,
                UiRole::Assistant => Role::Answer,
                UiRole::System => return None,
            };
            let message = m.text();
            if message.is_empty() {
                return None;
            }
            let pii = m.pii();
            let date = m
                .metadata_str("date")
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(ChatTurn::new(turn_id(&m.id), date, role, message, pii))
        })
        .collect()
}

/// Rebuilds live messages from stored turns, e.g. to seed a reopened session.
pub fn from_conversation_turns(turns: &[ChatTurn]) -> Vec<UiMessage> {
    turns
        .iter()
        .map(|turn| {
            let mut metadata = serde_json::json!({
                "id": turn.id,
                "date": turn.date,
                "type": turn.role,
            });
            if let Some(pii) = &turn.pii {
                metadata["pii"] = serde_json::json!(pii);
            }
            UiMessage {
                id: turn.id.to_string(),
                role: match turn.role {
                    Role::Question => UiRole::User,
                    Role::Answer => UiRole::Assistant,
                },
                parts: vec![UiPart::Text {
                    text: turn.message.clone(),
                }],
                metadata: Some(metadata),
            }
        })
        .collect()
}

/// A stored turn prepared for display. Questions are shown verbatim; answers are tokenized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum TurnView {
    Question {
        id: Uuid,
        date: DateTime<Utc>,
        text: String,
    },
    Answer {
        id: Uuid,
        date: DateTime<Utc>,
        rendered: RenderedText,
        masked: String,
    },
}

pub fn render_turns(turns: &[ChatTurn], mask: &str) -> Vec<TurnView> {
    turns
        .iter()
        .map(|turn| match turn.role {
            Role::Question => TurnView::Question {
                id: turn.id,
                date: turn.date,
                text: turn.message.clone(),
            },
            Role::Answer => {
                let rendered = RenderedText::with_mask(&turn.message, turn.pii_values(), mask);
                TurnView::Answer {
                    id: turn.id,
                    date: turn.date,
                    masked: rendered.masked(),
                    rendered,
                }
            }
        })
        .collect()
}

/// Folds a stream of protocol events into one assistant [`UiMessage`].
#[derive(Debug, Clone)]
pub struct UiMessageAssembler {
    message: UiMessage,
    part_ids: Vec<String>,
    error: Option<String>,
    finished: bool,
}

impl Default for UiMessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl UiMessageAssembler {
    pub fn new() -> Self {
        Self {
            message: UiMessage {
                id: Uuid::new_v4().to_string(),
                role: UiRole::Assistant,
                parts: Vec::new(),
                metadata: None,
            },
            part_ids: Vec::new(),
            error: None,
            finished: false,
        }
    }

    pub fn apply(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::Start {
                message_id,
                message_metadata,
            } => {
                if let Some(id) = message_id {
                    self.message.id = id.clone();
                }
                if let Some(patch) = message_metadata {
                    self.merge_metadata(patch);
                }
            }
            ProtocolEvent::TextStart { id } => {
                self.part_ids.push(id.clone());
                self.message.parts.push(UiPart::Text {
                    text: String::new(),
                });
            }
            ProtocolEvent::TextDelta { id, delta } => {
                let pos = match self.part_ids.iter().rposition(|p| p == id) {
                    Some(pos) => pos,
                    None => {
                        self.part_ids.push(id.clone());
                        self.message.parts.push(UiPart::Text {
                            text: String::new(),
                        });
                        self.part_ids.len() - 1
                    }
                };
                if let Some(UiPart::Text { text }) = self.message.parts.get_mut(pos) {
                    text.push_str(delta);
                }
            }
            ProtocolEvent::MessageMetadata { message_metadata } => {
                self.merge_metadata(message_metadata);
            }
            ProtocolEvent::Error { error_text } => self.error = Some(error_text.clone()),
            ProtocolEvent::Finish => self.finished = true,
            ProtocolEvent::StartStep
            | ProtocolEvent::FinishStep
            | ProtocolEvent::TextEnd { .. }
            | ProtocolEvent::Unknown => {}
        }
    }

    fn merge_metadata(&mut self, patch: &Value) {
        let target = self
            .message
            .metadata
            .get_or_insert_with(|| Value::Object(Map::new()));
        merge_json(target, patch);
    }

    pub fn message(&self) -> &UiMessage {
        &self.message
    }

    pub fn into_message(self) -> UiMessage {
        self.message
    }

    pub fn text(&self) -> String {
        self.message.text()
    }

    pub fn pii(&self) -> Vec<String> {
        self.message.pii()
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.message
            .metadata_str("conversationId")
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Deep-merges `patch` into `target`; non-object values replace.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Appends one question/answer exchange to a conversation and saves the whole record.
/// Turns whose id is already recorded are not duplicated.
pub fn record_exchange(
    store: &dyn ConversationStore,
    conversation_id: Uuid,
    question: ChatTurn,
    answer: ChatTurn,
) -> StoreResult<Conversation> {
    let mut conversation = store
        .get(conversation_id)?
        .unwrap_or_else(|| Conversation::new(conversation_id));
    for turn in [question, answer] {
        if !conversation.turn_ids().contains(&turn.id) {
            conversation.push_turn(turn);
        }
    }
    conversation.touch();
    store.save(&conversation)?;
    tracing::debug!(
        target: "veil::history",
        conversation_id = %conversation_id,
        turns = conversation.turns().len(),
        "Exchange recorded"
    );
    Ok(conversation)
}

/// Replaces a conversation with the given live messages. `None` when nothing maps to a turn.
pub fn save_ui_messages(
    store: &dyn ConversationStore,
    conversation_id: Uuid,
    messages: &[UiMessage],
) -> StoreResult<Option<Conversation>> {
    let turns = to_conversation_turns(messages);
    if turns.is_empty() {
        return Ok(None);
    }
    let conversation = Conversation::with_turns(conversation_id, turns);
    store.save(&conversation)?;
    Ok(Some(conversation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConversationStore;
    use serde_json::json;

    fn assistant(text: &str, metadata: Option<Value>) -> UiMessage {
        UiMessage {
            id: Uuid::new_v4().to_string(),
            role: UiRole::Assistant,
            parts: vec![UiPart::Text { text: text.into() }],
            metadata,
        }
    }

    #[test]
    fn system_messages_are_dropped() {
        let messages = vec![
            UiMessage {
                id: "sys".into(),
                role: UiRole::System,
                parts: vec![UiPart::Text { text: "be nice".into() }],
                metadata: None,
            },
            UiMessage::user(Uuid::new_v4().to_string(), "hello"),
        ];
        let turns = to_conversation_turns(&messages);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Question);
    }

    #[test]
    fn text_parts_are_concatenated_and_others_skipped() {
        let mut msg = assistant("Hello ", Some(json!({"pii": ["John Doe"]})));
        msg.parts.push(UiPart::Other);
        msg.parts.push(UiPart::Text { text: "$1!".into() });
        let turns = to_conversation_turns(&[msg]);
        assert_eq!(turns[0].message, "Hello $1!");
        assert_eq!(turns[0].pii, Some(vec!["John Doe".to_string()]));
    }

    #[test]
    fn empty_pii_is_not_attached() {
        let turns = to_conversation_turns(&[assistant("Hi", Some(json!({"pii": []})))]);
        assert!(turns[0].pii.is_none());
    }

    #[test]
    fn unreferenced_pii_is_not_attached() {
        let turns = to_conversation_turns(&[
            assistant("Nice to meet you.", Some(json!({"pii": ["John Doe"]}))),
            assistant("Hello $2", Some(json!({"pii": ["John Doe"]}))),
        ]);
        assert!(turns[0].pii.is_none());
        assert!(turns[1].pii.is_none());
    }

    #[test]
    fn non_uuid_ids_map_deterministically() {
        let a = to_conversation_turns(&[UiMessage::user("msg-1", "hi")]);
        let b = to_conversation_turns(&[UiMessage::user("msg-1", "hi")]);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn ui_parts_decode_unknown_kinds() {
        let msg: UiMessage = serde_json::from_value(json!({
            "id": "m1",
            "role": "assistant",
            "parts": [{"type": "step-start"}, {"type": "text", "text": "Hi $1", "state": "done"}],
            "metadata": {"pii": ["Ann"]}
        }))
        .unwrap();
        assert_eq!(msg.parts[0], UiPart::Other);
        assert_eq!(msg.text(), "Hi $1");
    }

    #[test]
    fn turns_round_trip_through_ui_messages() {
        let turns = vec![
            ChatTurn::question(Uuid::new_v4(), "My name is John Doe"),
            ChatTurn::answer(Uuid::new_v4(), "Hello $1!", vec!["John Doe".into()]),
        ];
        let back = to_conversation_turns(&from_conversation_turns(&turns));
        assert_eq!(back, turns);
    }

    #[test]
    fn questions_render_verbatim_answers_tokenized() {
        let turns = vec![
            ChatTurn::question(Uuid::new_v4(), "I am $1"),
            ChatTurn::answer(Uuid::new_v4(), "Hello $1", vec!["Ann".into()]),
        ];
        let views = render_turns(&turns, "###");
        match &views[0] {
            TurnView::Question { text, .. } => assert_eq!(text, "I am $1"),
            other => panic!("expected question, got {:?}", other),
        }
        match &views[1] {
            TurnView::Answer { rendered, masked, .. } => {
                assert_eq!(masked, "Hello ###");
                assert_eq!(rendered.token_count(), 1);
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[test]
    fn assembler_folds_events_and_merges_metadata() {
        let conversation_id = Uuid::new_v4();
        let mut asm = UiMessageAssembler::new();
        let events = vec![
            ProtocolEvent::Start {
                message_id: Some("resp-1".into()),
                message_metadata: Some(json!({
                    "type": "answer",
                    "conversationId": conversation_id,
                })),
            },
            ProtocolEvent::StartStep,
            ProtocolEvent::TextStart { id: "t".into() },
            ProtocolEvent::TextDelta { id: "t".into(), delta: "Hello ".into() },
            ProtocolEvent::TextDelta { id: "t".into(), delta: "$1!".into() },
            ProtocolEvent::TextEnd { id: "t".into() },
            ProtocolEvent::FinishStep,
            ProtocolEvent::pii_metadata(&["John Doe".into()]),
            ProtocolEvent::Finish,
        ];
        for e in &events {
            asm.apply(e);
        }
        assert!(asm.is_finished());
        assert_eq!(asm.message().id, "resp-1");
        assert_eq!(asm.text(), "Hello $1!");
        assert_eq!(asm.pii(), vec!["John Doe"]);
        assert_eq!(asm.conversation_id(), Some(conversation_id));
        assert_eq!(asm.message().metadata.as_ref().unwrap()["type"], "answer");
    }

    #[test]
    fn record_exchange_appends_and_does_not_duplicate() {
        let store = MemoryConversationStore::new();
        let id = Uuid::new_v4();
        let q = ChatTurn::question(Uuid::new_v4(), "hi");
        let a = ChatTurn::answer(Uuid::new_v4(), "hello", vec![]);
        record_exchange(&store, id, q.clone(), a.clone()).unwrap();
        let convo = record_exchange(&store, id, q, a).unwrap();
        assert_eq!(convo.turns().len(), 2);
        assert!(convo.check_consistency().is_ok());
    }

    #[test]
    fn saving_nothing_is_a_no_op() {
        let store = MemoryConversationStore::new();
        let saved = save_ui_messages(&store, Uuid::new_v4(), &[]).unwrap();
        assert!(saved.is_none());
        assert!(store.is_empty());
    }
}
