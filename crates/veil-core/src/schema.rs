//! Chat turn, conversation record and inbound request shapes.
//!
//! A [`ChatTurn`] is the persisted unit of a conversation. Answer turns carry the generated
//! text in placeholder form (`$1`, `$2`, ...) together with the ordered list of detected PII
//! values; `$k` always denotes `pii[k - 1]`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::placeholder;

/// UTC timestamps only: `YYYY-MM-DDTHH:MM:SS`, optional fraction, literal `Z`.
static ISO_DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z$").expect("datetime regex")
});

/// Hyphenated 8-4-4-4-12 form only.
static HYPHENATED_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});

fn parse_uuid(s: &str) -> Option<Uuid> {
    if !HYPHENATED_UUID.is_match(s) {
        return None;
    }
    Uuid::parse_str(s).ok()
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if !ISO_DATETIME.is_match(s) {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Which side of the exchange a turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Question,
    Answer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Question => "question",
            Role::Answer => "answer",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "question" => Some(Role::Question),
            "answer" => Some(Role::Answer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub message: String,
    #[serde(alias = "type")]
    pub role: Role,
    /// Present only when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<Vec<String>>,
}

impl ChatTurn {
    pub fn question(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id,
            date: Utc::now(),
            message: message.into(),
            role: Role::Question,
            pii: None,
        }
    }

    /// Builds a turn, keeping `pii` only when `message` resolves at least one `$N` against it.
    pub fn new(
        id: Uuid,
        date: DateTime<Utc>,
        role: Role,
        message: impl Into<String>,
        pii: Vec<String>,
    ) -> Self {
        let message = message.into();
        let pii = referenced_pii(&message, pii);
        Self {
            id,
            date,
            message,
            role,
            pii,
        }
    }

    pub fn answer(id: Uuid, message: impl Into<String>, pii: Vec<String>) -> Self {
        Self::new(id, Utc::now(), Role::Answer, message, pii)
    }

    pub fn pii_values(&self) -> &[String] {
        self.pii.as_deref().unwrap_or(&[])
    }
}

/// `None` unless some placeholder in `message` has a value in `pii`.
fn referenced_pii(message: &str, pii: Vec<String>) -> Option<Vec<String>> {
    placeholder::placeholder_indices(message)
        .into_iter()
        .any(|n| n <= pii.len())
        .then_some(pii)
}

/// A persisted conversation: ordered turns plus the parallel id list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    turns: Vec<ChatTurn>,
    turn_ids: Vec<Uuid>,
}

impl Conversation {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            date: Utc::now(),
            turns: Vec::new(),
            turn_ids: Vec::new(),
        }
    }

    /// Reassembles a stored record as-is; callers check [`Conversation::check_consistency`].
    pub fn from_parts(
        id: Uuid,
        date: DateTime<Utc>,
        turns: Vec<ChatTurn>,
        turn_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id,
            date,
            turns,
            turn_ids,
        }
    }

    pub fn with_turns(id: Uuid, turns: Vec<ChatTurn>) -> Self {
        let mut conversation = Self::new(id);
        conversation.replace_turns(turns);
        conversation
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn turn_ids(&self) -> &[Uuid] {
        &self.turn_ids
    }

    pub fn into_turns(self) -> Vec<ChatTurn> {
        self.turns
    }

    pub fn push_turn(&mut self, turn: ChatTurn) {
        self.turn_ids.push(turn.id);
        self.turns.push(turn);
    }

    pub fn replace_turns(&mut self, turns: Vec<ChatTurn>) {
        self.turn_ids = turns.iter().map(|t| t.id).collect();
        self.turns = turns;
    }

    /// Stamps the record with the current time; called on every save.
    pub fn touch(&mut self) {
        self.date = Utc::now();
    }

    /// Checks `turn_ids[i] == turns[i].id` for every position.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.turn_ids.len() != self.turns.len() {
            return Err(format!(
                "{} turn ids for {} turns",
                self.turn_ids.len(),
                self.turns.len()
            ));
        }
        for (i, (id, turn)) in self.turn_ids.iter().zip(&self.turns).enumerate() {
            if *id != turn.id {
                return Err(format!("turn id mismatch at position {}", i));
            }
        }
        Ok(())
    }
}

/// A validated `POST /api/chat` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub message: String,
    pub role: Role,
    pub pii: Option<Vec<String>>,
    pub conversation_id: Option<Uuid>,
}

impl ChatRequest {
    /// Validates a raw request body. Every field problem is collected before returning.
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::form(format!("Invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let Some(obj) = value.as_object() else {
            return Err(ValidationError::form(format!(
                "Expected object, received {}",
                json_kind(value)
            )));
        };
        let mut errors = ValidationError::default();

        let id = match obj.get("id") {
            None | Some(Value::Null) => {
                errors.push_field("id", "Required");
                None
            }
            Some(Value::String(s)) => match parse_uuid(s) {
                Some(id) => Some(id),
                None => {
                    errors.push_field("id", "Invalid uuid");
                    None
                }
            },
            Some(other) => {
                errors.push_field("id", expected_string(other));
                None
            }
        };

        let date = match obj.get("date") {
            None | Some(Value::Null) => {
                errors.push_field("date", "Required");
                None
            }
            Some(Value::String(s)) => match parse_datetime(s) {
                Some(d) => Some(d),
                None => {
                    errors.push_field("date", "Invalid datetime");
                    None
                }
            },
            Some(other) => {
                errors.push_field("date", expected_string(other));
                None
            }
        };

        let message = match obj.get("message") {
            None | Some(Value::Null) => {
                errors.push_field("message", "Required");
                None
            }
            Some(Value::String(s)) if s.is_empty() => {
                errors.push_field("message", "String must contain at least 1 character(s)");
                None
            }
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                errors.push_field("message", expected_string(other));
                None
            }
        };

        let (role_key, role_value) = match obj.get("type") {
            Some(v) => ("type", Some(v)),
            None if obj.contains_key("role") => ("role", obj.get("role")),
            None => ("type", None),
        };
        let role = match role_value {
            None | Some(Value::Null) => {
                errors.push_field(role_key, "Required");
                None
            }
            Some(Value::String(s)) => match Role::parse(s) {
                Some(role) => Some(role),
                None => {
                    errors.push_field(
                        role_key,
                        format!(
                            "Invalid enum value. Expected 'answer' | 'question', received '{}'",
                            s
                        ),
                    );
                    None
                }
            },
            Some(other) => {
                errors.push_field(role_key, expected_string(other));
                None
            }
        };

        let pii = match obj.get("pii") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let strings: Option<Vec<String>> =
                    items.iter().map(|v| v.as_str().map(str::to_string)).collect();
                if strings.is_none() {
                    errors.push_field("pii", "Expected array of strings");
                }
                strings
            }
            Some(other) => {
                errors.push_field("pii", format!("Expected array, received {}", json_kind(other)));
                None
            }
        };

        let conversation_id = match obj.get("conversationId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => match parse_uuid(s) {
                Some(id) => Some(id),
                None => {
                    errors.push_field("conversationId", "Invalid uuid");
                    None
                }
            },
            Some(other) => {
                errors.push_field("conversationId", expected_string(other));
                None
            }
        };

        match (id, date, message, role) {
            (Some(id), Some(date), Some(message), Some(role)) if errors.is_empty() => Ok(Self {
                id,
                date,
                message,
                role,
                pii,
                conversation_id,
            }),
            _ => Err(errors),
        }
    }

    /// The question turn recorded for this request.
    pub fn question_turn(&self) -> ChatTurn {
        ChatTurn {
            id: self.id,
            date: self.date,
            message: self.message.clone(),
            role: Role::Question,
            pii: None,
        }
    }
}

fn expected_string(value: &Value) -> String {
    format!("Expected string, received {}", json_kind(value))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
