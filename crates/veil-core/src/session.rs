//! Client-side chat sessions.
//!
//! A session is bound to one conversation id for its whole life. Switching conversations
//! closes the current session and opens a new one seeded from stored turns; nothing from
//! the previous session (including reveal state) carries over.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::redaction::{RenderedText, DEFAULT_MASK};
use crate::schema::{ChatTurn, Role};

#[derive(Debug, Clone)]
pub struct ChatSession {
    conversation_id: Uuid,
    turns: Vec<ChatTurn>,
    /// One entry per turn; `Some` for answers.
    rendered: Vec<Option<RenderedText>>,
    mask: String,
}

impl ChatSession {
    fn new(conversation_id: Uuid, seed: Vec<ChatTurn>, mask: &str) -> Self {
        let mut session = Self {
            conversation_id,
            turns: Vec::with_capacity(seed.len()),
            rendered: Vec::with_capacity(seed.len()),
            mask: mask.to_string(),
        };
        for turn in seed {
            session.push(turn);
        }
        session
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Records a turn; answers get a fully masked rendering.
    pub fn push(&mut self, turn: ChatTurn) {
        let rendered = match turn.role {
            Role::Answer => Some(RenderedText::with_mask(
                &turn.message,
                turn.pii_values(),
                &self.mask,
            )),
            Role::Question => None,
        };
        self.turns.push(turn);
        self.rendered.push(rendered);
    }

    /// Builds the question turn and the `POST /api/chat` body for `text`.
    pub fn compose(&self, text: &str) -> (ChatTurn, Value) {
        let turn = ChatTurn::question(Uuid::new_v4(), text);
        let body = json!({
            "id": turn.id,
            "date": turn.date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "message": turn.message,
            "type": "question",
            "conversationId": self.conversation_id,
        });
        (turn, body)
    }

    pub fn last_answer(&self) -> Option<&RenderedText> {
        self.rendered.iter().rev().flatten().next()
    }

    pub fn last_answer_mut(&mut self) -> Option<&mut RenderedText> {
        self.rendered.iter_mut().rev().flatten().next()
    }

    /// Display lines for every turn, honoring reveal state.
    pub fn transcript(&self) -> Vec<(Role, String)> {
        self.turns
            .iter()
            .zip(&self.rendered)
            .map(|(turn, rendered)| match rendered {
                Some(r) => (turn.role, r.display()),
                None => (turn.role, turn.message.clone()),
            })
            .collect()
    }
}

/// Holds at most one active [`ChatSession`].
#[derive(Debug)]
pub struct SessionHost {
    active: Option<ChatSession>,
    mask: String,
}

impl Default for SessionHost {
    fn default() -> Self {
        Self::new(DEFAULT_MASK)
    }
}

impl SessionHost {
    pub fn new(mask: &str) -> Self {
        Self {
            active: None,
            mask: mask.to_string(),
        }
    }

    /// Replaces the active session with one for `conversation_id`.
    pub fn open(&mut self, conversation_id: Uuid, seed: Vec<ChatTurn>) -> &mut ChatSession {
        if let Some(previous) = self.close() {
            tracing::debug!(
                target: "veil::session",
                conversation_id = %previous.conversation_id,
                "Session closed"
            );
        }
        tracing::debug!(
            target: "veil::session",
            conversation_id = %conversation_id,
            turns = seed.len(),
            "Session opened"
        );
        self.active.insert(ChatSession::new(conversation_id, seed, &self.mask))
    }

    /// Opens an empty session under a fresh conversation id.
    pub fn start_new(&mut self) -> &mut ChatSession {
        self.open(Uuid::new_v4(), Vec::new())
    }

    pub fn close(&mut self) -> Option<ChatSession> {
        self.active.take()
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ChatSession> {
        self.active.as_mut()
    }

    /// The active session, opening a new one if there is none.
    pub fn ensure_active(&mut self) -> &mut ChatSession {
        let mask = self.mask.clone();
        self.active
            .get_or_insert_with(|| ChatSession::new(Uuid::new_v4(), Vec::new(), &mask))
    }
}
