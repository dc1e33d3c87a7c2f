//! Stream orchestrator: one chat exchange from validated request to persisted answer.
//!
//! Per request a single task owns the outbound channel and walks
//! `Idle -> Started -> Streaming -> Detecting -> MetadataEmitted -> Done`:
//!
//! 1. `start` with a fresh answer id, before any model output.
//! 2. Generation events forwarded as they arrive.
//! 3. Once the full text is known, detection runs on the user's original message.
//! 4. `message-metadata { pii }`, then `finish`; the channel closes.
//! 5. The question/answer pair is saved off the response path.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{receiver_stream, DetectionAdapter, Generation, GenerationAdapter};
use crate::error::OrchestratorError;
use crate::history;
use crate::placeholder;
use crate::prompts::PLACEHOLDER_GENERATION_SYSTEM;
use crate::protocol::{AnswerMetadata, ProtocolEvent};
use crate::schema::{ChatRequest, ChatTurn};
use crate::store::ConversationStore;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    Started,
    Streaming,
    Detecting,
    MetadataEmitted,
    Done,
}

/// What happened after the response stream was handed out.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub conversation_id: Uuid,
    pub response_id: Uuid,
    /// Every phase entered, in order.
    pub phases: Vec<ExchangePhase>,
    /// Set when generation completed.
    pub answer: Option<ChatTurn>,
    /// Detection failed and the answer went out with no PII.
    pub detection_degraded: bool,
    pub persisted: bool,
    /// The client stopped reading before the stream closed.
    pub client_disconnected: bool,
}

/// An accepted exchange: the event stream for the client plus the background task.
pub struct ChatStream {
    pub metadata: AnswerMetadata,
    pub events: Pin<Box<dyn Stream<Item = ProtocolEvent> + Send + 'static>>,
    pub outcome: JoinHandle<ExchangeOutcome>,
}

impl ChatStream {
    pub fn conversation_id(&self) -> Uuid {
        self.metadata.conversation_id
    }
}

#[derive(Clone)]
pub struct StreamOrchestrator {
    generation: Arc<dyn GenerationAdapter>,
    detection: Arc<dyn DetectionAdapter>,
    store: Arc<dyn ConversationStore>,
    system_prompt: Arc<str>,
    channel_capacity: usize,
}

impl StreamOrchestrator {
    pub fn new(
        generation: Arc<dyn GenerationAdapter>,
        detection: Arc<dyn DetectionAdapter>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            generation,
            detection,
            store,
            system_prompt: Arc::from(PLACEHOLDER_GENERATION_SYSTEM),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Arc::from(prompt.into());
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn generation_name(&self) -> &str {
        self.generation.name()
    }

    pub fn detection_name(&self) -> &str {
        self.detection.name()
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        Arc::clone(&self.store)
    }

    /// Validates a raw body and starts the exchange.
    pub async fn handle(&self, body: &[u8]) -> Result<ChatStream, OrchestratorError> {
        let request = ChatRequest::parse(body)?;
        self.start(request).await
    }

    /// Starts generation and spawns the exchange task. A generation error is returned before
    /// any event exists.
    pub async fn start(&self, request: ChatRequest) -> Result<ChatStream, OrchestratorError> {
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);

        let generation = match self
            .generation
            .generate(&request.message, &self.system_prompt)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(
                    target: "veil::orchestrator",
                    conversation_id = %conversation_id,
                    adapter = self.generation.name(),
                    error = %e,
                    "Generation could not be started"
                );
                return Err(e.into());
            }
        };

        let metadata = AnswerMetadata::new(conversation_id);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let exchange = Exchange {
            request,
            metadata: metadata.clone(),
            detection: Arc::clone(&self.detection),
            store: Arc::clone(&self.store),
            phases: vec![ExchangePhase::Idle],
            out: Outbound {
                tx: Some(tx),
                client_gone: false,
            },
        };
        let outcome = tokio::spawn(exchange.run(generation));

        Ok(ChatStream {
            metadata,
            events: receiver_stream(rx),
            outcome,
        })
    }
}

struct Outbound {
    tx: Option<mpsc::Sender<ProtocolEvent>>,
    client_gone: bool,
}

impl Outbound {
    async fn send(&mut self, event: ProtocolEvent) {
        if self.client_gone {
            return;
        }
        let Some(tx) = &self.tx else { return };
        if tx.send(event).await.is_err() {
            self.client_gone = true;
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

struct Exchange {
    request: ChatRequest,
    metadata: AnswerMetadata,
    detection: Arc<dyn DetectionAdapter>,
    store: Arc<dyn ConversationStore>,
    phases: Vec<ExchangePhase>,
    out: Outbound,
}

impl Exchange {
    fn enter(&mut self, phase: ExchangePhase) {
        tracing::debug!(
            target: "veil::orchestrator",
            response_id = %self.metadata.id,
            from = ?self.phases.last(),
            to = ?phase,
            "Exchange phase"
        );
        self.phases.push(phase);
    }

    fn outcome(
        &self,
        answer: Option<ChatTurn>,
        detection_degraded: bool,
        persisted: bool,
    ) -> ExchangeOutcome {
        ExchangeOutcome {
            conversation_id: self.metadata.conversation_id,
            response_id: self.metadata.id,
            phases: self.phases.clone(),
            answer,
            detection_degraded,
            persisted,
            client_disconnected: self.out.client_gone,
        }
    }

    async fn run(mut self, generation: Generation) -> ExchangeOutcome {
        let Generation { mut events, text } = generation;

        self.out.send(ProtocolEvent::start(&self.metadata)).await;
        self.enter(ExchangePhase::Started);

        self.enter(ExchangePhase::Streaming);
        while let Some(event) = events.next().await {
            // `start` and `finish` belong to this exchange, not the model.
            if matches!(event, ProtocolEvent::Start { .. } | ProtocolEvent::Finish) {
                tracing::debug!(
                    target: "veil::orchestrator",
                    kind = event.kind(),
                    "Dropped adapter lifecycle event"
                );
                continue;
            }
            self.out.send(event).await;
        }

        let text = match text.await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    target: "veil::orchestrator",
                    response_id = %self.metadata.id,
                    error = %e,
                    "Generation failed mid-stream; no metadata or persistence"
                );
                self.out.send(ProtocolEvent::Finish).await;
                self.out.close();
                self.enter(ExchangePhase::Done);
                return self.outcome(None, false, false);
            }
        };

        self.enter(ExchangePhase::Detecting);
        let (pii, detection_degraded) = match self.detection.detect(&self.request.message).await {
            Ok(pii) => (pii, false),
            Err(e) => {
                tracing::warn!(
                    target: "veil::orchestrator",
                    response_id = %self.metadata.id,
                    adapter = self.detection.name(),
                    error = %e,
                    "PII detection failed; answering without PII metadata"
                );
                (Vec::new(), true)
            }
        };

        let report = placeholder::audit(&text, &pii);
        if !report.is_aligned() {
            tracing::warn!(
                target: "veil::orchestrator",
                response_id = %self.metadata.id,
                placeholders = ?report.placeholders,
                pii_count = report.value_count,
                unresolved = ?report.unresolved,
                unreferenced = ?report.unreferenced,
                "Placeholders and detected PII do not line up"
            );
        }

        self.out.send(ProtocolEvent::pii_metadata(&pii)).await;
        self.enter(ExchangePhase::MetadataEmitted);
        self.out.send(ProtocolEvent::Finish).await;
        self.out.close();
        self.enter(ExchangePhase::Done);

        if self.out.client_gone {
            tracing::info!(
                target: "veil::orchestrator",
                response_id = %self.metadata.id,
                "Client disconnected before the stream closed"
            );
        }

        let mut answer = ChatTurn::answer(self.metadata.id, text, pii);
        answer.date = self.metadata.date;
        let persisted = self.persist(&answer).await;

        tracing::info!(
            target: "veil::orchestrator",
            conversation_id = %self.metadata.conversation_id,
            response_id = %self.metadata.id,
            answer_len = answer.message.len(),
            pii_count = answer.pii_values().len(),
            persisted,
            "Chat exchange complete"
        );
        self.outcome(Some(answer), detection_degraded, persisted)
    }

    async fn persist(&self, answer: &ChatTurn) -> bool {
        if answer.message.is_empty() {
            tracing::warn!(
                target: "veil::orchestrator",
                response_id = %self.metadata.id,
                "Empty answer; exchange not persisted"
            );
            return false;
        }
        let store = Arc::clone(&self.store);
        let conversation_id = self.metadata.conversation_id;
        let question = self.request.question_turn();
        let answer = answer.clone();
        let result = tokio::task::spawn_blocking(move || {
            history::record_exchange(store.as_ref(), conversation_id, question, answer)
        })
        .await;
        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "veil::orchestrator",
                    conversation_id = %conversation_id,
                    error = %e,
                    "Failed to persist exchange"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    target: "veil::orchestrator",
                    conversation_id = %conversation_id,
                    error = %e,
                    "Persistence task failed"
                );
                false
            }
        }
    }
}
