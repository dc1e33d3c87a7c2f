//! veil-core: PII-aware chat pipeline.
//!
//! Generated answers carry numbered `$N` placeholders instead of personal data; a second
//! model finds the PII in the user's message and the ordered list is sent as a metadata
//! patch after the answer. Clients render placeholders as masked tokens that can be revealed
//! locally, and the placeholder text plus PII list is what gets persisted.

mod config;
mod error;
pub mod adapters;
pub mod history;
pub mod orchestrator;
pub mod placeholder;
pub mod prompts;
pub mod protocol;
pub mod redaction;
pub mod schema;
pub mod session;
pub mod store;

pub use adapters::{
    extract_spans, DetectionAdapter, Generation, GenerationAdapter, GenerationWriter,
    SpanExtractor,
};
pub use config::{
    LlmMode, VeilConfig, DEFAULT_API_URL, DEFAULT_DETECTION_MODEL, DEFAULT_GENERATION_MODEL,
    ENV_LLM_API_KEY, ENV_OPENROUTER_API_KEY,
};
pub use error::{
    OrchestratorError, ProviderError, ProviderResult, StoreError, StoreResult,
    StreamAssemblyError, ValidationError,
};
pub use history::{
    from_conversation_turns, record_exchange, render_turns, save_ui_messages,
    to_conversation_turns, TurnView, UiMessage, UiMessageAssembler, UiPart, UiRole,
};
pub use orchestrator::{ChatStream, ExchangeOutcome, ExchangePhase, StreamOrchestrator};
pub use placeholder::{CorrelationReport, Segment};
pub use protocol::{AnswerMetadata, ProtocolEvent, SseData, SseDecoder};
pub use redaction::{RenderedSegment, RenderedText, DEFAULT_MASK};
pub use schema::{ChatRequest, ChatTurn, Conversation, Role};
pub use session::{ChatSession, SessionHost};
pub use store::{ConversationStore, MemoryConversationStore, SqliteConversationStore};
