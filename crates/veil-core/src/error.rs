//! Error types for the Veil chat pipeline.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type alias for conversation store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Field-keyed validation failure for an inbound chat request.
///
/// Serializes as `{ "formErrors": [...], "fieldErrors": { "field": [...] } }`, the shape
/// returned in the body of a 400 response.
#[derive(Error, Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("invalid request: {}", self.summary())]
pub struct ValidationError {
    pub form_errors: Vec<String>,
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl ValidationError {
    pub fn form(message: impl Into<String>) -> Self {
        Self {
            form_errors: vec![message.into()],
            field_errors: BTreeMap::new(),
        }
    }

    pub fn push_field(&mut self, field: &str, message: impl Into<String>) {
        self.field_errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.form_errors.is_empty() && self.field_errors.is_empty()
    }

    fn summary(&self) -> String {
        let mut parts: Vec<String> = self.form_errors.clone();
        for (field, messages) in &self.field_errors {
            parts.push(format!("{}: {}", field, messages.join(", ")));
        }
        parts.join("; ")
    }
}

/// Errors raised by generation and detection providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Missing API key: {0}")]
    MissingApiKey(String),

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Provider API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Generation stream ended before completion: {0}")]
    Interrupted(String),
}

/// Failure while building or framing the outbound event stream.
#[derive(Error, Debug)]
pub enum StreamAssemblyError {
    #[error("Event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Orchestrator task failed: {0}")]
    Task(String),
}

/// Errors from the conversation store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt conversation record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Errors that abort a chat exchange before any event is delivered.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Generation failed: {0}")]
    Generation(#[from] ProviderError),
}
