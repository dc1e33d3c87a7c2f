//! Seams to the two model providers.
//!
//! A [`GenerationAdapter`] hands back an event stream plus a future for the full text. A
//! [`DetectionAdapter`] returns the PII spans the detection model wrapped in delimiters,
//! in response order.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProviderError, ProviderResult};
use crate::protocol::ProtocolEvent;

pub const DEFAULT_SPAN_OPEN: &str = "<s>";
pub const DEFAULT_SPAN_CLOSE: &str = "</s>";

/// A started generation. `events` is finite and forward-only; `text` resolves once the model
/// has finished, with the concatenation of every text delta.
pub struct Generation {
    pub events: BoxStream<'static, ProtocolEvent>,
    pub text: BoxFuture<'static, ProviderResult<String>>,
}

impl Generation {
    pub fn from_parts(
        events: impl Stream<Item = ProtocolEvent> + Send + 'static,
        text: impl std::future::Future<Output = ProviderResult<String>> + Send + 'static,
    ) -> Self {
        Self {
            events: Box::pin(events),
            text: text.boxed(),
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Starts generating. An `Err` here means nothing was produced at all.
    async fn generate(&self, prompt: &str, system: &str) -> ProviderResult<Generation>;
}

#[async_trait]
pub trait DetectionAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered PII spans found in `raw`. Duplicates are kept.
    async fn detect(&self, raw: &str) -> ProviderResult<Vec<String>>;
}

/// Producer half of a channel-backed [`Generation`].
///
/// Wraps text deltas in a single `start-step`/`text-start` ... `text-end`/`finish-step`
/// envelope and resolves the text future with the accumulated output.
pub struct GenerationWriter {
    events: mpsc::Sender<ProtocolEvent>,
    text: Option<oneshot::Sender<ProviderResult<String>>>,
    part_id: String,
    accumulated: String,
    step_open: bool,
    part_open: bool,
}

impl GenerationWriter {
    pub fn channel(capacity: usize) -> (Self, Generation) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (text_tx, text_rx) = oneshot::channel();
        let writer = Self {
            events: tx,
            text: Some(text_tx),
            part_id: uuid::Uuid::new_v4().simple().to_string(),
            accumulated: String::new(),
            step_open: false,
            part_open: false,
        };
        let events = receiver_stream(rx);
        let text = text_rx.map(|res| {
            res.unwrap_or_else(|_| {
                Err(ProviderError::Interrupted(
                    "generation task dropped".to_string(),
                ))
            })
        });
        (writer, Generation::from_parts(events, text))
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Forwards one text delta. Returns false when the consumer is gone.
    pub async fn delta(&mut self, delta: &str) -> bool {
        if delta.is_empty() {
            return true;
        }
        if !self.open_part().await {
            return false;
        }
        self.accumulated.push_str(delta);
        self.send(ProtocolEvent::TextDelta {
            id: self.part_id.clone(),
            delta: delta.to_string(),
        })
        .await
    }

    /// Closes the envelope and resolves the text future with everything sent so far.
    pub async fn complete(mut self) {
        self.close_envelope().await;
        let text = std::mem::take(&mut self.accumulated);
        if let Some(tx) = self.text.take() {
            let _ = tx.send(Ok(text));
        }
    }

    /// Emits an `error` event and resolves the text future with `err`.
    pub async fn fail(mut self, err: ProviderError) {
        if self.part_open {
            self.part_open = false;
            let id = self.part_id.clone();
            self.send(ProtocolEvent::TextEnd { id }).await;
        }
        self.send(ProtocolEvent::error(err.to_string())).await;
        if let Some(tx) = self.text.take() {
            let _ = tx.send(Err(err));
        }
    }

    async fn open_part(&mut self) -> bool {
        if !self.step_open {
            self.step_open = true;
            if !self.send(ProtocolEvent::StartStep).await {
                return false;
            }
        }
        if !self.part_open {
            self.part_open = true;
            let id = self.part_id.clone();
            return self.send(ProtocolEvent::TextStart { id }).await;
        }
        true
    }

    async fn close_envelope(&mut self) {
        if !self.step_open {
            self.step_open = true;
            self.send(ProtocolEvent::StartStep).await;
        }
        if self.part_open {
            self.part_open = false;
            let id = self.part_id.clone();
            self.send(ProtocolEvent::TextEnd { id }).await;
        }
        self.send(ProtocolEvent::FinishStep).await;
    }

    async fn send(&self, event: ProtocolEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Adapts an mpsc receiver into a stream.
pub fn receiver_stream<T: Send + 'static>(
    rx: mpsc::Receiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send + 'static>> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

static DEFAULT_EXTRACTOR: Lazy<SpanExtractor> = Lazy::new(|| {
    SpanExtractor::new(DEFAULT_SPAN_OPEN, DEFAULT_SPAN_CLOSE).expect("default span delimiters")
});

/// Pulls delimiter-wrapped spans out of a detection response.
#[derive(Debug, Clone)]
pub struct SpanExtractor {
    pattern: Regex,
}

impl SpanExtractor {
    pub fn new(open: &str, close: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            "(?s){}(.*?){}",
            regex::escape(open),
            regex::escape(close)
        ))?;
        Ok(Self { pattern })
    }

    /// Spans in order of appearance; newlines inside a span are kept, empty spans dropped.
    pub fn extract(&self, raw: &str) -> Vec<String> {
        self.pattern
            .captures_iter(raw)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for SpanExtractor {
    fn default() -> Self {
        DEFAULT_EXTRACTOR.clone()
    }
}

/// [`SpanExtractor::extract`] with the `<s>`/`</s>` delimiters.
pub fn extract_spans(raw: &str) -> Vec<String> {
    DEFAULT_EXTRACTOR.extract(raw)
}
