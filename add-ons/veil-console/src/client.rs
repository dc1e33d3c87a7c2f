//! HTTP client for the gateway's chat and history endpoints.

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;
use veil_core::protocol::{take_utf8, SseData, SseDecoder};
use veil_core::{ChatTurn, Conversation, ProtocolEvent, UiMessageAssembler};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed stream event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("answer failed: {0}")]
    Answer(String),
    #[error("stream ended before finish")]
    Truncated,
}

pub struct GatewayClient {
    http: reqwest::Client,
    base: String,
}

impl GatewayClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Posts one question and folds the event stream; `on_delta` sees raw placeholder text.
    pub async fn chat(
        &self,
        body: &Value,
        mut on_delta: impl FnMut(&str),
    ) -> Result<UiMessageAssembler, ConsoleError> {
        let response = self.http.post(self.url("/api/chat")).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConsoleError::Status { status, body });
        }

        let mut assembler = UiMessageAssembler::new();
        let mut decoder = SseDecoder::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut bytes = response.bytes_stream();
        let mut done = false;

        'read: while let Some(chunk) = bytes.next().await {
            pending.extend_from_slice(&chunk?);
            let text = take_utf8(&mut pending);
            for data in decoder.push(&text) {
                match data {
                    SseData::Data(json) => {
                        let event: ProtocolEvent = serde_json::from_str(&json)?;
                        if let ProtocolEvent::TextDelta { delta, .. } = &event {
                            on_delta(delta);
                        }
                        assembler.apply(&event);
                    }
                    SseData::Done => {
                        done = true;
                        break 'read;
                    }
                }
            }
        }
        if !done {
            if let Some(SseData::Data(json)) = decoder.finish() {
                assembler.apply(&serde_json::from_str(&json)?);
            }
        }

        if let Some(err) = assembler.error() {
            return Err(ConsoleError::Answer(err.to_string()));
        }
        if !assembler.is_finished() {
            return Err(ConsoleError::Truncated);
        }
        Ok(assembler)
    }

    pub async fn list(&self) -> Result<Vec<Conversation>, ConsoleError> {
        let response = self.http.get(self.url("/api/conversations")).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<Conversation>, ConsoleError> {
        let response = self
            .http
            .get(self.url(&format!("/api/conversations/{}", id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(checked(response).await?.json().await?))
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ConsoleError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ConsoleError::Status { status, body })
    }
}

/// The answer turn an assembled stream stands for.
pub fn answer_turn(assembler: &UiMessageAssembler) -> ChatTurn {
    let id = Uuid::parse_str(&assembler.message().id).unwrap_or_else(|_| Uuid::new_v4());
    ChatTurn::answer(id, assembler.text(), assembler.pii())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::AnswerMetadata;

    #[test]
    fn answer_turn_carries_response_id_and_pii() {
        let meta = AnswerMetadata::new(Uuid::new_v4());
        let mut assembler = UiMessageAssembler::new();
        for event in [
            ProtocolEvent::start(&meta),
            ProtocolEvent::TextDelta {
                id: "0".into(),
                delta: "Hello $1!".into(),
            },
            ProtocolEvent::pii_metadata(&["John Doe".to_string()]),
            ProtocolEvent::Finish,
        ] {
            assembler.apply(&event);
        }
        let turn = answer_turn(&assembler);
        assert_eq!(turn.id, meta.id);
        assert_eq!(turn.message, "Hello $1!");
        assert_eq!(turn.pii_values(), &["John Doe"]);
    }
}
