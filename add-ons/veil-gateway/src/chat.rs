//! `POST /api/chat`: validate, start the exchange, stream UI message events.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use veil_core::protocol::{self, DONE_SENTINEL, UI_MESSAGE_STREAM_HEADER, UI_MESSAGE_STREAM_VERSION};
use veil_core::{ChatStream, OrchestratorError, ProtocolEvent, StreamAssemblyError};

use crate::AppState;

/// Sent in place of an event that could not be encoded.
const FALLBACK_ERROR_JSON: &str = r#"{"type":"error","errorText":"failed to encode stream event"}"#;
const FALLBACK_FINISH_JSON: &str = r#"{"type":"finish"}"#;

pub(crate) async fn chat_stream(State(state): State<AppState>, body: Bytes) -> Response {
    match state.orchestrator.handle(&body).await {
        Ok(chat) => {
            tracing::info!(
                target: "veil::chat",
                conversation_id = %chat.conversation_id(),
                response_id = %chat.metadata.id,
                "Chat stream opened"
            );
            sse_response(chat)
        }
        Err(OrchestratorError::Validation(e)) => {
            tracing::debug!(target: "veil::chat", error = %e, "Rejected chat request");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response()
        }
        Err(OrchestratorError::Generation(e)) => {
            tracing::error!(
                target: "veil::chat",
                error = %e,
                "Chat generation failed before streaming"
            );
            (StatusCode::BAD_GATEWAY, format!("Generation failed: {}", e)).into_response()
        }
    }
}

fn sse_response(chat: ChatStream) -> Response {
    let ChatStream {
        metadata,
        mut events,
        outcome,
    } = chat;
    let response_id = metadata.id;

    tokio::spawn(async move {
        match outcome.await {
            Ok(outcome) => tracing::debug!(
                target: "veil::chat",
                response_id = %outcome.response_id,
                persisted = outcome.persisted,
                detection_degraded = outcome.detection_degraded,
                "Exchange settled"
            ),
            Err(e) => {
                let err = StreamAssemblyError::Task(e.to_string());
                tracing::error!(
                    target: "veil::chat",
                    response_id = %response_id,
                    error = %err,
                    "Exchange task failed"
                );
            }
        }
    });

    let frames = stream! {
        let mut finished = false;
        while let Some(event) = events.next().await {
            match protocol::encode(&event) {
                Ok(json) => {
                    finished = matches!(event, ProtocolEvent::Finish);
                    yield Ok::<Event, Infallible>(Event::default().data(json));
                }
                Err(e) => {
                    let err = StreamAssemblyError::from(e);
                    tracing::error!(
                        target: "veil::chat",
                        response_id = %response_id,
                        error = %err,
                        "Degrading chat stream"
                    );
                    yield Ok(Event::default().data(FALLBACK_ERROR_JSON));
                    yield Ok(Event::default().data(FALLBACK_FINISH_JSON));
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            tracing::warn!(
                target: "veil::chat",
                response_id = %response_id,
                "Chat stream closed without finish"
            );
            let closing = [
                ProtocolEvent::error("stream closed unexpectedly"),
                ProtocolEvent::Finish,
            ];
            for event in closing {
                let json = protocol::encode(&event)
                    .unwrap_or_else(|_| FALLBACK_FINISH_JSON.to_string());
                yield Ok(Event::default().data(json));
            }
        }
        yield Ok(Event::default().data(DONE_SENTINEL));
    };

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keepalive");
    let mut response = Sse::new(frames).keep_alive(keep_alive).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(UI_MESSAGE_STREAM_HEADER),
        HeaderValue::from_static(UI_MESSAGE_STREAM_VERSION),
    );
    response
}
