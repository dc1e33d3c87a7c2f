//! Veil gateway: PII-aware chat streaming plus conversation history over HTTP.

mod chat;
mod conversations;

use std::sync::Arc;

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veil_core::{ConversationStore, SqliteConversationStore, StreamOrchestrator, VeilConfig};
use veil_providers::build_adapters;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<VeilConfig>,
    pub(crate) orchestrator: StreamOrchestrator,
    pub(crate) store: Arc<dyn ConversationStore>,
}

fn usage() -> ! {
    eprintln!("Usage: veil-gateway [--port <PORT>] [--mock | --live]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    // API keys stay in the backend environment; clients never see them.
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[veil-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match VeilConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[veil-gateway] Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                config.port = args
                    .get(i + 1)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_else(|| usage());
                i += 1;
            }
            "--mock" => config.llm_mode = veil_core::LlmMode::Mock,
            "--live" => config.llm_mode = veil_core::LlmMode::Live,
            "-h" | "--help" => usage(),
            other => {
                eprintln!("Unknown argument: {}", other);
                usage();
            }
        }
        i += 1;
    }

    let store: Arc<dyn ConversationStore> =
        match SqliteConversationStore::open(config.database_path()) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!(
                    target: "veil::store",
                    error = %e,
                    "Failed to open conversation store"
                );
                std::process::exit(1);
            }
        };

    let adapters = match build_adapters(&config) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(
                target: "veil::providers",
                error = %e,
                "Failed to initialise model adapters"
            );
            std::process::exit(1);
        }
    };

    let orchestrator =
        StreamOrchestrator::new(adapters.generation, adapters.detection, Arc::clone(&store))
            .with_channel_capacity(config.channel_capacity);

    let addr = match config.socket_addr() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "Invalid bind address");
            std::process::exit(1);
        }
    };
    let app_name = config.app_name.clone();
    let llm_mode = config.llm_mode;

    let app = build_app(AppState {
        config: Arc::new(config),
        orchestrator,
        store,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(llm_mode = llm_mode.as_str(), "{} listening on {}", app_name, addr);

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown initiated (Ctrl+C received)");
        }
    }
}

fn build_app(state: AppState) -> Router {
    // Local UI dev servers (3000-3099) and the gateway's own port range.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &axum::http::HeaderValue, _| {
            let s = origin.to_str().unwrap_or("");
            if !(s.starts_with("http://localhost:") || s.starts_with("http://127.0.0.1:")) {
                return false;
            }
            let port = s
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(0);
            (3000..=3099).contains(&port) || (8000..=8099).contains(&port)
        }))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .expose_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/chat", post(chat::chat_stream))
        .route("/api/conversations", get(conversations::list_conversations))
        .route(
            "/api/conversations/:id",
            get(conversations::get_conversation)
                .put(conversations::save_conversation)
                .delete(conversations::delete_conversation),
        )
        .route("/api/conversations/:id/view", get(conversations::view_conversation))
        .layer(cors)
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "app_name": state.config.app_name,
        "llm_mode": state.config.llm_mode.as_str(),
        "generation": {
            "adapter": state.orchestrator.generation_name(),
            "model": state.config.generation_model,
        },
        "detection": {
            "adapter": state.orchestrator.detection_name(),
            "model": state.config.detection_model,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;
    use veil_core::protocol::{SseData, SseDecoder};
    use veil_core::{
        DetectionAdapter, Generation, GenerationAdapter, MemoryConversationStore, ProtocolEvent,
        ProviderError, ProviderResult,
    };
    use veil_providers::{MockDetection, MockGeneration};

    struct UnreachableGeneration;

    #[async_trait]
    impl GenerationAdapter for UnreachableGeneration {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn generate(&self, _prompt: &str, _system: &str) -> ProviderResult<Generation> {
            Err(ProviderError::Transport("connection refused".into()))
        }
    }

    fn test_config() -> VeilConfig {
        VeilConfig {
            app_name: "Test Veil".to_string(),
            ..VeilConfig::default()
        }
    }

    fn test_state_with(
        generation: Arc<dyn GenerationAdapter>,
        detection: Arc<dyn DetectionAdapter>,
    ) -> (AppState, Arc<MemoryConversationStore>) {
        let store = Arc::new(MemoryConversationStore::new());
        let orchestrator = StreamOrchestrator::new(generation, detection, store.clone());
        let state = AppState {
            config: Arc::new(test_config()),
            orchestrator,
            store: store.clone(),
        };
        (state, store)
    }

    fn test_state() -> (AppState, Arc<MemoryConversationStore>) {
        test_state_with(
            Arc::new(MockGeneration::new().with_delay(Duration::ZERO)),
            Arc::new(MockDetection::new("<s>", "</s>").unwrap()),
        )
    }

    fn chat_body(message: &str) -> serde_json::Value {
        serde_json::json!({
            "id": uuid::Uuid::new_v4(),
            "date": "2025-01-15T10:30:00.000Z",
            "message": message,
            "type": "question",
        })
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    /// Decodes an SSE body into events, plus whether it ended with `[DONE]`.
    fn decode_events(body: &[u8]) -> (Vec<ProtocolEvent>, bool) {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        let mut done = false;
        for data in decoder.push(&String::from_utf8_lossy(body)) {
            match data {
                SseData::Data(json) => {
                    assert!(!done, "event after [DONE]");
                    events.push(serde_json::from_str(&json).unwrap());
                }
                SseData::Done => done = true,
            }
        }
        (events, done)
    }

    async fn wait_for_record(
        store: &MemoryConversationStore,
        id: uuid::Uuid,
    ) -> veil_core::Conversation {
        for _ in 0..100 {
            if let Some(record) = store.get(id).unwrap() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("conversation {} was never persisted", id);
    }

    #[tokio::test]
    async fn chat_streams_ui_message_events() {
        let (state, store) = test_state();
        let app = build_app(state);
        let response = app
            .oneshot(post_json("/api/chat", &chat_body("My name is John Doe")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-vercel-ai-ui-message-stream").unwrap(),
            "v1"
        );
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let (events, done) = decode_events(&body_bytes(response).await);
        assert!(done);
        let conversation_id = match &events[0] {
            ProtocolEvent::Start { message_metadata: Some(meta), .. } => {
                assert_eq!(meta["type"], "answer");
                uuid::Uuid::parse_str(meta["conversationId"].as_str().unwrap()).unwrap()
            }
            other => panic!("expected start, got {:?}", other),
        };
        assert_eq!(events.last(), Some(&ProtocolEvent::Finish));
        assert_eq!(
            events[events.len() - 2],
            ProtocolEvent::pii_metadata(&["John Doe".to_string()])
        );

        let record = wait_for_record(&store, conversation_id).await;
        assert_eq!(record.turns()[1].message, "Hello $1!");
        assert_eq!(record.turns()[1].pii_values(), &["John Doe"]);
    }

    #[tokio::test]
    async fn chat_rejects_missing_message() {
        let (state, _) = test_state();
        let mut body = chat_body("x");
        body.as_object_mut().unwrap().remove("message");
        let response = build_app(state)
            .oneshot(post_json("/api/chat", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["error"]["fieldErrors"]["message"][0], "Required");
    }

    #[tokio::test]
    async fn chat_rejects_non_iso_date() {
        let (state, _) = test_state();
        let mut body = chat_body("hello");
        body["date"] = serde_json::json!("yesterday");
        let response = build_app(state)
            .oneshot(post_json("/api/chat", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(json["error"]["fieldErrors"]["date"].is_array());
    }

    #[tokio::test]
    async fn generation_failure_is_a_hard_error() {
        let (state, store) = test_state_with(
            Arc::new(UnreachableGeneration),
            Arc::new(MockDetection::new("<s>", "</s>").unwrap()),
        );
        let response = build_app(state)
            .oneshot(post_json("/api/chat", &chat_body("hello")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get("x-vercel-ai-ui-message-stream").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn detection_failure_still_sends_empty_metadata() {
        let (state, _) = test_state_with(
            Arc::new(MockGeneration::new().with_delay(Duration::ZERO)),
            Arc::new(MockDetection::failing()),
        );
        let response = build_app(state)
            .oneshot(post_json("/api/chat", &chat_body("My name is John Doe")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let (events, done) = decode_events(&body_bytes(response).await);
        assert!(done);
        assert!(events.contains(&ProtocolEvent::pii_metadata(&[])));
    }

    #[tokio::test]
    async fn saved_conversation_lists_and_renders_masked() {
        let (state, _) = test_state();
        let app = build_app(state);
        let id = uuid::Uuid::new_v4();
        let save = serde_json::json!({
            "messages": [
                {"id": "sys", "role": "system", "parts": [{"type": "text", "text": "rules"}]},
                {"id": uuid::Uuid::new_v4(), "role": "user", "parts": [{"type": "text", "text": "My name is John Doe"}]},
                {"id": uuid::Uuid::new_v4(), "role": "assistant",
                 "parts": [{"type": "step-start"}, {"type": "text", "text": "Hello $1, born $2"}],
                 "metadata": {"pii": ["John Doe", "02/02/1994"]}}
            ]
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/conversations/{}", id))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&save).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/conversations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(list[0]["id"], id.to_string());
        assert_eq!(list[0]["turns"].as_array().unwrap().len(), 2);
        assert_eq!(list[0]["turnIds"].as_array().unwrap().len(), 2);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{}/view", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let view: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(view["turns"][0]["role"], "question");
        assert_eq!(view["turns"][1]["masked"], "Hello ██████, born ██████");
    }

    #[tokio::test]
    async fn saving_only_system_messages_is_no_content() {
        let (state, store) = test_state();
        let save = serde_json::json!({
            "messages": [{"id": "sys", "role": "system", "parts": [{"type": "text", "text": "rules"}]}]
        });
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/conversations/{}", uuid::Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&save).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn conversation_lookup_errors() {
        let (state, _) = test_state();
        let app = build_app(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/conversations/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing = uuid::Uuid::new_v4();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{}", missing))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/conversations/{}", missing))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_conversation() {
        let (state, store) = test_state();
        let convo = veil_core::Conversation::with_turns(
            uuid::Uuid::new_v4(),
            vec![veil_core::ChatTurn::question(uuid::Uuid::new_v4(), "hi")],
        );
        store.save(&convo).unwrap();
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/conversations/{}", convo.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn status_reports_identity_and_adapters() {
        let (state, _) = test_state();
        let response = build_app(state)
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["app_name"], "Test Veil");
        assert_eq!(json["llm_mode"], "mock");
        assert_eq!(json["generation"]["adapter"], "mock-generation");
        assert!(json.get("api_key").is_none());
    }
}
