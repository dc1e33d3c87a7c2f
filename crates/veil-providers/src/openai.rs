//! OpenAI-compatible chat completions client (OpenRouter by default).

use serde::{Deserialize, Serialize};
use veil_core::{ProviderError, ProviderResult, VeilConfig};

const REFERER: &str = "https://veil.local";
const TITLE: &str = "Veil";

#[derive(Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

/// Streaming chunk (SSE `data:` payload).
#[derive(Deserialize, Debug)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: Option<StreamDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatMessageResponse,
}

#[derive(Deserialize)]
pub(crate) struct ChatMessageResponse {
    #[serde(default)]
    pub content: Option<String>,
}

pub(crate) fn transport(e: reqwest::Error) -> ProviderError {
    ProviderError::Transport(e.to_string())
}

/// Shared HTTP client, endpoint and key for the live adapters.
#[derive(Clone)]
pub struct LiveClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl LiveClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Uses `config.api_url` and the key from `VEIL_LLM_API_KEY` / `OPENROUTER_API_KEY`.
    pub fn from_config(config: &VeilConfig) -> ProviderResult<Self> {
        let key = VeilConfig::api_key().ok_or_else(|| {
            ProviderError::MissingApiKey(format!(
                "set {} or {} for live mode",
                veil_core::ENV_LLM_API_KEY,
                veil_core::ENV_OPENROUTER_API_KEY
            ))
        })?;
        Ok(Self::new(config.api_url.clone(), key))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Sends a completion request and fails on any non-success status.
    pub(crate) async fn post(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> ProviderResult<reqwest::Response> {
        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(
                target: "veil::providers",
                status = %status,
                model = request.model,
                "Completion request rejected"
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
