//! Live adapters: streaming generation and single-shot detection over the completions API.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use veil_core::prompts::detection_system_prompt;
use veil_core::protocol::{take_utf8, SseData, SseDecoder};
use veil_core::{
    DetectionAdapter, Generation, GenerationAdapter, GenerationWriter, ProviderError,
    ProviderResult, SpanExtractor, VeilConfig,
};

use crate::openai::{
    transport, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, LiveClient,
    StreamChunk,
};

const GENERATION_NAME: &str = "live-generation";
const DETECTION_NAME: &str = "live-detection";

/// Streams an answer from the generation model.
#[derive(Debug, Clone)]
pub struct LiveGeneration {
    client: LiveClient,
    model: String,
    channel_capacity: usize,
}

impl LiveGeneration {
    pub fn new(client: LiveClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            channel_capacity: 100,
        }
    }

    pub fn from_config(client: LiveClient, config: &VeilConfig) -> Self {
        let mut this = Self::new(client, config.generation_model.clone());
        this.channel_capacity = config.channel_capacity;
        this
    }
}

#[async_trait]
impl GenerationAdapter for LiveGeneration {
    fn name(&self) -> &str {
        GENERATION_NAME
    }

    async fn generate(&self, prompt: &str, system: &str) -> ProviderResult<Generation> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: None,
            stream: Some(true),
        };
        let response = self.client.post(&request).await?;

        tracing::info!(
            target: "veil::providers",
            model = %self.model,
            "Generation stream established"
        );

        let (mut writer, generation) = GenerationWriter::channel(self.channel_capacity);
        let model = self.model.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let bytes = match stream.try_next().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        writer.fail(transport(e)).await;
                        return;
                    }
                };
                pending.extend_from_slice(&bytes);
                let text = take_utf8(&mut pending);
                for data in decoder.push(&text) {
                    match data {
                        SseData::Done => {
                            tracing::debug!(
                                target: "veil::providers",
                                model = %model,
                                "Generation stream completed"
                            );
                            writer.complete().await;
                            return;
                        }
                        SseData::Data(payload) => match apply_chunk(&mut writer, &payload).await {
                            ChunkOutcome::Continue => {}
                            ChunkOutcome::ConsumerGone => {
                                tracing::debug!(
                                    target: "veil::providers",
                                    "Generation consumer dropped"
                                );
                                return;
                            }
                            ChunkOutcome::Failed(err) => {
                                writer.fail(err).await;
                                return;
                            }
                        },
                    }
                }
            }
            // Upstream closed without the sentinel; keep what arrived.
            if let Some(SseData::Data(payload)) = decoder.finish() {
                if let ChunkOutcome::Failed(err) = apply_chunk(&mut writer, &payload).await {
                    writer.fail(err).await;
                    return;
                }
            }
            writer.complete().await;
        });

        Ok(generation)
    }
}

enum ChunkOutcome {
    Continue,
    ConsumerGone,
    Failed(ProviderError),
}

async fn apply_chunk(writer: &mut GenerationWriter, payload: &str) -> ChunkOutcome {
    let chunk = match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(
                target: "veil::providers",
                error = %e,
                "Skipping unparsable stream chunk"
            );
            return ChunkOutcome::Continue;
        }
    };
    if let Some(err) = chunk.error {
        return ChunkOutcome::Failed(ProviderError::Api {
            status: err
                .code
                .as_ref()
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(502),
            body: err.message,
        });
    }
    for choice in chunk.choices {
        if let Some(content) = choice.delta.and_then(|d| d.content) {
            if !writer.delta(&content).await {
                return ChunkOutcome::ConsumerGone;
            }
        }
        if let Some(reason) = choice.finish_reason {
            tracing::debug!(
                target: "veil::providers",
                finish_reason = %reason,
                "Generation finished"
            );
        }
    }
    ChunkOutcome::Continue
}

/// Asks the detection model to wrap PII in delimiters, then extracts the spans.
#[derive(Debug, Clone)]
pub struct LiveDetection {
    client: LiveClient,
    model: String,
    system_prompt: String,
    extractor: SpanExtractor,
}

impl LiveDetection {
    pub fn new(
        client: LiveClient,
        model: impl Into<String>,
        open: &str,
        close: &str,
    ) -> ProviderResult<Self> {
        let extractor = SpanExtractor::new(open, close)
            .map_err(|e| ProviderError::Malformed(format!("span delimiters: {}", e)))?;
        Ok(Self {
            client,
            model: model.into(),
            system_prompt: detection_system_prompt(open, close),
            extractor,
        })
    }

    pub fn from_config(client: LiveClient, config: &VeilConfig) -> ProviderResult<Self> {
        Self::new(
            client,
            config.detection_model.clone(),
            &config.span_open,
            &config.span_close,
        )
    }
}

#[async_trait]
impl DetectionAdapter for LiveDetection {
    fn name(&self) -> &str {
        DETECTION_NAME
    }

    async fn detect(&self, raw: &str) -> ProviderResult<Vec<String>> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: raw,
                },
            ],
            temperature: Some(0.0),
            stream: None,
        };
        let response = self.client.post(&request).await?;
        let body: ChatCompletionResponse = response.json().await.map_err(transport)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| {
                ProviderError::Malformed("no choices in detection response".to_string())
            })?;

        let spans = self.extractor.extract(&content);
        tracing::debug!(
            target: "veil::providers",
            model = %self.model,
            spans = spans.len(),
            "Detection complete"
        );
        Ok(spans)
    }
}
