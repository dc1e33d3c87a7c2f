//! veil-providers: generation and detection adapters.
//!
//! `live` talks to an OpenAI-compatible chat completions endpoint (OpenRouter by default);
//! `mock` runs offline on a regex heuristic. [`build_adapters`] picks one pair from config.

mod live;
mod mock;
mod openai;

use std::sync::Arc;

use veil_core::{DetectionAdapter, GenerationAdapter, LlmMode, ProviderResult, VeilConfig};

pub use live::{LiveDetection, LiveGeneration};
pub use mock::{find_pii, mock_reply, MockDetection, MockGeneration, PiiKind, PiiSpan};
pub use openai::LiveClient;

/// The generation/detection pair a process runs with.
#[derive(Clone)]
pub struct Adapters {
    pub generation: Arc<dyn GenerationAdapter>,
    pub detection: Arc<dyn DetectionAdapter>,
}

/// Builds adapters for `config.llm_mode`. Live mode fails without an API key.
pub fn build_adapters(config: &VeilConfig) -> ProviderResult<Adapters> {
    match config.llm_mode {
        LlmMode::Mock => {
            tracing::info!(target: "veil::providers", "Using mock generation and detection");
            Ok(Adapters {
                generation: Arc::new(MockGeneration::from_config(config)),
                detection: Arc::new(MockDetection::from_config(config)?),
            })
        }
        LlmMode::Live => {
            let client = LiveClient::from_config(config)?;
            tracing::info!(
                target: "veil::providers",
                api_url = client.api_url(),
                generation_model = %config.generation_model,
                detection_model = %config.detection_model,
                "Using live generation and detection"
            );
            Ok(Adapters {
                generation: Arc::new(LiveGeneration::from_config(client.clone(), config)),
                detection: Arc::new(LiveDetection::from_config(client, config)?),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_mode_builds_mock_adapters() {
        let adapters = build_adapters(&VeilConfig::default()).unwrap();
        assert_eq!(adapters.generation.name(), "mock-generation");
        assert_eq!(adapters.detection.name(), "mock-detection");
    }
}
