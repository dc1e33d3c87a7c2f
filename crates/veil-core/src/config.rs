//! Application configuration. Load from an optional TOML file and `VEIL__*` environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapters::{DEFAULT_SPAN_CLOSE, DEFAULT_SPAN_OPEN};
use crate::redaction::DEFAULT_MASK;

pub const ENV_CONFIG_PATH: &str = "VEIL_CONFIG";
pub const ENV_LLM_API_KEY: &str = "VEIL_LLM_API_KEY";
pub const ENV_OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";

pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_GENERATION_MODEL: &str = "anthropic/claude-sonnet-4.5";
pub const DEFAULT_DETECTION_MODEL: &str = "anthropic/claude-haiku-4.5";

/// Mock runs offline with a heuristic PII model; live calls the configured API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmMode {
    #[default]
    Mock,
    Live,
}

impl LlmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmMode::Mock => "mock",
            LlmMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VeilConfig {
    pub app_name: String,
    pub bind_address: String,
    pub port: u16,
    /// Directory holding the conversation database.
    pub storage_path: String,
    pub llm_mode: LlmMode,
    /// OpenAI-compatible chat completions endpoint.
    pub api_url: String,
    pub generation_model: String,
    pub detection_model: String,
    pub span_open: String,
    pub span_close: String,
    /// Display string for a hidden PII token.
    pub mask: String,
    /// Buffer between the orchestrator task and the HTTP response.
    pub channel_capacity: usize,
    /// Default page size for conversation listings.
    pub history_limit: usize,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            app_name: "Veil".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 8010,
            storage_path: "./data".to_string(),
            llm_mode: LlmMode::Mock,
            api_url: DEFAULT_API_URL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            detection_model: DEFAULT_DETECTION_MODEL.to_string(),
            span_open: DEFAULT_SPAN_OPEN.to_string(),
            span_close: DEFAULT_SPAN_CLOSE.to_string(),
            mask: DEFAULT_MASK.to_string(),
            channel_capacity: 64,
            history_limit: 50,
        }
    }
}

impl VeilConfig {
    /// Load config from file and environment. Precedence: `VEIL__*` env > file (`VEIL_CONFIG`
    /// path or `config/veil.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "config/veil".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let d = Self::default();
        let builder = config::Config::builder()
            .set_default("app_name", d.app_name)?
            .set_default("bind_address", d.bind_address)?
            .set_default("port", d.port as i64)?
            .set_default("storage_path", d.storage_path)?
            .set_default("llm_mode", d.llm_mode.as_str())?
            .set_default("api_url", d.api_url)?
            .set_default("generation_model", d.generation_model)?
            .set_default("detection_model", d.detection_model)?
            .set_default("span_open", d.span_open)?
            .set_default("span_close", d.span_close)?
            .set_default("mask", d.mask)?
            .set_default("channel_capacity", d.channel_capacity as i64)?
            .set_default("history_limit", d.history_limit as i64)?;

        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("VEIL").separator("__"))
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.span_open.is_empty() || self.span_close.is_empty() {
            return Err(config::ConfigError::Message(
                "span_open and span_close must be non-empty".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(config::ConfigError::Message(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.storage_path).join("veil_conversations.db")
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }

    /// API key: `VEIL_LLM_API_KEY`, or `OPENROUTER_API_KEY` as fallback. Blank values count
    /// as missing.
    pub fn api_key() -> Option<String> {
        std::env::var(ENV_LLM_API_KEY)
            .or_else(|_| std::env::var(ENV_OPENROUTER_API_KEY))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}
