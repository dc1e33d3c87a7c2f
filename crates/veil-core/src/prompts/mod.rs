//! Prompt templates for the generation and detection models.

pub mod detection;
pub mod generation;

pub use detection::{detection_system_prompt, PII_DETECTION_SYSTEM_TEMPLATE};
pub use generation::PLACEHOLDER_GENERATION_SYSTEM;
