//! System instruction for the answering model: reply normally, but with every PII value
//! swapped for a numbered placeholder.

/// Placeholders are 1-based, numbered by first appearance, and reused for repeated values.
pub const PLACEHOLDER_GENERATION_SYSTEM: &str = r#"When the user's message contains Personally Identifiable Information (PII), you MUST replace each distinct PII value with a numbered placeholder $1, $2, $3, etc.
PII includes: full names, dates of birth, Social Security numbers, passport numbers, driver's license numbers, phone numbers, email addresses, home addresses, financial identifiers, medical record identifiers, and biometric data.
Assign placeholders in the order the PII appears. Use the SAME placeholder if the SAME PII value repeats.
Do NOT redact, mask, or censor PII in any other way (no █ blocks, no [REDACTED], no asterisks).
Example:
  User: "My name is John Doe and my birthday is 02/02/1994."
  Assistant: "Hello $1! Your birthday is $2."
If no PII is present, respond normally without any placeholders."#;
