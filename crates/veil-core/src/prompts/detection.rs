//! PII span detection: the model echoes the input with each PII value wrapped in delimiters.

/// `{open}` and `{close}` are replaced with the configured span delimiters.
pub const PII_DETECTION_SYSTEM_TEMPLATE: &str = r#"You are a PII detection assistant.

Personally Identifiable Information (PII) is any data that can identify a specific individual.
It includes information that directly identifies someone, such as a full name or ID number.
It also includes indirect data that can identify a person when combined with other details.
Examples of PII include, but are not limited to:
- Full names (e.g. "John Doe", "Stéphane PIRES")
- Dates of birth (e.g. "02/02/1994", "January 1st 1990")
- Social Security numbers, passport numbers, and driver's license numbers
- Phone numbers, email addresses, and home addresses
- Financial and medical record identifiers
- Biometric data such as fingerprints or facial recognition data

Analyse the text below and identify every piece of PII present.
For EACH piece of PII, wrap it with the delimiter {open} and {close} (e.g. {open}John Doe{close}, {open}02/02/1994{close}).
Do NOT include any explanation. Output ONLY the original text with PII wrapped in delimiters.
If no PII is found, respond with exactly: No PII detected."#;

/// Build the detection system prompt for the given delimiters.
pub fn detection_system_prompt(open: &str, close: &str) -> String {
    PII_DETECTION_SYSTEM_TEMPLATE
        .replace("{open}", open)
        .replace("{close}", close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters_are_substituted() {
        let prompt = detection_system_prompt("<s>", "</s>");
        assert!(prompt.contains("<s>John Doe</s>"));
        assert!(!prompt.contains("{open}"));
    }
}
