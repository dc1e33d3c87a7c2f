//! Offline adapters driven by a regex heuristic instead of a model.
//!
//! Mock generation greets the user and lists what it found, with every PII value replaced by
//! `$N` (distinct values numbered by first appearance). Mock detection echoes the input with
//! the same values wrapped in delimiters, so the two sides agree without any network.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use veil_core::{
    DetectionAdapter, Generation, GenerationAdapter, GenerationWriter, ProviderError,
    ProviderResult, SpanExtractor, VeilConfig,
};

const MOCK_STREAM_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiKind {
    Name,
    Email,
    Phone,
    Date,
    NationalId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiSpan {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
    pub value: String,
}

static PATTERNS: Lazy<Vec<(PiiKind, Regex)>> = Lazy::new(|| {
    let compile = |p: &str| Regex::new(p).expect("mock PII pattern");
    vec![
        (PiiKind::Email, compile(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")),
        (PiiKind::NationalId, compile(r"\b\d{3}-\d{2}-\d{4}\b")),
        (
            PiiKind::Phone,
            compile(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.-])\d{3}[\s.-]\d{4}\b|\b\d{3}-\d{4}\b"),
        ),
        (
            PiiKind::Date,
            compile(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b|\b\d{4}-\d{2}-\d{2}\b|\b(?:January|February|March|April|May|June|July|August|September|October|November|December) \d{1,2}(?:st|nd|rd|th)?,? \d{4}\b"),
        ),
    ]
});

/// A name introduced by "my name is", "I am", "I'm" or "call me": capitalized words only.
static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i:\bmy name is|\bi am|\bi'm|\bcall me)\s+(\p{Lu}[\p{L}'-]*(?:\s+\p{Lu}[\p{L}'-]*)*)")
        .expect("mock name pattern")
});

/// PII spans in order of appearance. Overlapping matches keep the earliest, then longest.
pub fn find_pii(text: &str) -> Vec<PiiSpan> {
    let mut spans: Vec<PiiSpan> = Vec::new();
    for (kind, re) in PATTERNS.iter() {
        for m in re.find_iter(text) {
            spans.push(PiiSpan {
                kind: *kind,
                start: m.start(),
                end: m.end(),
                value: m.as_str().to_string(),
            });
        }
    }
    for caps in NAME.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            spans.push(PiiSpan {
                kind: PiiKind::Name,
                start: m.start(),
                end: m.end(),
                value: m.as_str().to_string(),
            });
        }
    }
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut out: Vec<PiiSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        if out.last().map_or(true, |prev| span.start >= prev.end) {
            out.push(span);
        }
    }
    out
}

/// The reply mock generation produces for `prompt`.
pub fn mock_reply(prompt: &str) -> String {
    let spans = find_pii(prompt);
    if spans.is_empty() {
        return "Hello! There is no personal information in that message, so nothing needs hiding."
            .to_string();
    }

    // Distinct values in first-appearance order get $1, $2, ...
    let mut distinct: Vec<(&str, PiiKind)> = Vec::new();
    for span in &spans {
        if !distinct.iter().any(|(v, _)| *v == span.value) {
            distinct.push((&span.value, span.kind));
        }
    }
    let name = distinct.iter().position(|(_, k)| *k == PiiKind::Name);
    let others: Vec<String> = distinct
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != name)
        .map(|(i, _)| format!("${}", i + 1))
        .collect();

    let mut reply = match name {
        Some(i) => format!("Hello ${}!", i + 1),
        None => "Hello!".to_string(),
    };
    if !others.is_empty() {
        reply.push_str(" I've noted ");
        reply.push_str(&join_list(&others));
        reply.push('.');
    }
    reply
}

fn join_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// Word-by-word mock generation.
#[derive(Debug, Clone)]
pub struct MockGeneration {
    delay: Duration,
    scripted: Option<String>,
    channel_capacity: usize,
}

impl Default for MockGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGeneration {
    pub fn new() -> Self {
        Self {
            delay: MOCK_STREAM_DELAY,
            scripted: None,
            channel_capacity: 100,
        }
    }

    pub fn from_config(config: &VeilConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity,
            ..Self::new()
        }
    }

    /// Always replies with `reply`, ignoring the prompt.
    pub fn scripted(reply: impl Into<String>) -> Self {
        Self {
            scripted: Some(reply.into()),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl GenerationAdapter for MockGeneration {
    fn name(&self) -> &str {
        "mock-generation"
    }

    async fn generate(&self, prompt: &str, _system: &str) -> ProviderResult<Generation> {
        let reply = self.scripted.clone().unwrap_or_else(|| mock_reply(prompt));
        let delay = self.delay;
        let (mut writer, generation) = GenerationWriter::channel(self.channel_capacity);

        tokio::spawn(async move {
            for word in reply.split_inclusive(' ') {
                if !writer.delta(word).await {
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            writer.complete().await;
        });

        Ok(generation)
    }
}

/// Heuristic detection that answers in the same delimiter format as the live model.
#[derive(Debug, Clone)]
pub struct MockDetection {
    open: String,
    close: String,
    extractor: SpanExtractor,
    fail: bool,
}

impl MockDetection {
    pub fn new(open: &str, close: &str) -> ProviderResult<Self> {
        let extractor = SpanExtractor::new(open, close)
            .map_err(|e| ProviderError::Malformed(format!("span delimiters: {}", e)))?;
        Ok(Self {
            open: open.to_string(),
            close: close.to_string(),
            extractor,
            fail: false,
        })
    }

    pub fn from_config(config: &VeilConfig) -> ProviderResult<Self> {
        Self::new(&config.span_open, &config.span_close)
    }

    /// Detection that always errors, for exercising the degraded path.
    pub fn failing() -> Self {
        Self {
            open: String::new(),
            close: String::new(),
            extractor: SpanExtractor::default(),
            fail: true,
        }
    }

    /// What a detection model would answer for `text`.
    pub fn annotate(&self, text: &str) -> String {
        let spans = find_pii(text);
        if spans.is_empty() {
            return "No PII detected.".to_string();
        }
        let mut out = String::with_capacity(text.len() + spans.len() * 8);
        let mut last = 0;
        for span in spans {
            out.push_str(&text[last..span.start]);
            out.push_str(&self.open);
            out.push_str(&span.value);
            out.push_str(&self.close);
            last = span.end;
        }
        out.push_str(&text[last..]);
        out
    }
}

#[async_trait]
impl DetectionAdapter for MockDetection {
    fn name(&self) -> &str {
        "mock-detection"
    }

    async fn detect(&self, raw: &str) -> ProviderResult<Vec<String>> {
        if self.fail {
            return Err(ProviderError::Transport("mock detection unavailable".to_string()));
        }
        Ok(self.extractor.extract(&self.annotate(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn finds_name_and_birthday_in_order() {
        let spans = find_pii("My name is John Doe and my birthday is 02/02/1994.");
        let values: Vec<&str> = spans.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(values, vec!["John Doe", "02/02/1994"]);
        assert_eq!(spans[0].kind, PiiKind::Name);
        assert_eq!(spans[1].kind, PiiKind::Date);
    }

    #[test]
    fn finds_contact_details() {
        let spans = find_pii("Mail ann@example.com or ring 555-1234; SSN 123-45-6789.");
        let kinds: Vec<PiiKind> = spans.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![PiiKind::Email, PiiKind::Phone, PiiKind::NationalId]);
    }

    #[test]
    fn lowercase_words_after_i_am_are_not_names() {
        assert!(find_pii("I am happy today").is_empty());
    }

    #[test]
    fn reply_numbers_distinct_values() {
        assert_eq!(mock_reply("My name is John Doe"), "Hello $1!");
        assert_eq!(
            mock_reply("My name is John Doe and my birthday is 02/02/1994."),
            "Hello $1! I've noted $2."
        );
        assert_eq!(
            mock_reply("Reach ann@example.com, again ann@example.com, or 555-1234"),
            "Hello! I've noted $1 and $2."
        );
        assert!(!mock_reply("What is the weather like?").contains('$'));
    }

    #[test]
    fn annotate_wraps_spans() {
        let detection = MockDetection::new("<s>", "</s>").unwrap();
        assert_eq!(
            detection.annotate("I'm Ann, ann@example.com"),
            "I'm <s>Ann</s>, <s>ann@example.com</s>"
        );
        assert_eq!(detection.annotate("nothing here"), "No PII detected.");
    }

    #[tokio::test]
    async fn mock_detection_matches_generation_numbering() {
        let prompt = "My name is John Doe and my birthday is 02/02/1994.";
        let detection = MockDetection::new("<s>", "</s>").unwrap();
        let pii = detection.detect(prompt).await.unwrap();
        assert_eq!(pii, vec!["John Doe", "02/02/1994"]);
        assert!(veil_core::placeholder::audit(&mock_reply(prompt), &pii).is_aligned());
    }

    #[tokio::test]
    async fn mock_generation_streams_words() {
        let generation = MockGeneration::scripted("Hello $1 and welcome")
            .with_delay(Duration::ZERO)
            .generate("ignored", "")
            .await
            .unwrap();
        let deltas: Vec<String> = generation
            .events
            .filter_map(|e| async move {
                match e {
                    veil_core::ProtocolEvent::TextDelta { delta, .. } => Some(delta),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hello ", "$1 ", "and ", "welcome"]);
        assert_eq!(generation.text.await.unwrap(), "Hello $1 and welcome");
    }

    #[tokio::test]
    async fn failing_detection_errors() {
        assert!(MockDetection::failing().detect("I am Ann").await.is_err());
    }
}
