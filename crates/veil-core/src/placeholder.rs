//! `$N` placeholder codec.
//!
//! Generated answers reference PII through 1-based placeholders: `$1` is the first detected
//! value, `$2` the second and so on. Decoding never fails; a placeholder without a matching
//! value is kept as literal text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").expect("placeholder regex"));

/// One piece of decoded text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `index` is the 1-based placeholder number, `value` is `values[index - 1]`.
    Token { index: usize, value: String },
}

impl Segment {
    pub fn is_token(&self) -> bool {
        matches!(self, Segment::Token { .. })
    }
}

/// Splits `text` into literal runs and resolved tokens.
pub fn decode(text: &str, values: &[String]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let resolved = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .filter(|&n| n >= 1)
            .and_then(|n| values.get(n - 1).map(|v| (n, v)));

        let Some((index, value)) = resolved else {
            continue;
        };
        literal.push_str(&text[last..whole.start()]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Token {
            index,
            value: value.clone(),
        });
        last = whole.end();
    }

    literal.push_str(&text[last..]);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Placeholder numbers in order of appearance, repeats included. `$0` and numbers too large
/// to represent are skipped.
pub fn placeholder_indices(text: &str) -> Vec<usize> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<usize>().ok())
        .filter(|&n| n >= 1)
        .collect()
}

/// How the placeholders in an answer line up with the detected values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationReport {
    /// Distinct placeholder numbers, ascending.
    pub placeholders: Vec<usize>,
    pub value_count: usize,
    /// Placeholders with no value to resolve to; they render literally.
    pub unresolved: Vec<usize>,
    /// 1-based value positions never referenced by a placeholder.
    pub unreferenced: Vec<usize>,
}

impl CorrelationReport {
    pub fn is_aligned(&self) -> bool {
        self.unresolved.is_empty() && self.unreferenced.is_empty()
    }
}

/// Compares placeholders with detected values. Informational only; nothing is rewritten.
pub fn audit(text: &str, values: &[String]) -> CorrelationReport {
    let mut placeholders = placeholder_indices(text);
    placeholders.sort_unstable();
    placeholders.dedup();

    let unresolved = placeholders
        .iter()
        .copied()
        .filter(|&n| n > values.len())
        .collect();
    let unreferenced = (1..=values.len())
        .filter(|n| placeholders.binary_search(n).is_err())
        .collect();

    CorrelationReport {
        placeholders,
        value_count: values.len(),
        unresolved,
        unreferenced,
    }
}
