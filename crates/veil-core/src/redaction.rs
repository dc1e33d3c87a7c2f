//! Redaction renderer: placeholder text plus PII values become maskable tokens.
//!
//! Reveal state lives only in a [`RenderedText`]; it is never written back to a turn, so a
//! reload always starts fully masked.

use serde::Serialize;

use crate::placeholder::{self, Segment};

/// Default masked display for a hidden token.
pub const DEFAULT_MASK: &str = "██████";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RenderedSegment {
    Text { text: String },
    Token {
        /// 1-based placeholder number.
        index: usize,
        value: String,
        revealed: bool,
    },
}

/// An answer turn rendered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedText {
    segments: Vec<RenderedSegment>,
    #[serde(skip)]
    mask: String,
}

impl RenderedText {
    pub fn new(text: &str, values: &[String]) -> Self {
        Self::with_mask(text, values, DEFAULT_MASK)
    }

    pub fn with_mask(text: &str, values: &[String], mask: &str) -> Self {
        let segments = placeholder::decode(text, values)
            .into_iter()
            .map(|segment| match segment {
                Segment::Literal(text) => RenderedSegment::Text { text },
                Segment::Token { index, value } => RenderedSegment::Token {
                    index,
                    value,
                    revealed: false,
                },
            })
            .collect();
        Self {
            segments,
            mask: mask.to_string(),
        }
    }

    pub fn segments(&self) -> &[RenderedSegment] {
        &self.segments
    }

    pub fn token_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, RenderedSegment::Token { .. }))
            .count()
    }

    /// Distinct placeholder numbers present, ascending.
    pub fn indices(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .segments
            .iter()
            .filter_map(|s| match s {
                RenderedSegment::Token { index, .. } => Some(*index),
                RenderedSegment::Text { .. } => None,
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Flips every token with the given placeholder number. Returns false when none exist.
    pub fn toggle(&mut self, index: usize) -> bool {
        self.update(index, |revealed| !revealed)
    }

    pub fn reveal(&mut self, index: usize) -> bool {
        self.update(index, |_| true)
    }

    pub fn conceal(&mut self, index: usize) -> bool {
        self.update(index, |_| false)
    }

    pub fn conceal_all(&mut self) {
        for segment in &mut self.segments {
            if let RenderedSegment::Token { revealed, .. } = segment {
                *revealed = false;
            }
        }
    }

    fn update(&mut self, index: usize, f: impl Fn(bool) -> bool) -> bool {
        let mut found = false;
        for segment in &mut self.segments {
            if let RenderedSegment::Token {
                index: i, revealed, ..
            } = segment
            {
                if *i == index {
                    *revealed = f(*revealed);
                    found = true;
                }
            }
        }
        found
    }

    /// Current view, honoring reveal state.
    pub fn display(&self) -> String {
        self.render(|_, value, revealed| {
            if revealed {
                value.to_string()
            } else {
                self.mask.clone()
            }
        })
    }

    /// Every token masked, regardless of reveal state.
    pub fn masked(&self) -> String {
        self.render(|_, _, _| self.mask.clone())
    }

    /// Back to `$N` form.
    pub fn placeholder_text(&self) -> String {
        self.render(|index, _, _| format!("${}", index))
    }

    fn render(&self, token: impl Fn(usize, &str, bool) -> String) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                RenderedSegment::Text { text } => out.push_str(text),
                RenderedSegment::Token {
                    index,
                    value,
                    revealed,
                } => out.push_str(&token(*index, value, *revealed)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pii() -> Vec<String> {
        vec!["John Doe".into(), "02/02/1994".into()]
    }

    #[test]
    fn tokens_start_masked() {
        let rendered = RenderedText::new("Hello $1, born $2", &pii());
        assert_eq!(rendered.token_count(), 2);
        assert_eq!(rendered.display(), "Hello ██████, born ██████");
    }

    #[test]
    fn toggle_reveals_and_hides_one_index() {
        let mut rendered = RenderedText::new("Hello $1, born $2", &pii());
        assert!(rendered.toggle(1));
        assert_eq!(rendered.display(), "Hello John Doe, born ██████");
        assert!(rendered.toggle(1));
        assert_eq!(rendered.display(), "Hello ██████, born ██████");
        assert!(!rendered.toggle(7));
    }

    #[test]
    fn masked_and_placeholder_views_ignore_reveal_state() {
        let mut rendered = RenderedText::with_mask("Hi $1 ($1)", &pii(), "***");
        rendered.reveal(1);
        assert_eq!(rendered.display(), "Hi John Doe (John Doe)");
        assert_eq!(rendered.masked(), "Hi *** (***)");
        assert_eq!(rendered.placeholder_text(), "Hi $1 ($1)");
        rendered.conceal_all();
        assert_eq!(rendered.display(), "Hi *** (***)");
    }

    #[test]
    fn unresolved_placeholder_renders_literally() {
        let rendered = RenderedText::new("Call $3 now", &pii());
        assert_eq!(rendered.token_count(), 0);
        assert_eq!(rendered.display(), "Call $3 now");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let rendered = RenderedText::new("Nice to meet you.", &pii());
        assert_eq!(rendered.display(), "Nice to meet you.");
        assert!(rendered.indices().is_empty());
    }
}
