//! Review result extraction and normalization.
//!
//! Two paths produce a review:
//! - Trusted: the agent runtime's schema-validated structured output.
//! - Best-effort (`scrape`): JSON recovered from the free-text transcript,
//!   only consulted when no structured output exists.
//!
//! Precedence: structured > last fenced JSON block > whole-text JSON > regex scrape.

use crate::types::ReviewOutput;
use serde_json::Value;

/// Score used when the agent omits a score or returns something non-numeric.
pub const DEFAULT_SCORE: u8 = 5;
pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 10;

/// Where a parsed review came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewSource {
    /// Schema-validated structured output channel.
    Structured,
    /// The last ```json fenced block in the transcript.
    FencedBlock,
    /// The whole transcript parsed as one JSON object.
    WholeText,
    /// A brace-delimited span located by pattern matching.
    Scraped,
}

impl ReviewSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::FencedBlock => "fenced_block",
            Self::WholeText => "whole_text",
            Self::Scraped => "scraped",
        }
    }

    /// Whether this came from the best-effort text scraper.
    pub fn is_best_effort(&self) -> bool {
        !matches!(self, Self::Structured)
    }
}

/// A normalized review plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReview {
    pub output: ReviewOutput,
    pub source: ReviewSource,
}

/// JSON schema handed to the agent runtime for the structured output channel.
pub fn review_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "easeScore": { "type": "integer", "minimum": 1, "maximum": 10 },
            "confidenceScore": { "type": "integer", "minimum": 1, "maximum": 10 },
            "spec": { "type": "string" },
            "impactReport": { "type": "string" },
            "affectedFiles": { "type": "array", "items": { "type": "string" } },
            "risks": { "type": "string" }
        },
        "required": ["easeScore", "confidenceScore", "spec", "impactReport", "affectedFiles"]
    })
}

/// Extract a review from a finished agent session.
///
/// `structured` is the runtime's structured output, `text` the transcript.
/// Returns `None` when neither yields an object with a non-empty `spec`.
pub fn parse_review(structured: Option<&Value>, text: Option<&str>) -> Option<ParsedReview> {
    if let Some(output) = structured.and_then(normalize) {
        return Some(ParsedReview {
            output,
            source: ReviewSource::Structured,
        });
    }

    let text = text?;
    let (value, source) = scrape::extract(text)?;
    Some(ParsedReview {
        output: normalize(&value)?,
        source,
    })
}

/// Coerce a raw JSON value into a review. Scores are clamped, defaults filled.
pub fn normalize(value: &Value) -> Option<ReviewOutput> {
    value.as_object()?;

    let spec = string_field(value, &["spec"])?;
    if spec.trim().is_empty() {
        return None;
    }

    let affected_files = field(value, &["affectedFiles", "affected_files"])
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let risks = string_field(value, &["risks"]).filter(|r| !r.trim().is_empty());

    Some(ReviewOutput {
        ease_score: clamp_score(field(value, &["easeScore", "ease_score"])),
        confidence_score: clamp_score(field(value, &["confidenceScore", "confidence_score"])),
        spec,
        impact_report: string_field(value, &["impactReport", "impact_report", "impact"])
            .unwrap_or_default(),
        affected_files,
        risks,
    })
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k)).filter(|v| !v.is_null())
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    field(value, keys).and_then(Value::as_str).map(str::to_string)
}

/// Clamp a raw score into `[1, 10]`.
///
/// Numbers are rounded; numeric strings are parsed. Anything else (absent,
/// non-numeric, NaN) yields [`DEFAULT_SCORE`].
pub fn clamp_score(raw: Option<&Value>) -> u8 {
    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    clamp_number(number)
}

/// Clamp an optional float into `[1, 10]`, defaulting non-finite values.
pub fn clamp_number(number: Option<f64>) -> u8 {
    match number {
        Some(n) if n.is_finite() => {
            n.round().clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8
        }
        _ => DEFAULT_SCORE,
    }
}

/// Best-effort JSON recovery from free text.
///
/// Agents sometimes draft JSON before settling on a final answer, so the last
/// candidate always wins over earlier ones.
pub mod scrape {
    use super::ReviewSource;
    use regex::Regex;
    use serde_json::Value;
    use std::sync::OnceLock;

    fn fenced_re() -> Option<&'static Regex> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").ok())
            .as_ref()
    }

    fn span_re() -> Option<&'static Regex> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok()).as_ref()
    }

    /// Run the fallback chain: fenced block, whole text, regex span.
    pub fn extract(text: &str) -> Option<(Value, ReviewSource)> {
        if let Some(value) = last_fenced_object(text) {
            return Some((value, ReviewSource::FencedBlock));
        }
        if let Some(value) = whole_text_object(text) {
            return Some((value, ReviewSource::WholeText));
        }
        scraped_object(text).map(|value| (value, ReviewSource::Scraped))
    }

    /// The last fenced code block whose content parses as a JSON object.
    pub fn last_fenced_object(text: &str) -> Option<Value> {
        fenced_re()?
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| parse_object(m.as_str()))
            .last()
    }

    /// The entire text as a single JSON object.
    pub fn whole_text_object(text: &str) -> Option<Value> {
        parse_object(text)
    }

    /// Widest `{...}` span, then the last balanced object that parses.
    pub fn scraped_object(text: &str) -> Option<Value> {
        if let Some(value) = span_re()
            .and_then(|re| re.find(text))
            .and_then(|m| parse_object(m.as_str()))
        {
            return Some(value);
        }
        balanced_objects(text).into_iter().rev().find_map(parse_object)
    }

    fn parse_object(s: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(s.trim()) {
            Ok(value) if value.is_object() => Some(value),
            _ => None,
        }
    }

    /// Top-level brace-balanced spans, ignoring braces inside strings.
    fn balanced_objects(text: &str) -> Vec<&str> {
        let mut spans = Vec::new();
        let mut depth = 0usize;
        let mut start = None;
        let mut in_string = false;
        let mut escaped = false;

        for (i, c) in text.char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' if depth > 0 => in_string = true,
                '{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                '}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            spans.push(&text[s..=i]);
                        }
                    }
                }
                _ => {}
            }
        }
        spans
    }
}
