use serde_json::{Map, Value};

use super::InvalidCategoryPolicy;
use crate::error::{ExpensortError, Result};
use crate::models::Decision;
use crate::taxonomy::Taxonomy;

/// Places a Responses-style body may carry the model's text, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextLocation {
    /// Top-level `output_text`.
    OutputText,
    /// `output[0].content[0].text`.
    FirstContent,
    /// First `output[*].content[*]` item of type `output_text`.
    AnyOutputText,
}

pub const EXTRACTION_ORDER: [TextLocation; 3] = [
    TextLocation::OutputText,
    TextLocation::FirstContent,
    TextLocation::AnyOutputText,
];

impl TextLocation {
    pub fn extract<'a>(&self, body: &'a Value) -> Option<&'a str> {
        let text = match self {
            Self::OutputText => body.get("output_text")?.as_str(),
            Self::FirstContent => body.pointer("/output/0/content/0/text")?.as_str(),
            Self::AnyOutputText => body
                .get("output")?
                .as_array()?
                .iter()
                .filter_map(|o| o.get("content")?.as_array())
                .flatten()
                .find(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))?
                .get("text")?
                .as_str(),
        }?;
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

pub fn extract_text(body: &Value) -> Option<&str> {
    EXTRACTION_ORDER.iter().find_map(|loc| loc.extract(body))
}

/// Pull the structured document out of a raw transport response.
pub fn decode_body(raw: &Value) -> Result<Value> {
    let text = extract_text(raw)
        .ok_or_else(|| ExpensortError::MalformedResponse("no output text in response".into()))?;
    serde_json::from_str(text)
        .map_err(|e| ExpensortError::MalformedResponse(format!("output text is not JSON: {e}")))
}

fn malformed(msg: impl Into<String>) -> ExpensortError {
    ExpensortError::MalformedResponse(msg.into())
}

fn resolve_category(
    raw: &str,
    taxonomy: &Taxonomy,
    policy: InvalidCategoryPolicy,
) -> Result<String> {
    let cat = raw.trim();
    if taxonomy.contains(cat) {
        return Ok(cat.to_string());
    }
    match (policy, taxonomy.fallback_label()) {
        (InvalidCategoryPolicy::Fallback, Some(label)) => {
            tracing::warn!(category = raw, fallback = label, "category outside taxonomy; substituting");
            Ok(label.to_string())
        }
        (InvalidCategoryPolicy::Fallback, None) => Err(malformed(format!(
            "invalid category {raw:?} and no in-taxonomy fallback available"
        ))),
        (InvalidCategoryPolicy::Fail, _) => Err(malformed(format!("invalid category value {raw:?}"))),
    }
}

fn score_field(item: &Map<String, Value>, key: &str, idx: usize) -> Result<Option<f64>> {
    match item.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_f64()
                .ok_or_else(|| malformed(format!("{key} must be a number (idx {idx})")))?;
            if !(0.0..=1.0).contains(&s) {
                return Err(malformed(format!("{key} {s} outside [0, 1] (idx {idx})")));
            }
            Ok(Some(s))
        }
    }
}

fn optional_text(item: &Map<String, Value>, key: &str, idx: usize) -> Result<Option<String>> {
    match item.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(malformed(format!("{key} must be a string or null (idx {idx})"))),
    }
}

/// Trimmed, blanks dropped; `None` when nothing remains.
pub fn normalize_citations(value: Option<&Value>) -> Option<Vec<String>> {
    let items: Vec<String> = value?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Validate a decoded page body and return its decisions ordered by `idx`.
pub fn parse_and_align(
    body: &Value,
    count: usize,
    taxonomy: &Taxonomy,
    policy: InvalidCategoryPolicy,
) -> Result<Vec<Decision>> {
    let obj = body
        .as_object()
        .ok_or_else(|| malformed("expected a JSON object at top level"))?;
    let results = obj
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing or non-array 'results'"))?;
    if results.len() != count {
        return Err(malformed(format!(
            "expected {count} results, got {}",
            results.len()
        )));
    }

    let mut slots: Vec<Option<Decision>> = vec![None; count];
    for item in results {
        let item = item
            .as_object()
            .ok_or_else(|| malformed("each result must be an object"))?;
        let idx = item
            .get("idx")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("'idx' must be a non-negative integer"))? as usize;
        if idx >= count {
            return Err(malformed(format!("'idx' out of range: {idx}")));
        }
        if slots[idx].is_some() {
            return Err(malformed(format!("duplicate idx {idx}")));
        }

        let raw_category = item
            .get("category")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| malformed(format!("'category' must be a non-empty string (idx {idx})")))?;
        let category = resolve_category(raw_category, taxonomy, policy)?;

        let rationale = item
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| malformed(format!("'rationale' must be a non-empty string (idx {idx})")))?
            .to_string();
        let score = score_field(item, "score", idx)?
            .ok_or_else(|| malformed(format!("'score' is required (idx {idx})")))?;

        let revised_category = optional_text(item, "revised_category", idx)?
            .map(|c| resolve_category(&c, taxonomy, policy))
            .transpose()?;

        slots[idx] = Some(Decision {
            category,
            rationale,
            score,
            revised_category,
            revised_rationale: optional_text(item, "revised_rationale", idx)?,
            revised_score: score_field(item, "revised_score", idx)?,
            citations: normalize_citations(item.get("citations")),
        });
    }

    let missing: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect();
    if !missing.is_empty() {
        return Err(malformed(format!("missing indices {missing:?}")));
    }
    Ok(slots.into_iter().flatten().collect())
}
