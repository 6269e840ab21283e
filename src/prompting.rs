use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ExpensortError, Result};
use crate::models::TransactionRecord;
use crate::taxonomy::Taxonomy;

/// Field order of every serialized page item.
pub const FIELD_ORDER: [&str; 7] = ["idx", "id", "description", "amount", "date", "merchant", "memo"];

pub const SCHEMA_NAME: &str = "expense_categories";

// Struct field order drives serialization order; keep it in sync with FIELD_ORDER.
#[derive(Serialize)]
struct PageItem<'a> {
    idx: usize,
    id: Option<&'a str>,
    description: Option<&'a str>,
    amount: Option<&'a str>,
    date: Option<&'a str>,
    merchant: Option<&'a str>,
    memo: Option<&'a str>,
}

/// JSON array of a page's records, `idx` counting from 0 within the page.
pub fn serialize_page(records: &[&TransactionRecord]) -> Result<String> {
    let items: Vec<PageItem> = records
        .iter()
        .enumerate()
        .map(|(idx, r)| PageItem {
            idx,
            id: r.id.as_deref(),
            description: r.description.as_deref(),
            amount: r.amount.as_deref(),
            date: r.date.as_deref(),
            merchant: r.merchant.as_deref(),
            memo: r.memo.as_deref(),
        })
        .collect();
    Ok(serde_json::to_string(&items)?)
}

pub fn build_system_instructions(taxonomy: &Taxonomy) -> String {
    let mut text = String::from(
        "You are an agent that categorizes credit card transactions using the provided \
         two-level taxonomy. Choose exactly one category per transaction. Prefer the most \
         specific child category that clearly fits; otherwise choose the best parent.",
    );
    match taxonomy.fallback_label() {
        Some(label) => text.push_str(&format!(
            " If nothing fits, use \"{label}\"."
        )),
        None => text.push_str(" Always choose the closest listed category."),
    }
    text.push_str(
        " Never invent categories. Output JSON only that conforms to the specified schema.",
    );
    text
}

/// Taxonomy rendered as an indented two-level list of display names.
pub fn hierarchy_text(taxonomy: &Taxonomy) -> String {
    let mut lines = vec![
        "Taxonomy (two levels):".to_string(),
        "- Prefer a child when it clearly fits; otherwise use the parent.".to_string(),
    ];
    for parent in taxonomy.top_level() {
        lines.push(format!("  * {}", parent.display_name));
        for child in taxonomy.children_of(&parent.code) {
            lines.push(format!("    - {}", child.display_name));
        }
    }
    lines.join("\n") + "\n"
}

pub fn build_user_content(page_json: &str, taxonomy: &Taxonomy) -> String {
    format!(
        "Categorize each transaction below. For every item return its idx and id unchanged, \
         a category, a one-sentence rationale, and a confidence score between 0 and 1. \
         Set revised_category, revised_rationale and revised_score only when you reconsidered \
         the first choice, otherwise null. List citations only when outside sources were used.\n\n\
         {}\
         Transactions JSON (UTF-8). Begin after the next line with \
         BEGIN_TRANSACTIONS_JSON and end at END_TRANSACTIONS_JSON:\n\
         BEGIN_TRANSACTIONS_JSON\n\
         {page_json}\n\
         END_TRANSACTIONS_JSON",
        hierarchy_text(taxonomy)
    )
}

/// Strict structured-output envelope for one page.
pub fn build_response_format(taxonomy: &Taxonomy) -> Result<Value> {
    let codes = taxonomy.codes();
    if codes.is_empty() {
        return Err(ExpensortError::Taxonomy("taxonomy must contain at least one code".into()));
    }
    let mut nullable_codes: Vec<Value> = codes.iter().map(|c| json!(c)).collect();
    nullable_codes.push(Value::Null);

    Ok(json!({
        "type": "json_schema",
        "name": SCHEMA_NAME,
        "schema": {
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "idx": {"type": "integer"},
                            "id": {"type": ["string", "null"]},
                            "category": {"type": "string", "enum": codes},
                            "rationale": {"type": "string"},
                            "score": {"type": "number", "minimum": 0, "maximum": 1},
                            "revised_category": {"type": ["string", "null"], "enum": nullable_codes},
                            "revised_rationale": {"type": ["string", "null"]},
                            "revised_score": {"type": ["number", "null"]},
                            "citations": {"type": ["array", "null"], "items": {"type": "string"}}
                        },
                        "required": [
                            "idx", "id", "category", "rationale", "score",
                            "revised_category", "revised_rationale", "revised_score", "citations"
                        ],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["results"],
            "additionalProperties": false
        },
        "strict": true
    }))
}
