use serde::{Deserialize, Serialize};

/// Canonical view of one bank-exported row, as produced by an importer.
/// Every field is a trimmed string or absent; the pipeline only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Option<String>,
    pub description: Option<String>,
    pub amount: Option<String>,
    pub date: Option<String>,
    pub merchant: Option<String>,
    pub memo: Option<String>,
}

/// One classifier decision for a single exemplar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub category: String,
    pub rationale: String,
    pub score: f64,
    #[serde(default)]
    pub revised_category: Option<String>,
    #[serde(default)]
    pub revised_rationale: Option<String>,
    #[serde(default)]
    pub revised_score: Option<f64>,
    #[serde(default)]
    pub citations: Option<Vec<String>>,
}

impl Decision {
    pub fn effective_category(&self) -> &str {
        self.revised_category.as_deref().unwrap_or(&self.category)
    }

    pub fn effective_score(&self) -> f64 {
        self.revised_score.unwrap_or(self.score)
    }
}

/// A transaction paired with its effective category and the evidence behind it.
/// `category` already reflects `revised_category` when the model supplied one.
#[derive(Debug, Clone, PartialEq)]
pub struct CategorizedTransaction {
    pub transaction: TransactionRecord,
    pub category: String,
    pub rationale: String,
    pub score: f64,
    pub revised_category: Option<String>,
    pub revised_rationale: Option<String>,
    pub revised_score: Option<f64>,
    pub citations: Option<Vec<String>>,
}

impl CategorizedTransaction {
    pub fn from_decision(transaction: TransactionRecord, decision: &Decision) -> Self {
        Self {
            transaction,
            category: decision.effective_category().to_string(),
            rationale: decision.rationale.clone(),
            score: decision.score,
            revised_category: decision.revised_category.clone(),
            revised_rationale: decision.revised_rationale.clone(),
            revised_score: decision.revised_score,
            citations: decision.citations.clone(),
        }
    }

    /// Category assigned outside the classifier (rules, prior decisions, review).
    pub fn assigned(transaction: TransactionRecord, category: &str, rationale: &str) -> Self {
        Self {
            transaction,
            category: category.to_string(),
            rationale: rationale.to_string(),
            score: 1.0,
            revised_category: None,
            revised_rationale: None,
            revised_score: None,
            citations: None,
        }
    }

    pub fn effective_score(&self) -> f64 {
        self.revised_score.unwrap_or(self.score)
    }
}

/// Closed set of labels recorded with a stored category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategorySource {
    Llm,
    Manual,
    Rule,
    Import,
    Unknown,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Manual => "manual",
            Self::Rule => "rule",
            Self::Import => "import",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(revised: Option<&str>) -> Decision {
        Decision {
            category: "Restaurants".into(),
            rationale: "dining".into(),
            score: 0.6,
            revised_category: revised.map(str::to_string),
            revised_rationale: None,
            revised_score: revised.map(|_| 0.9),
            citations: None,
        }
    }

    #[test]
    fn test_effective_category_prefers_revision() {
        let tx = TransactionRecord::default();
        let plain = CategorizedTransaction::from_decision(tx.clone(), &decision(None));
        assert_eq!(plain.category, "Restaurants");
        assert_eq!(plain.effective_score(), 0.6);

        let revised = CategorizedTransaction::from_decision(tx, &decision(Some("Coffee Shops")));
        assert_eq!(revised.category, "Coffee Shops");
        assert_eq!(revised.effective_score(), 0.9);
    }

    #[test]
    fn test_category_source_labels() {
        assert_eq!(CategorySource::Llm.as_str(), "llm");
        assert_eq!(CategorySource::Manual.as_str(), "manual");
        assert_eq!(CategorySource::Unknown.as_str(), "unknown");
    }
}
