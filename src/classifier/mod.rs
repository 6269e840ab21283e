pub mod openai;
pub mod response;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use response::{decode_body, parse_and_align};

/// One page worth of input for the remote classifier.
#[derive(Debug, Clone)]
pub struct ClassifierRequest {
    pub instructions: String,
    pub input: String,
    pub response_format: Value,
}

/// Blocking transport to the classification model. Returns the raw response
/// body; decoding and validation happen in [`response`].
///
/// Implementations report HTTP 429/5xx as `ExpensortError::Transient` so the
/// retry policy can tell them apart from permanent failures.
pub trait Classifier: Send + Sync {
    fn model(&self) -> &str;
    fn classify(&self, request: &ClassifierRequest) -> Result<Value>;
}

/// What to do when the model names a category outside the taxonomy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidCategoryPolicy {
    #[default]
    Fail,
    /// Substitute "Other", then "Unknown", when the taxonomy has one.
    Fallback,
}

impl std::str::FromStr for InvalidCategoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown invalid-category policy: {other}")),
        }
    }
}
