use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{Classifier, ClassifierRequest};
use crate::error::{ExpensortError, Result};

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Non-streaming client for the Responses endpoint.
pub struct OpenAiClassifier {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(api_key: String, base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/v1/responses", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    /// Build from the environment. A missing key is reported before any
    /// request is attempted.
    pub fn from_env(model: &str) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ExpensortError::MissingCredential(API_KEY_VAR.to_string()))?;
        let base_url = std::env::var(BASE_URL_VAR).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(api_key, &base_url, model)
    }
}

/// Map a non-success status to the error the retry policy expects.
pub fn status_error(status: u16, body: &str) -> ExpensortError {
    let message: String = body.chars().take(500).collect();
    if status == 429 || (500..600).contains(&status) {
        ExpensortError::Transient { status, message }
    } else {
        ExpensortError::Transport(format!("HTTP {status}: {message}"))
    }
}

impl Classifier for OpenAiClassifier {
    fn model(&self) -> &str {
        &self.model
    }

    fn classify(&self, request: &ClassifierRequest) -> Result<Value> {
        let started = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": &self.model,
                "instructions": &request.instructions,
                "input": &request.input,
                "text": { "format": &request.response_format },
            }))
            .send()
            .map_err(|e| ExpensortError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text()?;
        debug!(
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "classifier response"
        );
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| ExpensortError::MalformedResponse(format!("response body is not JSON: {e}")))
    }
}
