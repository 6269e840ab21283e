use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExpensortError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid response: {0}")]
    MalformedResponse(String),

    #[error("Classifier returned HTTP {status}: {message}")]
    Transient { status: u16, message: String },

    #[error("Classifier request failed: {0}")]
    Transport(String),

    #[error("Categorization failed for page {page_index} (base={base}, count={count}) after {attempts} attempts: {source}")]
    PageFailed {
        page_index: usize,
        base: usize,
        count: usize,
        attempts: u32,
        #[source]
        source: Box<ExpensortError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0} is not set in the environment.")]
    MissingCredential(String),

    #[error("CSV header mismatch: {0}")]
    HeaderMismatch(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Taxonomy error: {0}")]
    Taxonomy(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl ExpensortError {
    /// Rate limits (429) and server errors (5xx) are the only failures worth
    /// repeating; everything else fails the page on the first attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExpensortError>;
