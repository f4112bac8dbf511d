use thiserror::Error;
use tokio::task::JoinError;

/// The primary error type for the `finrag-core` library.
///
/// This enum consolidates all failure modes of the retrieval engine, the
/// provider clients and the orchestrator into a single structured type.
/// Tool boundaries never surface it directly: they convert it into a string
/// the model can read.
#[derive(Debug, Error)]
pub enum FinRagError {
    /// A configuration problem, such as a malformed `models.json`, an
    /// unknown model name or a missing environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error specific to the retrieval process (embedding, indexing, or searching).
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// The corpus could not be fetched or did not have the expected shape.
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// A parquet corpus file could not be decoded.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Network-level failure of an API request (timeouts, DNS, TLS).
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// A non-successful response from the provider's API (e.g., 4xx or 5xx).
    /// Includes the HTTP status code and the response body for debugging.
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// The provider's response body was not valid JSON or did not match
    /// the expected structure.
    #[error("Response parse error: {0}")]
    ResponseParse(String),

    /// An error originating from the LMDB environment backing the vector index.
    #[error("Vector index error: {0}")]
    Heed(#[from] heed::Error),

    /// An error from the arroy nearest-neighbour search.
    #[error("Vector search error: {0}")]
    Arroy(#[from] arroy::Error),

    /// An error from the SQLite document store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tool failed in a way that could not be reported back to the model.
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// The orchestrator could not complete a turn.
    #[error("Chat session error: {0}")]
    Chat(String),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] JoinError),
}

impl FinRagError {
    /// Returns `true` when the failure looks like the requested model does not
    /// exist (or is not visible to the configured credentials).
    pub fn is_model_not_found(&self) -> bool {
        match self {
            FinRagError::Api { status, .. } => *status == 404,
            FinRagError::Request(err) => err.status().map_or(false, |s| s.as_u16() == 404),
            other => other.to_string().contains("404"),
        }
    }
}

impl From<serde_json::Error> for FinRagError {
    fn from(err: serde_json::Error) -> Self {
        FinRagError::ResponseParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FinRagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_404_is_model_not_found() {
        let err = FinRagError::Api { status: 404, body: "models/gemini-x is not found".into() };
        assert!(err.is_model_not_found());
    }

    #[test]
    fn other_statuses_are_not_model_not_found() {
        let err = FinRagError::Api { status: 500, body: "internal".into() };
        assert!(!err.is_model_not_found());
    }

    #[test]
    fn textual_404_is_detected() {
        let err = FinRagError::Chat("upstream said 404 Not Found".into());
        assert!(err.is_model_not_found());
    }
}
