use crate::rag::cache::RequestToken;

pub type Result<T, E = RagError> = std::result::Result<T, E>;

/// Failures surfaced by the retrieval/generation/citation pipeline.
///
/// Every external call is mapped into exactly one variant at its boundary so
/// the chat front end can render a single failure state. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("search request failed: {0}")]
    Retrieval(String),
    #[error("answer generation failed: {0}")]
    Generation(String),
    #[error("no cached search result for request {0}")]
    CacheMiss(RequestToken),
    #[error("malformed source link `{0}`")]
    MalformedSourceLink(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("URL signing failed: {0}")]
    Signing(String),
}
