/// Error types shared by the retrieval and verification crates.
///
/// These errors represent failures in infrastructure components (vector DB, embeddings,
/// remote reasoning models). Application-specific errors live in each
/// service crate and wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("vector db error: {0}")]
    VectorDb(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("reasoning error: {0}")]
    Reasoning(String),
}
