#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event log closed for session {0}")]
    Closed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
