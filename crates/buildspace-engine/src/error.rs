use buildspace_core::errors::ProtocolError;
use buildspace_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session's event log rejected a write. Only happens when a closed
    /// session keeps receiving traffic, so the session must be torn down.
    #[error("event log error: {0}")]
    Store(#[from] StoreError),

    /// The conversation was closed before this request reached it.
    #[error("session closed")]
    Closed,
}
