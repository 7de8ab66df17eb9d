/// Errors produced by a counter store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but rejected or failed the command.
    #[error("Counter store command failed: {0}")]
    Command(String),
}

/// Errors produced while decoding a raw job message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed job message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Job message is missing `{0}`")]
    MissingField(&'static str),
}

/// Errors produced while answering an admission check for a raw message.
///
/// Callers at the fetch boundary treat every variant as "not throttled".
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Admission check failed: {0}")]
    Store(#[from] StoreError),
}
