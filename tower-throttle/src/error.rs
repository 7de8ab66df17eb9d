use tower::BoxError;

/// Errors produced while fetching throttled work.
///
/// Limiter failures never appear here: a job that cannot be checked is admitted.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The backend could not retrieve or return work.
    #[error("Queue backend failed: {0}")]
    Backend(BoxError),

    /// A throttled job could not be put back on its queue.
    ///
    /// The job is left with the backend's own recovery mechanism.
    #[error("Failed to requeue throttled work: {0}")]
    Requeue(BoxError),
}
