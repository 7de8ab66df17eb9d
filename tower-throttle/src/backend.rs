use std::collections::HashSet;
use std::future::Future;

use tower::BoxError;

/// A unit of work retrieved from a queue backend.
pub trait WorkItem: Send + 'static {
    /// The queue the work was retrieved from.
    fn queue_name(&self) -> &str;

    /// The job payload, as stored by the backend.
    fn raw_message(&self) -> &str;
}

/// A queue backend that can leave queues out of a single retrieval.
pub trait Backend: Send + Sync {
    type Work: WorkItem;

    /// Retrieve one work item from any queue not in `excluded`.
    ///
    /// May wait for work up to the backend's own bounded timeout. `Ok(None)` means no work
    /// arrived in time.
    fn retrieve_work(
        &self,
        excluded: &HashSet<String>,
    ) -> impl Future<Output = Result<Option<Self::Work>, BoxError>> + Send;

    /// Put throttled work back at the front of its own queue.
    fn requeue_throttled(
        &self,
        work: Self::Work,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Return unfinished work to its queues, e.g. on shutdown.
    fn bulk_requeue(
        &self,
        work: Vec<Self::Work>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Queue state changes understood by a [`PausableFetch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    Pause,
    Unpause,
}

/// A queue backend that models exclusion as explicit pause state instead of an argument.
///
/// Use [`Pausing`] to turn one into a [`Backend`].
pub trait PausableFetch: Send + Sync {
    type Work: WorkItem;

    fn notify(&self, action: Notification, queue: &str);

    /// Retrieve one work item from any queue which is not paused.
    fn retrieve_work(&self) -> impl Future<Output = Result<Option<Self::Work>, BoxError>> + Send;

    fn requeue_throttled(
        &self,
        work: Self::Work,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    fn bulk_requeue(
        &self,
        work: Vec<Self::Work>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Adapts a [`PausableFetch`] to [`Backend`].
///
/// Excluded queues are paused for the duration of one retrieval and unpaused afterwards,
/// including when the retrieval is cancelled.
#[derive(Clone, Debug)]
pub struct Pausing<P> {
    inner: P,
}

impl<P> Pausing<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &P {
        &self.inner
    }
}

struct PausedQueues<'a, P: PausableFetch> {
    fetch: &'a P,
    queues: Vec<String>,
}

impl<'a, P: PausableFetch> PausedQueues<'a, P> {
    fn pause(fetch: &'a P, excluded: &HashSet<String>) -> Self {
        let queues: Vec<String> = excluded.iter().cloned().collect();
        for queue in &queues {
            fetch.notify(Notification::Pause, queue);
        }
        Self { fetch, queues }
    }
}

impl<P: PausableFetch> Drop for PausedQueues<'_, P> {
    fn drop(&mut self) {
        for queue in &self.queues {
            self.fetch.notify(Notification::Unpause, queue);
        }
    }
}

impl<P: PausableFetch> Backend for Pausing<P> {
    type Work = P::Work;

    async fn retrieve_work(
        &self,
        excluded: &HashSet<String>,
    ) -> Result<Option<Self::Work>, BoxError> {
        let _paused = PausedQueues::pause(&self.inner, excluded);
        self.inner.retrieve_work().await
    }

    fn requeue_throttled(
        &self,
        work: Self::Work,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        self.inner.requeue_throttled(work)
    }

    fn bulk_requeue(
        &self,
        work: Vec<Self::Work>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        self.inner.bulk_requeue(work)
    }
}
