use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tower::BoxError;
use tracing::debug;

use crate::backend::Backend;
use crate::backend::Notification;
use crate::backend::PausableFetch;
use crate::backend::WorkItem;
use crate::orphan::OrphanHandler;

/// How long a retrieval waits for work before giving up.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Work retrieved from a [`MemoryBackend`].
///
/// The work stays claimed until it is acknowledged, requeued, or reaped as an orphan.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryWork {
    queue: String,
    message: String,
    claim: u64,
}

impl WorkItem for MemoryWork {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn raw_message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Default)]
struct State {
    // In strict priority order
    queues: Vec<(String, VecDeque<String>)>,
    // Pause counts, so overlapping fetchers can pause the same queue
    paused: HashMap<String, usize>,
    claims: HashMap<u64, (String, String)>,
    next_claim: u64,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> &mut VecDeque<String> {
        let position = match self.queues.iter().position(|(queue, _)| queue == name) {
            Some(position) => position,
            None => {
                self.queues.push((name.to_string(), VecDeque::new()));
                self.queues.len() - 1
            }
        };
        &mut self.queues[position].1
    }

    fn is_eligible(&self, queue: &str, excluded: &HashSet<String>) -> bool {
        !excluded.contains(queue) && !self.paused.contains_key(queue)
    }

    fn has_eligible(&self, excluded: &HashSet<String>) -> bool {
        self.queues
            .iter()
            .any(|(queue, _)| self.is_eligible(queue, excluded))
    }

    fn pop(&mut self, excluded: &HashSet<String>) -> Option<MemoryWork> {
        let (queue, message) = {
            let paused = &self.paused;
            self.queues
                .iter_mut()
                .filter(|(queue, _)| !excluded.contains(queue) && !paused.contains_key(queue))
                .find_map(|(queue, messages)| {
                    messages.pop_front().map(|message| (queue.clone(), message))
                })?
        };

        let claim = self.next_claim;
        self.next_claim += 1;
        self.claims.insert(claim, (queue.clone(), message.clone()));
        Some(MemoryWork {
            queue,
            message,
            claim,
        })
    }

    fn push_front(&mut self, work: MemoryWork) {
        self.claims.remove(&work.claim);
        self.queue_mut(&work.queue).push_front(work.message);
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    orphan_handler: RwLock<Option<OrphanHandler>>,
}

/// An in-process queue backend with strict queue priority.
///
/// Retrieval always serves the first eligible queue with work, in the order the queues
/// were declared. Clones share the same queues.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
    timeout: Duration,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("state", &*self.inner.state.lock())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MemoryBackend {
    /// Create a backend serving `queues`, highest priority first.
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = State::default();
        for queue in queues {
            state.queue_mut(&queue.into());
        }

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                notify: Notify::new(),
                orphan_handler: RwLock::new(None),
            }),
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Set how long a retrieval waits for work.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append `message` to `queue`. Unknown queues are added with the lowest priority.
    pub fn push(&self, queue: &str, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .queue_mut(queue)
            .push_back(message.into());
        self.inner.notify.notify_waiters();
    }

    /// The messages waiting in `queue`, next to be served first.
    pub fn messages(&self, queue: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .queues
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, messages)| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.messages(queue).len()
    }

    /// The number of claimed and unacknowledged work items.
    pub fn in_progress(&self) -> usize {
        self.inner.state.lock().claims.len()
    }

    /// Mark `work` as done. Returns `false` if it was not claimed.
    pub fn acknowledge(&self, work: &MemoryWork) -> bool {
        self.inner.state.lock().claims.remove(&work.claim).is_some()
    }

    pub fn pause(&self, queue: &str) {
        *self
            .inner
            .state
            .lock()
            .paused
            .entry(queue.to_string())
            .or_default() += 1;
    }

    pub fn unpause(&self, queue: &str) {
        {
            let mut state = self.inner.state.lock();
            if let Some(count) = state.paused.get_mut(queue) {
                *count -= 1;
                if *count == 0 {
                    state.paused.remove(queue);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self, queue: &str) -> bool {
        self.inner.state.lock().paused.contains_key(queue)
    }

    pub fn orphan_handler(&self) -> Option<OrphanHandler> {
        self.inner.orphan_handler.read().clone()
    }

    /// Replace the handler called for every reaped orphan.
    pub fn set_orphan_handler(&self, handler: OrphanHandler) {
        *self.inner.orphan_handler.write() = Some(handler);
    }

    /// Treat every claimed work item as abandoned by a dead worker.
    ///
    /// Each item is put back at the front of its queue and passed to the orphan handler.
    /// Returns the number of items reaped.
    pub fn reap_orphans(&self) -> usize {
        let orphans: Vec<(String, String)> = {
            let mut state = self.inner.state.lock();
            let mut claims: Vec<(u64, (String, String))> = state.claims.drain().collect();
            // Oldest claim ends up first in line
            claims.sort_unstable_by_key(|(claim, _)| std::cmp::Reverse(*claim));
            for (_, (queue, message)) in &claims {
                state.queue_mut(queue).push_front(message.clone());
            }
            claims.into_iter().map(|(_, orphan)| orphan).collect()
        };

        if orphans.is_empty() {
            return 0;
        }
        self.inner.notify.notify_waiters();

        let handler = self.orphan_handler();
        for (queue, message) in &orphans {
            debug!(queue = %queue, "requeued orphaned work");
            if let Some(handler) = &handler {
                handler(message);
            }
        }
        orphans.len()
    }

    /// Take the next message from the first eligible queue, waiting up to the poll
    /// timeout for one to arrive.
    ///
    /// With no eligible queue at all, sleeps for the poll timeout instead of polling.
    pub async fn retrieve(&self, excluded: &HashSet<String>) -> Option<MemoryWork> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let eligible = {
                let mut state = self.inner.state.lock();
                if let Some(work) = state.pop(excluded) {
                    return Some(work);
                }
                state.has_eligible(excluded)
            };

            if !eligible {
                tokio::time::sleep_until(deadline).await;
                return None;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn requeue(&self, work: MemoryWork) {
        self.inner.state.lock().push_front(work);
        self.inner.notify.notify_waiters();
    }

    fn requeue_all(&self, work: Vec<MemoryWork>) {
        {
            let mut state = self.inner.state.lock();
            // Reversed, so the batch keeps its order at the front
            for item in work.into_iter().rev() {
                state.push_front(item);
            }
        }
        self.inner.notify.notify_waiters();
    }
}

impl Backend for MemoryBackend {
    type Work = MemoryWork;

    async fn retrieve_work(
        &self,
        excluded: &HashSet<String>,
    ) -> Result<Option<MemoryWork>, BoxError> {
        Ok(self.retrieve(excluded).await)
    }

    async fn requeue_throttled(&self, work: MemoryWork) -> Result<(), BoxError> {
        self.requeue(work);
        Ok(())
    }

    async fn bulk_requeue(&self, work: Vec<MemoryWork>) -> Result<(), BoxError> {
        self.requeue_all(work);
        Ok(())
    }
}

impl PausableFetch for MemoryBackend {
    type Work = MemoryWork;

    fn notify(&self, action: Notification, queue: &str) {
        match action {
            Notification::Pause => self.pause(queue),
            Notification::Unpause => self.unpause(queue),
        }
    }

    async fn retrieve_work(&self) -> Result<Option<MemoryWork>, BoxError> {
        Ok(self.retrieve(&HashSet::new()).await)
    }

    async fn requeue_throttled(&self, work: MemoryWork) -> Result<(), BoxError> {
        self.requeue(work);
        Ok(())
    }

    async fn bulk_requeue(&self, work: Vec<MemoryWork>) -> Result<(), BoxError> {
        self.requeue_all(work);
        Ok(())
    }
}
