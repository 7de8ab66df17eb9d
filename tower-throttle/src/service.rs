use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use pin_project_lite::pin_project;
use throttle_limit::JobMessage;
use throttle_limit::Registry;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tower::Service;
use tracing::debug;
use tracing::warn;

use crate::backend::WorkItem;

struct Release {
    registry: Arc<Registry>,
    job: JobMessage,
}

impl Release {
    fn run(self) {
        if let Err(err) = self.registry.finalize_job(&self.job) {
            warn!(
                class = self.job.effective_class(),
                jid = %self.job.jid,
                error = %err,
                "failed to release job limits"
            );
        }
    }

    /// Run on the blocking pool when the store blocks and a runtime is available.
    fn dispatch(self) -> Option<JoinHandle<()>> {
        if self.registry.store().is_blocking()
            && let Ok(handle) = Handle::try_current()
        {
            return Some(handle.spawn_blocking(move || self.run()));
        }
        self.run();
        None
    }
}

/// Releases the limits held by one job when dropped.
///
/// Arm a guard before running a job and keep it alive until the job is over; it fires
/// exactly once whether the job returns, fails, is cancelled or panics.
///
/// With a blocking store the release runs on the runtime's blocking pool. A dropped guard
/// does not wait for it; [`FinalizeGuard::finish`] hands back the task to wait on.
pub struct FinalizeGuard {
    release: Option<Release>,
}

impl fmt::Debug for FinalizeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("FinalizeGuard");
        if let Some(release) = &self.release {
            debug
                .field("class", &release.job.effective_class())
                .field("jid", &release.job.jid);
        }
        debug.finish()
    }
}

impl FinalizeGuard {
    /// Arm a guard for the job in `raw`. Undecodable payloads hold nothing to release.
    pub fn arm(registry: Arc<Registry>, raw: &str) -> Option<Self> {
        match JobMessage::parse(raw) {
            Ok(job) => Some(Self {
                release: Some(Release { registry, job }),
            }),
            Err(err) => {
                debug!(error = %err, "no limits to release for undecodable job");
                None
            }
        }
    }

    /// Release now. Returns the blocking task still running the release, if any.
    pub fn finish(mut self) -> Option<JoinHandle<()>> {
        self.release.take().and_then(Release::dispatch)
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            // Detached; the release still completes
            drop(release.dispatch());
        }
    }
}

/// Runs work through an inner service and releases its limits once it is over.
pub struct FinalizeService<S> {
    inner: S,
    registry: Arc<Registry>,
}

impl<S> FinalizeService<S> {
    pub fn new(inner: S, registry: Arc<Registry>) -> Self {
        Self { inner, registry }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> fmt::Debug for FinalizeService<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizeService")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<S> Clone for FinalizeService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

pin_project! {
    /// A future that releases the job's limits when the inner future completes or is
    /// dropped.
    ///
    /// On completion the output is held back until the release is done.
    pub struct ResponseFuture<F>
    where
        F: Future,
    {
        #[pin]
        inner: F,
        guard: Option<FinalizeGuard>,
        releasing: Option<(JoinHandle<()>, F::Output)>,
    }
}

impl<F> Future for ResponseFuture<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            if let Some((mut handle, output)) = this.releasing.take() {
                return match Pin::new(&mut handle).poll(cx) {
                    Poll::Ready(joined) => {
                        if let Err(err) = joined {
                            warn!(error = %err, "job limits release did not complete");
                        }
                        Poll::Ready(output)
                    }
                    Poll::Pending => {
                        *this.releasing = Some((handle, output));
                        Poll::Pending
                    }
                };
            }

            let output = ready!(this.inner.as_mut().poll(cx));
            // Release before the caller sees the result
            match this.guard.take().and_then(FinalizeGuard::finish) {
                Some(handle) => *this.releasing = Some((handle, output)),
                None => return Poll::Ready(output),
            }
        }
    }
}

impl<S, W> Service<W> for FinalizeService<S>
where
    S: Service<W>,
    W: WorkItem,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, work: W) -> Self::Future {
        // Armed first, so a panicking call still releases
        let guard = FinalizeGuard::arm(Arc::clone(&self.registry), work.raw_message());
        ResponseFuture {
            inner: self.inner.call(work),
            guard,
            releasing: None,
        }
    }
}
