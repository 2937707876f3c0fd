//! Observation sources consumed by the waiters.

use std::future::Future;

use converge_core::{CollectionScope, Notification, ResourceIdentity, TransportError};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::StopSignal;

pub type NotificationResult<S> = Result<Notification<S>, TransportError>;

/// An open watch: a stream of notifications plus whatever must run to release it.
pub struct Subscription<S> {
    events: BoxStream<'static, NotificationResult<S>>,
    release: Option<BoxFuture<'static, ()>>,
}

impl<S: Send + 'static> Subscription<S> {
    /// Subscription whose release runs `release` after the stream is dropped.
    pub fn with_release<St, R>(events: St, release: R) -> Self
    where
        St: Stream<Item = NotificationResult<S>> + Send + 'static,
        R: Future<Output = ()> + Send + 'static,
    {
        Self { events: events.boxed(), release: Some(release.boxed()) }
    }

    /// Drive `upstream` on a background pump task feeding a bounded channel.
    ///
    /// Closing the subscription stops the pump and waits for the task to exit, so
    /// nothing keeps consuming `upstream` once `close` has returned. Dropping the
    /// subscription, or abandoning `close` part way, aborts the pump instead.
    pub fn spawn<St>(upstream: St, buffer: usize) -> Self
    where
        St: Stream<Item = NotificationResult<S>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stop = StopSignal::new();
        let pump_stop = stop.clone();
        let pump = tokio::spawn(async move {
            futures::pin_mut!(upstream);
            loop {
                tokio::select! {
                    biased;
                    _ = pump_stop.raised() => break,
                    next = upstream.next() => {
                        let Some(item) = next else { break };
                        tokio::select! {
                            biased;
                            _ = pump_stop.raised() => break,
                            sent = tx.send(item) => if sent.is_err() { break },
                        }
                    }
                }
            }
            debug!("subscription pump stopped");
        });
        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let mut pump = AbortOnDrop(Some(pump));
        let release = async move {
            stop.raise();
            if let Some(handle) = pump.0.as_mut() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "subscription pump did not exit cleanly");
                }
            }
            pump.0 = None;
        };
        Self::with_release(events, release)
    }

    pub async fn next(&mut self) -> Option<NotificationResult<S>> {
        self.events.next().await
    }

    /// Stops delivery and waits until the underlying source is released.
    pub async fn close(self) {
        let Subscription { events, release } = self;
        drop(events);
        if let Some(release) = release {
            release.await;
        }
    }
}

/// Aborts the pump unless it was joined.
struct AbortOnDrop(Option<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Push side: opens watches over a resource collection.
#[async_trait::async_trait]
pub trait WatchSource<S: Send + 'static>: Send + Sync {
    /// Failing here means the watch could not be established at all.
    async fn subscribe(&self, scope: &CollectionScope) -> Result<Subscription<S>, TransportError>;
}

/// Pull side: fetches the current state of one resource. `Ok(None)` means not found.
#[async_trait::async_trait]
pub trait FetchSource<S: Send + 'static>: Send + Sync {
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<S>, TransportError>;
}

#[async_trait::async_trait]
impl<S, W> WatchSource<S> for std::sync::Arc<W>
where
    S: Send + 'static,
    W: WatchSource<S> + ?Sized,
{
    async fn subscribe(&self, scope: &CollectionScope) -> Result<Subscription<S>, TransportError> {
        (**self).subscribe(scope).await
    }
}

#[async_trait::async_trait]
impl<S, F> FetchSource<S> for std::sync::Arc<F>
where
    S: Send + 'static,
    F: FetchSource<S> + ?Sized,
{
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<S>, TransportError> {
        (**self).fetch(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn note(name: &str) -> NotificationResult<u32> {
        Ok(Notification::applied(ResourceIdentity::namespaced("Pod", "ns", name), 0))
    }

    #[tokio::test]
    async fn spawned_subscription_forwards_in_order() {
        let upstream = futures::stream::iter(vec![note("a"), note("b")]);
        let mut sub = Subscription::spawn(upstream, 4);
        let mut names = Vec::new();
        while let Some(Ok(n)) = sub.next().await {
            names.push(n.identity.name);
        }
        assert_eq!(names, vec!["a", "b"]);
        sub.close().await;
    }

    #[tokio::test]
    async fn close_stops_the_pump_of_an_endless_stream() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let upstream = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                yield note("tick");
            }
        };
        let mut sub = Subscription::spawn(upstream, 1);
        assert!(sub.next().await.is_some());
        tokio::time::timeout(Duration::from_secs(1), sub.close()).await.expect("close hung");
        let after_close = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(produced.load(Ordering::SeqCst), after_close, "pump kept consuming after close");
    }

    #[tokio::test]
    async fn dropping_the_subscription_aborts_the_pump() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let upstream = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                yield note("tick");
            }
        };
        let mut sub = Subscription::spawn(upstream, 1);
        assert!(sub.next().await.is_some());
        drop(sub);
        let at_drop = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(produced.load(Ordering::SeqCst), at_drop, "pump outlived its subscription");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_close_still_aborts_the_pump() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let upstream = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                yield note("tick");
            }
        };
        let mut sub = Subscription::spawn(upstream, 1);
        assert!(sub.next().await.is_some());
        // Zero grace: close is polled once and then abandoned mid-join.
        let _ = tokio::time::timeout(Duration::ZERO, sub.close()).await;
        let at_abandon = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(produced.load(Ordering::SeqCst), at_abandon, "pump outlived an abandoned close");
    }

    #[tokio::test]
    async fn release_runs_on_close() {
        let released = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&released);
        let sub: Subscription<u32> = Subscription::with_release(futures::stream::empty(), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        sub.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
