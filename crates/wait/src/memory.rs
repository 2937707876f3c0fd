//! In-memory sources for driving waits without a cluster.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use converge_core::{CollectionScope, Notification, ResourceIdentity, TransportError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::source::{FetchSource, NotificationResult, Subscription, WatchSource};

/// Sender half of a [`MemoryWatch`]. Dropping it ends the watch stream.
#[derive(Debug, Clone)]
pub struct WatchFeed<S> {
    tx: mpsc::UnboundedSender<NotificationResult<S>>,
}

impl<S> WatchFeed<S> {
    /// Returns false once the subscription has been closed.
    pub fn applied(&self, identity: ResourceIdentity, snapshot: S) -> bool {
        self.tx.send(Ok(Notification::applied(identity, snapshot))).is_ok()
    }

    pub fn deleted(&self, identity: ResourceIdentity, snapshot: S) -> bool {
        self.tx.send(Ok(Notification::deleted(identity, snapshot))).is_ok()
    }

    pub fn error(&self, e: TransportError) -> bool {
        self.tx.send(Err(e)).is_ok()
    }
}

enum Release {
    Prompt,
    Hang,
}

/// Single-use watch fed by a [`WatchFeed`]. Tracks how many subscriptions were released.
pub struct MemoryWatch<S> {
    rx: Mutex<Option<mpsc::UnboundedReceiver<NotificationResult<S>>>>,
    refuse: Option<String>,
    release: Release,
    released: Arc<AtomicUsize>,
}

impl<S: Send + 'static> MemoryWatch<S> {
    pub fn new() -> (Self, WatchFeed<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = Self { rx: Mutex::new(Some(rx)), refuse: None, release: Release::Prompt, released: Arc::new(AtomicUsize::new(0)) };
        (watch, WatchFeed { tx })
    }

    /// A watch that can never be established.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        let (watch, _) = Self::new();
        Self { refuse: Some(reason.into()), ..watch }
    }

    /// Subscriptions from this watch never finish releasing.
    pub fn hanging_release(self) -> Self {
        Self { release: Release::Hang, ..self }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl<S: Send + 'static> WatchSource<S> for MemoryWatch<S> {
    async fn subscribe(&self, scope: &CollectionScope) -> Result<Subscription<S>, TransportError> {
        if let Some(reason) = &self.refuse {
            return Err(TransportError::Subscribe(reason.clone()));
        }
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Subscribe(format!("memory watch for {} already consumed", scope.kind)))?;
        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let released = Arc::clone(&self.released);
        let sub = match self.release {
            Release::Prompt => Subscription::with_release(events, async move {
                released.fetch_add(1, Ordering::SeqCst);
            }),
            Release::Hang => Subscription::with_release(events, std::future::pending::<()>()),
        };
        Ok(sub)
    }
}

/// Fetch source replaying a script of results; the last entry repeats once the
/// script runs out. Records the instant of every call.
pub struct ScriptedFetch<S> {
    script: Mutex<VecDeque<Result<Option<S>, TransportError>>>,
    last: Mutex<Option<Result<Option<S>, TransportError>>>,
    calls: Mutex<Vec<Instant>>,
    latency: Duration,
}

impl<S: Clone + Send + Sync + 'static> ScriptedFetch<S> {
    pub fn new(script: impl IntoIterator<Item = Result<Option<S>, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Every fetch takes `latency` before answering.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    /// Instants at which `fetch` was called.
    pub async fn calls(&self) -> Vec<Instant> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl<S: Clone + Send + Sync + 'static> FetchSource<S> for ScriptedFetch<S> {
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<S>, TransportError> {
        self.calls.lock().await.push(Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut last = self.last.lock().await;
        if let Some(next) = self.script.lock().await.pop_front() {
            *last = Some(next);
        }
        match last.as_ref() {
            Some(result) => result.clone(),
            None => Err(TransportError::Fetch(format!("no scripted result for {}", identity))),
        }
    }
}
