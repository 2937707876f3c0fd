//! Event-driven waiting: classify watch notifications, race a deadline.

use std::time::Duration;

use converge_core::{Classifier, ResourceIdentity, TransportError, WaitOutcome};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::source::{Subscription, WatchSource};
use crate::stop::raised_or_never;
use crate::{record_outcome, ResultCell, StopSignal, WaitOptions};

const STRATEGY: &str = "event";

/// Waits on a [`WatchSource`] until a classifier reaches a terminal verdict for one resource.
pub struct EventDrivenWaiter<W> {
    source: W,
    options: WaitOptions,
}

impl<W> EventDrivenWaiter<W> {
    pub fn new(source: W) -> Self {
        Self { source, options: WaitOptions::default() }
    }

    pub fn with_options(source: W, options: WaitOptions) -> Self {
        Self { source, options }
    }

    pub fn source(&self) -> &W {
        &self.source
    }

    /// Block until `target` is classified terminal, the deadline passes, or the
    /// optional cancel signal is raised.
    ///
    /// The deadline runs from the call, so time spent opening the subscription
    /// counts against it. Failing to open the subscription is returned as
    /// `TransportError` straight away. Whatever resolves the wait, the
    /// subscription is closed before this returns. Closing is bounded by the
    /// teardown grace; overrunning it yields `TransportError::TeardownTimedOut`.
    pub async fn await_condition<S, C>(&self, target: &ResourceIdentity, classifier: &C, deadline: Duration) -> WaitOutcome<C::Output>
    where
        S: Send + 'static,
        W: WatchSource<S>,
        C: Classifier<S>,
    {
        let started = Instant::now();
        let end = started + deadline;
        let cancel = self.options.cancel.as_ref();
        info!(resource = %target, deadline_ms = deadline.as_millis() as u64, "event wait started");

        let scope = target.scope();
        let opened = tokio::select! {
            biased;
            opened = self.source.subscribe(&scope) => opened,
            _ = raised_or_never(cancel) => return record_outcome(STRATEGY, target, started, WaitOutcome::Cancelled),
            _ = tokio::time::sleep_until(end) => {
                warn!(resource = %target, "deadline passed while opening the watch");
                return record_outcome(STRATEGY, target, started, WaitOutcome::Timeout);
            }
        };
        let mut subscription = match opened {
            Ok(sub) => sub,
            Err(e) => {
                warn!(resource = %target, error = %e, "watch could not be established");
                return record_outcome(STRATEGY, target, started, WaitOutcome::TransportError(e));
            }
        };

        let cell = ResultCell::new();
        let stop = StopSignal::new();

        // Every `stop.raise()` below follows a `try_set`, so once both halves have
        // returned the cell holds the outcome.
        let timer = async {
            tokio::select! {
                biased;
                _ = stop.raised() => {}
                _ = raised_or_never(cancel) => {
                    if cell.try_set(WaitOutcome::Cancelled) {
                        debug!(resource = %target, "wait cancelled by caller");
                    }
                    stop.raise();
                }
                _ = tokio::time::sleep_until(end) => {
                    if cell.try_set(WaitOutcome::Timeout) {
                        debug!(resource = %target, "deadline fired first");
                    }
                    stop.raise();
                }
            }
        };
        let consumer = consume(&mut subscription, target, classifier, &cell, &stop);
        tokio::join!(timer, consumer);

        let resolved = cell.get().await;
        let outcome = release(subscription, self.options.teardown_grace, target, resolved).await;
        record_outcome(STRATEGY, target, started, outcome)
    }
}

async fn consume<S, C>(
    subscription: &mut Subscription<S>,
    target: &ResourceIdentity,
    classifier: &C,
    cell: &ResultCell<WaitOutcome<C::Output>>,
    stop: &StopSignal,
) where
    S: Send + 'static,
    C: Classifier<S>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.raised() => return,
            next = subscription.next() => next,
        };
        let notification = match next {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                warn!(resource = %target, error = %e, "watch stream error; continuing");
                continue;
            }
            None => {
                cell.try_set(WaitOutcome::TransportError(TransportError::StreamEnded));
                stop.raise();
                return;
            }
        };
        metrics::counter!("wait_notifications_total", 1u64);
        if notification.identity != *target {
            continue;
        }
        let verdict = classifier.classify(notification.observed());
        debug!(resource = %target, change = ?notification.change, terminal = verdict.is_terminal(), "notification classified");
        if let Some(outcome) = verdict.into_outcome() {
            if !cell.try_set(outcome) {
                debug!(resource = %target, "terminal notification lost the race");
            }
            stop.raise();
            return;
        }
    }
}

async fn release<S, T>(subscription: Subscription<S>, grace: Duration, target: &ResourceIdentity, resolved: WaitOutcome<T>) -> WaitOutcome<T>
where
    S: Send + 'static,
{
    match tokio::time::timeout(grace, subscription.close()).await {
        Ok(()) => resolved,
        Err(_) => {
            warn!(resource = %target, grace_ms = grace.as_millis() as u64, resolved = resolved.label(), "watch teardown overran its grace period");
            WaitOutcome::TransportError(TransportError::TeardownTimedOut {
                grace_ms: grace.as_millis() as u64,
                resolved: resolved.label().to_string(),
            })
        }
    }
}
