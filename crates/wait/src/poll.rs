//! Polling: fetch, classify, sleep, repeat until terminal or out of time.

use std::time::Duration;

use converge_core::{Classifier, Observed, ResourceIdentity, WaitOutcome};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::source::FetchSource;
use crate::{record_outcome, WaitOptions};

const STRATEGY: &str = "poll";

/// Polls a [`FetchSource`] at a fixed cadence, first check immediate.
///
/// Transport errors end the wait at once; there is no retry here. Callers that
/// need to ride out transient failures wrap the call in their own retry.
pub struct PollingWaiter<F> {
    source: F,
    options: WaitOptions,
}

impl<F> PollingWaiter<F> {
    pub fn new(source: F) -> Self {
        Self { source, options: WaitOptions::default() }
    }

    pub fn with_options(source: F, options: WaitOptions) -> Self {
        Self { source, options }
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    /// Returns at most one fetch duration after `deadline`. When `interval` does not
    /// divide the deadline, the last sleep is shortened so a final check happens
    /// right at the deadline.
    pub async fn poll_until<S, C>(&self, target: &ResourceIdentity, classifier: &C, interval: Duration, deadline: Duration) -> WaitOutcome<C::Output>
    where
        S: Send + 'static,
        F: FetchSource<S>,
        C: Classifier<S>,
    {
        let started = Instant::now();
        let end = started + deadline;
        let cancel = self.options.cancel.as_ref();
        info!(resource = %target, interval_ms = interval.as_millis() as u64, deadline_ms = deadline.as_millis() as u64, "poll wait started");

        let mut attempt: u32 = 0;
        let outcome = loop {
            if cancel.is_some_and(|c| c.is_raised()) {
                break WaitOutcome::Cancelled;
            }
            attempt += 1;
            metrics::counter!("wait_polls_total", 1u64);
            let fetched = match self.source.fetch(target).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(resource = %target, attempt, error = %e, "fetch failed; aborting wait");
                    break WaitOutcome::TransportError(e);
                }
            };
            let verdict = match &fetched {
                Some(snapshot) => classifier.classify(Observed::Present(snapshot)),
                None => classifier.classify(Observed::Absent),
            };
            debug!(resource = %target, attempt, found = fetched.is_some(), terminal = verdict.is_terminal(), "poll classified");
            if let Some(outcome) = verdict.into_outcome() {
                break outcome;
            }

            let now = Instant::now();
            if now >= end {
                break WaitOutcome::Timeout;
            }
            let wake = (now + interval).min(end);
            match cancel {
                Some(c) => {
                    tokio::select! {
                        _ = c.raised() => break WaitOutcome::Cancelled,
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                None => tokio::time::sleep_until(wake).await,
            }
        };
        record_outcome(STRATEGY, target, started, outcome)
    }
}
