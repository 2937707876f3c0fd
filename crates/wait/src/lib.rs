//! Converge wait primitives.
//!
//! Two strategies share one contract: block until a remote resource is classified
//! terminal, or until the deadline passes, and return exactly one [`WaitOutcome`].
//!
//! - [`EventDrivenWaiter`] consumes a watch and races it against a deadline timer.
//!   Both sides send their candidate outcome into a [`ResultCell`]; the first one
//!   recorded wins and raises a [`StopSignal`] that ends the other side.
//! - [`PollingWaiter`] fetches at a fixed interval, first check immediate.

#![forbid(unsafe_code)]

mod cell;
mod config;
mod event;
pub mod memory;
mod poll;
mod source;
mod stop;

use tokio::time::Instant;
use tracing::info;

pub use cell::ResultCell;
pub use config::{ConfigError, WaitConfig, WaitOptions, DEFAULT_DEADLINE, DEFAULT_POLL_INTERVAL, DEFAULT_TEARDOWN_GRACE, DEFAULT_WATCH_BUFFER};
pub use converge_core::prelude::*;
pub use event::EventDrivenWaiter;
pub use poll::PollingWaiter;
pub use source::{FetchSource, NotificationResult, Subscription, WatchSource};
pub use stop::StopSignal;

fn record_outcome<T>(strategy: &'static str, target: &ResourceIdentity, started: Instant, outcome: WaitOutcome<T>) -> WaitOutcome<T> {
    let elapsed = started.elapsed();
    metrics::counter!("wait_outcomes_total", 1u64, "strategy" => strategy, "outcome" => outcome.label());
    metrics::histogram!("wait_duration_ms", elapsed.as_secs_f64() * 1_000.0, "strategy" => strategy);
    info!(resource = %target, strategy, outcome = outcome.label(), elapsed_ms = elapsed.as_millis() as u64, "wait resolved");
    outcome
}
