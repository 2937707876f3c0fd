use std::time::Duration;

use crate::StopSignal;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_WATCH_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: expected an integer, got {value:?}")]
    NotANumber { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("poll interval ({interval:?}) exceeds deadline ({deadline:?})")]
    IntervalExceedsDeadline { interval: Duration, deadline: Duration },
}

/// Tunables shared by the waiters and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub deadline: Duration,
    pub poll_interval: Duration,
    /// Upper bound on releasing a watch once the wait has resolved.
    pub teardown_grace: Duration,
    /// Channel capacity between a watch pump and the consumer.
    pub watch_buffer: usize,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

impl WaitConfig {
    /// Defaults overridden by `CONVERGE_DEADLINE_SECS`, `CONVERGE_POLL_SECS`,
    /// `CONVERGE_TEARDOWN_GRACE_SECS` and `CONVERGE_WATCH_BUFFER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::NotANumber { var, value: raw }),
            }
        };
        let mut cfg = Self::default();
        if let Some(v) = read("CONVERGE_DEADLINE_SECS")? {
            cfg.deadline = Duration::from_secs(v);
        }
        if let Some(v) = read("CONVERGE_POLL_SECS")? {
            cfg.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = read("CONVERGE_TEARDOWN_GRACE_SECS")? {
            cfg.teardown_grace = Duration::from_secs(v);
        }
        if let Some(v) = read("CONVERGE_WATCH_BUFFER")? {
            cfg.watch_buffer = v as usize;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deadline.is_zero() {
            return Err(ConfigError::Zero("deadline"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll interval"));
        }
        if self.teardown_grace.is_zero() {
            return Err(ConfigError::Zero("teardown grace"));
        }
        if self.watch_buffer == 0 {
            return Err(ConfigError::Zero("watch buffer"));
        }
        if self.poll_interval > self.deadline {
            return Err(ConfigError::IntervalExceedsDeadline { interval: self.poll_interval, deadline: self.deadline });
        }
        Ok(())
    }

    pub fn options(&self) -> WaitOptions {
        WaitOptions { teardown_grace: self.teardown_grace, cancel: None }
    }
}

/// Per-waiter options beyond the deadline.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub teardown_grace: Duration,
    /// Raising this ends the wait early with `WaitOutcome::Cancelled`.
    pub cancel: Option<StopSignal>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self { teardown_grace: DEFAULT_TEARDOWN_GRACE, cancel: None }
    }
}

impl WaitOptions {
    pub fn with_cancel(mut self, cancel: StopSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(WaitConfig::from_lookup(env(&[])).expect("ok"), WaitConfig::default());
    }

    #[test]
    fn overrides_from_env() {
        let cfg = WaitConfig::from_lookup(env(&[("CONVERGE_DEADLINE_SECS", "60"), ("CONVERGE_POLL_SECS", " 5 ")])).expect("ok");
        assert_eq!(cfg.deadline, Duration::from_secs(60));
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.teardown_grace, DEFAULT_TEARDOWN_GRACE);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = WaitConfig::from_lookup(env(&[("CONVERGE_POLL_SECS", "soon")])).unwrap_err();
        assert_eq!(err, ConfigError::NotANumber { var: "CONVERGE_POLL_SECS", value: "soon".into() });
        let err = WaitConfig::from_lookup(env(&[("CONVERGE_TEARDOWN_GRACE_SECS", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero("teardown grace"));
    }

    #[test]
    fn interval_must_fit_in_deadline() {
        let err = WaitConfig::from_lookup(env(&[("CONVERGE_DEADLINE_SECS", "2"), ("CONVERGE_POLL_SECS", "3")])).unwrap_err();
        assert!(matches!(err, ConfigError::IntervalExceedsDeadline { .. }));
    }
}
