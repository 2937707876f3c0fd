use tokio_util::sync::CancellationToken;

/// One-shot, idempotent stop broadcast for an observation source.
///
/// Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the signal has been raised (immediately if it already was).
    pub async fn raised(&self) {
        self.token.cancelled().await
    }
}

/// Waits on an optional signal; never completes for `None`.
pub(crate) async fn raised_or_never(signal: Option<&StopSignal>) {
    match signal {
        Some(s) => s.raised().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn raise_is_idempotent_and_shared_by_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        stop.raise();
        stop.raise();
        assert!(other.is_raised());
        tokio::time::timeout(Duration::from_millis(50), other.raised()).await.expect("raised");
    }

    #[tokio::test(start_paused = true)]
    async fn absent_signal_never_completes() {
        let r = tokio::time::timeout(Duration::from_secs(3600), raised_or_never(None)).await;
        assert!(r.is_err());
    }
}
