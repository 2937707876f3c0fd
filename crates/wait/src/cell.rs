//! Single-assignment result cell.

use tokio::sync::watch;

/// Holds at most one value. The first `try_set` wins; later attempts are no-ops.
///
/// Writers may race from different tasks (or threads): the compare-and-set runs
/// under the channel's internal lock, which is never held across an `.await`.
#[derive(Debug)]
pub struct ResultCell<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> ResultCell<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Records `value` unless the cell is already set. Returns true iff this call recorded it.
    pub fn try_set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Waits until a value has been recorded, then returns it.
    pub async fn get(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(v) = current {
                return v;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn first_writer_wins() {
        let cell = ResultCell::new();
        assert!(!cell.is_set());
        assert!(cell.try_set(1));
        assert!(!cell.try_set(2));
        assert_eq!(cell.peek(), Some(1));
    }

    #[tokio::test]
    async fn get_returns_immediately_when_set() {
        let cell = ResultCell::new();
        cell.try_set("done");
        let v = tokio::time::timeout(Duration::from_millis(50), cell.get()).await.expect("get blocked");
        assert_eq!(v, "done");
    }

    #[tokio::test]
    async fn get_waits_for_a_later_set() {
        let cell = Arc::new(ResultCell::new());
        let reader = tokio::spawn({
            let cell = Arc::clone(&cell);
            async move { cell.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        assert!(cell.try_set(7u32));
        assert_eq!(reader.await.expect("join"), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_resolve_exactly_once() {
        for _ in 0..50 {
            let cell = Arc::new(ResultCell::new());
            let mut handles = Vec::new();
            for i in 0..8u32 {
                let cell = Arc::clone(&cell);
                handles.push(tokio::spawn(async move { (i, cell.try_set(i)) }));
            }
            let mut winners = Vec::new();
            for h in handles {
                let (i, won) = h.await.expect("join");
                if won {
                    winners.push(i);
                }
            }
            assert_eq!(winners.len(), 1, "exactly one writer must win");
            assert_eq!(cell.get().await, winners[0]);
        }
    }
}
