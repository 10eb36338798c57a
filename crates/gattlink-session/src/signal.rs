use std::sync::Arc;

use tokio::sync::watch;

/// Single-assignment deferred value.
///
/// The first [`set`](Deferred::set) wins; later ones are ignored. Waiting
/// after the value is set resolves immediately with the stored value.
#[derive(Debug)]
pub struct Deferred<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Store `value` unless already set. Returns whether this call set it.
    pub fn set(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Resolved once the peer sends the start-transmission sentinel.
pub type StartSignal = Deferred<bool>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn first_set_wins() {
        let deferred = Deferred::new();
        assert!(!deferred.is_set());
        assert!(deferred.set(1));
        assert!(!deferred.set(2));
        assert_eq!(deferred.get(), Some(1));
    }

    #[tokio::test]
    async fn wait_after_set_resolves_immediately() {
        let signal = StartSignal::new();
        signal.set(true);
        let value = tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait should not block once set");
        assert!(value);
    }

    #[tokio::test]
    async fn wait_wakes_on_set_from_clone() {
        let deferred: Deferred<Option<u8>> = Deferred::new();
        let setter = deferred.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(Some(7));
        });
        let value = tokio::time::timeout(Duration::from_secs(1), deferred.wait())
            .await
            .expect("wait should wake");
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn unset_wait_times_out() {
        let signal = StartSignal::new();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), signal.wait())
                .await
                .is_err()
        );
    }
}
