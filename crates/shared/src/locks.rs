//! Per-account async locks
//!
//! Serializes read-modify-write sequences (resolve, reconcile, persist) for a
//! single account inside one process. Across processes the store stays
//! last-write-wins.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle entries are pruned once the map grows past this size
const PRUNE_THRESHOLD: usize = 1_024;

#[derive(Clone, Default)]
pub struct AccountLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `email`, waiting for any current holder
    pub async fn lock(&self, email: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            map.entry(email.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Number of tracked keys
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_account_is_serialized() {
        let locks = AccountLocks::new();
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("a@b.com").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_are_case_insensitive() {
        let locks = AccountLocks::new();
        let _a = locks.lock("A@B.com").await;
        let attempt = tokio::time::timeout(Duration::from_millis(20), locks.lock("a@b.com")).await;
        assert!(attempt.is_err(), "second lock on same account should wait");
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_block() {
        let locks = AccountLocks::new();
        let _a = locks.lock("a@b.com").await;
        let attempt = tokio::time::timeout(Duration::from_millis(20), locks.lock("c@d.com")).await;
        assert!(attempt.is_ok());
    }
}
