//! Per-contact mutual exclusion.
//!
//! At most one pipeline run per normalized contact is in flight; runs for
//! different contacts never wait on each other. Entries are removed once
//! nobody holds or waits on them, so the table only grows with the number
//! of contacts currently being processed.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ContactLocks {
    inner: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one pipeline run.
pub struct ContactGuard<'a> {
    locks: &'a ContactLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `contact`.
    pub async fn lock(&self, contact: &str) -> ContactGuard<'_> {
        // Clone the Arc out before awaiting so no shard lock is held across
        // the await.
        let mutex = Arc::clone(self.inner.entry(contact.to_string()).or_default().value());
        let guard = mutex.lock_owned().await;
        ContactGuard {
            locks: self,
            key: contact.to_string(),
            guard: Some(guard),
        }
    }

    /// Contacts with a holder or waiter.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for ContactGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table's own reference left: nobody is waiting.
        self.locks
            .inner
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn entry_removed_after_release() {
        let locks = ContactLocks::new();
        {
            let _guard = locks.lock("+5491111111111").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn same_contact_is_serialized() {
        let locks = Arc::new(ContactLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("+5491111111111").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_contacts_do_not_block() {
        let locks = ContactLocks::new();
        let _a = locks.lock("+5491111111111").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("+5491122223333")).await;
        assert!(b.is_ok());
    }
}
