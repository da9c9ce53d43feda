//! Notification of newly committed snapshots

use std::sync::Arc;

use crate::persisted::PersistedSnapshot;

/// Receives every snapshot that becomes the store's latest.
///
/// Called on the store's actor thread after the commit is durable. Listeners
/// must not block on store futures.
pub trait SnapshotListener: Send + Sync {
    /// A snapshot was committed and is now the latest
    fn on_new_snapshot(&self, snapshot: &PersistedSnapshot);
}

impl<F> SnapshotListener for F
where
    F: Fn(&PersistedSnapshot) + Send + Sync,
{
    fn on_new_snapshot(&self, snapshot: &PersistedSnapshot) {
        self(snapshot)
    }
}

/// Identity comparison for listener handles
pub(crate) fn same_listener(a: &Arc<dyn SnapshotListener>, b: &Arc<dyn SnapshotListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_listener_is_identity() {
        let a: Arc<dyn SnapshotListener> = Arc::new(|_: &PersistedSnapshot| {});
        let b: Arc<dyn SnapshotListener> = Arc::new(|_: &PersistedSnapshot| {});
        let a2 = Arc::clone(&a);

        assert!(same_listener(&a, &a2));
        assert!(!same_listener(&a, &b));
    }
}
