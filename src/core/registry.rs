//! Concurrency-safe id registries used by the execution engines and sweepers.

use std::sync::Arc;

use dashmap::DashSet;

/// A set of strategy ids with single-flight acquire semantics.
///
/// `try_acquire` either claims the id or reports that someone else holds it;
/// there is no separate check-then-insert window. Every engine registry and
/// monitored-strategy set in the system is one of these, which keeps the
/// at-most-one-concurrent-execution invariant in a single place.
#[derive(Debug, Default, Clone)]
pub struct ActiveSet {
    inner: Arc<DashSet<String>>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`. Returns false if it is already held.
    pub fn try_acquire(&self, id: &str) -> bool {
        self.inner.insert(id.to_string())
    }

    /// Releases `id`. Releasing an id that is not held is a no-op.
    pub fn release(&self, id: &str) -> bool {
        self.inner.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    /// Copies the current membership. Sweepers iterate the copy so no shard
    /// lock is held while strategies are evaluated.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_until_released() {
        let set = ActiveSet::new();
        assert!(set.try_acquire("s1"));
        assert!(!set.try_acquire("s1"));
        assert!(set.contains("s1"));

        assert!(set.release("s1"));
        assert!(!set.release("s1"));
        assert!(set.try_acquire("s1"));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let set = ActiveSet::new();
        set.try_acquire("a");
        set.try_acquire("b");

        let snapshot = set.snapshot();
        set.release("a");
        set.release("b");

        assert_eq!(snapshot.len(), 2);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn concurrent_acquire_admits_exactly_one() {
        let set = ActiveSet::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let set = set.clone();
            handles.push(tokio::spawn(async move { set.try_acquire("contended") }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(set.len(), 1);
    }
}
