//! Per-run mutual exclusion
//!
//! Every handler that reads a run's history and appends to it holds the
//! run's lock for the whole read-decide-append cycle. Step bodies run
//! outside the lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct RunLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl RunLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, run_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop a run's lock entry if nobody holds or waits on it
    pub(crate) fn release(&self, run_id: Uuid) {
        self.locks
            .remove_if(&run_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_run_is_serialized() {
        let locks = Arc::new(RunLocks::new());
        let run_id = Uuid::now_v7();

        let guard = locks.lock(run_id).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(run_id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_runs_do_not_block() {
        let locks = RunLocks::new();
        let _a = locks.lock(Uuid::now_v7()).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(Uuid::now_v7()))
            .await
            .expect("other run should not block");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = RunLocks::new();
        let run_id = Uuid::now_v7();

        let guard = locks.lock(run_id).await;
        locks.release(run_id);
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.release(run_id);
        assert_eq!(locks.len(), 0);
    }
}
