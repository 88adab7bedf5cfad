//! Per-instance exclusive locks.
//!
//! Entries are created on demand. An entry nobody holds or waits on is
//! pruned whenever a guard drops or a new lock is taken, which also covers
//! waiters whose `lock` future was dropped before it resolved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = HashMap<Uuid, Arc<AsyncMutex<()>>>;

/// Drop entries only the map itself still references.
fn prune(map: &mut LockMap) {
    map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
}

#[derive(Default, Clone)]
pub struct InstanceLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held for the duration of one transition of one instance.
pub struct InstanceGuard {
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: Uuid) -> InstanceGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            prune(&mut map);
            Arc::clone(map.entry(id).or_default())
        };
        InstanceGuard {
            guard: Some(mutex.lock_owned().await),
            map: Arc::clone(&self.inner),
        }
    }

    /// Number of instances currently locked or waited on.
    pub fn in_flight(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        prune(&mut map);
        map.len()
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        prune(&mut map);
    }
}
