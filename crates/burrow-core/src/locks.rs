//! Per-instance operation locks.

use crate::instance::InstanceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;

/// Serializes lifecycle and attach operations on the same instance.
///
/// The table itself is only locked briefly; the per-instance mutex is the
/// one held across engine calls.
#[derive(Default)]
pub struct InstanceLocks {
    table: Mutex<HashMap<InstanceId, Weak<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: InstanceId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            match table.get(&id).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    table.retain(|_, weak| weak.strong_count() > 0);
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    table.insert(id, Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.values().filter(|w| w.strong_count() > 0).count()
    }
}
