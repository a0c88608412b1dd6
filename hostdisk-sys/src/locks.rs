// SPDX-License-Identifier: GPL-3.0-only

//! Per-key exclusive locks and the image-connect registry built on them

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use hostdisk_types::LvmClass;

fn lock_set<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lazily created lock per key; entries are never removed
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    ///
    /// The map lock is only held for the create-if-absent step, so
    /// waiting on one key never blocks another.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = lock_set(&self.locks);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        lock_set(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serializes connects of images sharing a backing path and remembers
/// which backing paths carry no LVM
#[derive(Debug, Default)]
pub struct LvmConnectRegistry {
    locks: KeyedLocks,
    non_lvm: Mutex<HashSet<String>>,
    lvm_active: Mutex<HashSet<String>>,
}

impl LvmConnectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, backing_path: &str) -> LvmClass {
        if lock_set(&self.non_lvm).contains(backing_path) {
            LvmClass::NonLvm
        } else if lock_set(&self.lvm_active).contains(backing_path) {
            LvmClass::Lvm
        } else {
            LvmClass::Unknown
        }
    }

    /// Block until no other connect of `backing_path` is active
    pub async fn acquire(self: &Arc<Self>, backing_path: &str) -> ImageConnectGuard {
        let guard = self.locks.lock(backing_path).await;
        debug!(image = %backing_path, "image connect lock acquired");
        ImageConnectGuard {
            registry: self.clone(),
            path: backing_path.to_string(),
            _guard: guard,
        }
    }

    /// Record that the image was proven to contain no physical volumes
    pub fn cache_non_lvm(&self, backing_path: &str) {
        if lock_set(&self.non_lvm).insert(backing_path.to_string()) {
            debug!(image = %backing_path, "image cached as non-lvm");
        }
    }

    fn set_lvm_active(&self, backing_path: &str, active: bool) {
        let mut lvm_active = lock_set(&self.lvm_active);
        if active {
            lvm_active.insert(backing_path.to_string());
        } else {
            lvm_active.remove(backing_path);
        }
    }
}

/// Held for the whole connect/disconnect window of one image
#[derive(Debug)]
pub struct ImageConnectGuard {
    registry: Arc<LvmConnectRegistry>,
    path: String,
    _guard: OwnedMutexGuard<()>,
}

impl ImageConnectGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Volume groups of this image are active on the host
    pub fn mark_lvm(&self) {
        self.registry.set_lvm_active(&self.path, true);
    }
}

impl Drop for ImageConnectGuard {
    fn drop(&mut self) {
        self.registry.set_lvm_active(&self.path, false);
        debug!(image = %self.path, "image connect lock released");
    }
}
