//! Poison-tolerant access to the bucket slots and the sitemap.
//!
//! A panic while a guard is held leaves the protected state readable; the
//! gate keeps serving from it and logs which resource was affected.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Where a lock is taken: the calling module, the guarded resource
/// (a bucket name or `"sitemap"`) and the operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockSite {
    pub module: &'static str,
    pub resource: &'static str,
    pub op: &'static str,
}

impl LockSite {
    pub(crate) const fn new(module: &'static str, resource: &'static str, op: &'static str) -> Self {
        Self {
            module,
            resource,
            op,
        }
    }
}

fn recover<G>(site: LockSite, lock_kind: &'static str, poisoned: PoisonError<G>) -> G {
    warn!(
        op = site.op,
        target_module = site.module,
        resource = site.resource,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock, state may predate the panic"
    );
    poisoned.into_inner()
}

pub(crate) fn rw_read<T>(lock: &RwLock<T>, site: LockSite) -> RwLockReadGuard<'_, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(site, "rwlock.read", poisoned))
}

pub(crate) fn rw_write<T>(lock: &RwLock<T>, site: LockSite) -> RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(site, "rwlock.write", poisoned))
}

pub(crate) fn mutex_lock<T>(lock: &Mutex<T>, site: LockSite) -> MutexGuard<'_, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(site, "mutex.lock", poisoned))
}
