//! Per-registration user data storage.
//!
//! Components such as background sync persist small blobs keyed by
//! `(registration, key)`. Every write must be durable before its future
//! resolves.

use futures::future::BoxFuture;
use rustkit_common::{Result, RustKitError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::RegistrationId;

/// Durable key/value store scoped by registration.
pub trait UserDataStorage: Send + Sync {
    /// Store `data` under `(owner, key)`, replacing any previous value.
    fn put(&self, owner: RegistrationId, key: String, data: Vec<u8>) -> BoxFuture<'static, Result<()>>;

    /// Every owner's value for `key`, ordered by owner.
    fn get_all(&self, key: String) -> BoxFuture<'static, Result<Vec<(RegistrationId, Vec<u8>)>>>;

    /// Remove `keys` for `owner`.
    fn delete(&self, owner: RegistrationId, keys: Vec<String>) -> BoxFuture<'static, Result<()>>;

    /// Remove everything stored for `owner`.
    fn delete_owner(&self, owner: RegistrationId) -> BoxFuture<'static, Result<()>>;

    /// Remove everything.
    fn wipe(&self) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Mutex<BTreeMap<(RegistrationId, String), Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_delay: Mutex<Duration>,
    writes: AtomicUsize,
    active_writes: AtomicUsize,
    max_concurrent_writes: AtomicUsize,
}

impl MemoryInner {
    fn data(&self) -> MutexGuard<'_, BTreeMap<(RegistrationId, String), Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RustKitError::storage("write failed"))
        } else {
            Ok(())
        }
    }

    async fn write<T>(&self, apply: impl FnOnce(&mut BTreeMap<(RegistrationId, String), Vec<u8>>) -> T) -> Result<T> {
        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_writes.fetch_max(active, Ordering::SeqCst);

        let delay = *self
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self.check_writable().map(|()| {
            self.writes.fetch_add(1, Ordering::SeqCst);
            apply(&mut *self.data())
        });
        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// In-memory [`UserDataStorage`] with failure injection.
///
/// Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryUserDataStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryUserDataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every write, to expose overlapping writers.
    pub fn set_write_delay(&self, delay: Duration) {
        *self
            .inner
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Synchronous read for inspection.
    pub fn get(&self, owner: RegistrationId, key: &str) -> Option<Vec<u8>> {
        self.inner.data().get(&(owner, key.to_string())).cloned()
    }

    /// Synchronous write for seeding, bypassing failure injection.
    pub fn insert(&self, owner: RegistrationId, key: &str, data: Vec<u8>) {
        self.inner.data().insert((owner, key.to_string()), data);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Most writes ever in progress at the same time.
    pub fn max_concurrent_writes(&self) -> usize {
        self.inner.max_concurrent_writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UserDataStorage for MemoryUserDataStorage {
    fn put(&self, owner: RegistrationId, key: String, data: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            trace!(%owner, key = %key, bytes = data.len(), "put");
            inner
                .write(|map| {
                    map.insert((owner, key), data);
                })
                .await
        })
    }

    fn get_all(&self, key: String) -> BoxFuture<'static, Result<Vec<(RegistrationId, Vec<u8>)>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            if inner.fail_reads.load(Ordering::SeqCst) {
                return Err(RustKitError::storage("read failed"));
            }
            Ok(inner
                .data()
                .iter()
                .filter(|((_, k), _)| *k == key)
                .map(|((owner, _), data)| (*owner, data.clone()))
                .collect())
        })
    }

    fn delete(&self, owner: RegistrationId, keys: Vec<String>) -> BoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .write(|map| {
                    for key in keys {
                        map.remove(&(owner, key));
                    }
                })
                .await
        })
    }

    fn delete_owner(&self, owner: RegistrationId) -> BoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .write(|map| map.retain(|(existing, _), _| *existing != owner))
                .await
        })
    }

    fn wipe(&self) -> BoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.write(|map| map.clear()).await })
    }
}
