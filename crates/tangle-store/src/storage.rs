use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};
use crate::object::{decode, encode, StorableObject};
use crate::traits::KvStore;

type CacheMap<T> = HashMap<Vec<u8>, Arc<CacheEntry<T>>>;

/// Typed, cached view over one realm of a [`KvStore`].
///
/// At most one decoded copy of each key is alive at a time. Callers receive
/// [`CachedObject`] handles; the entry stays cached while any handle exists
/// and is written back (if modified) and evicted when the last one drops.
///
/// Cloning the storage is cheap and shares the cache.
pub struct ObjectStorage<T: StorableObject> {
    inner: Arc<StorageInner<T>>,
}

struct StorageInner<T: StorableObject> {
    realm: Vec<u8>,
    backend: Arc<dyn KvStore>,
    cache: Mutex<CacheMap<T>>,
}

struct CacheEntry<T> {
    key: Vec<u8>,
    value: RwLock<T>,
    refs: AtomicUsize,
    modified: AtomicBool,
    deleted: AtomicBool,
}

impl<T> CacheEntry<T> {
    fn new(key: Vec<u8>, value: T) -> Arc<Self> {
        Arc::new(Self {
            key,
            value: RwLock::new(value),
            refs: AtomicUsize::new(0),
            modified: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        })
    }
}

impl<T: StorableObject> StorageInner<T> {
    fn backend_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.realm.len() + key.len());
        full.extend_from_slice(&self.realm);
        full.extend_from_slice(key);
        full
    }

    fn lock_cache(&self) -> StoreResult<MutexGuard<'_, CacheMap<T>>> {
        self.cache.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn read_backend(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.backend.get(&self.backend_key(key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_backend(&self, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = encode(value)?;
        self.backend.set(&self.backend_key(key), &bytes)
    }

    /// Write a modified entry back. Callers must make sure no write guard on
    /// the entry is held by the current thread.
    fn persist(&self, entry: &CacheEntry<T>) -> StoreResult<()> {
        if !entry.modified.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = match entry.value.read() {
            Ok(value) => self.write_backend(&entry.key, &value),
            Err(_) => Err(StoreError::LockPoisoned),
        };
        if result.is_err() {
            entry.modified.store(true, Ordering::Release);
        }
        result
    }
}

impl<T: StorableObject> ObjectStorage<T> {
    /// Open the storage realm identified by `realm` on `backend`.
    ///
    /// Realms must not be prefixes of one another.
    pub fn new(backend: Arc<dyn KvStore>, realm: &[u8]) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                realm: realm.to_vec(),
                backend,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn realm(&self) -> &[u8] {
        &self.inner.realm
    }

    /// Number of entries currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.inner.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn handle(&self, entry: Arc<CacheEntry<T>>) -> CachedObject<T> {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        CachedObject {
            storage: Arc::clone(&self.inner),
            entry,
        }
    }

    fn insert(&self, cache: &mut CacheMap<T>, key: Vec<u8>, value: T) -> CachedObject<T> {
        let entry = CacheEntry::new(key.clone(), value);
        cache.insert(key, Arc::clone(&entry));
        self.handle(entry)
    }

    /// Load the object stored under `key`.
    ///
    /// Returns `Ok(None)` if it does not exist (or was deleted).
    pub fn load(&self, key: &[u8]) -> StoreResult<Option<CachedObject<T>>> {
        let mut cache = self.inner.lock_cache()?;
        if let Some(entry) = cache.get(key) {
            return Ok(Some(self.handle(Arc::clone(entry))));
        }
        match self.inner.read_backend(key)? {
            Some(value) => Ok(Some(self.insert(&mut cache, key.to_vec(), value))),
            None => Ok(None),
        }
    }

    /// Store `object`, replacing whatever is stored under its key.
    pub fn store(&self, object: T) -> StoreResult<CachedObject<T>> {
        let key = object.object_key();
        let existing = {
            let mut cache = self.inner.lock_cache()?;
            self.inner.write_backend(&key, &object)?;
            match cache.get(&key) {
                Some(entry) => self.handle(Arc::clone(entry)),
                None => return Ok(self.insert(&mut cache, key, object)),
            }
        };
        // Replace outside the cache lock so a thread holding a guard on this
        // entry can still reach the cache.
        *existing.write() = object;
        Ok(existing)
    }

    /// Store `object` only if nothing is stored under its key yet.
    ///
    /// Returns `Ok(None)` if the key was already taken.
    pub fn store_if_absent(&self, object: T) -> StoreResult<Option<CachedObject<T>>> {
        let key = object.object_key();
        let mut cache = self.inner.lock_cache()?;
        if cache.contains_key(&key) || self.inner.backend.has(&self.inner.backend_key(&key))? {
            return Ok(None);
        }
        self.inner.write_backend(&key, &object)?;
        Ok(Some(self.insert(&mut cache, key, object)))
    }

    /// Load the object under `key`, or create it with `create` if absent.
    ///
    /// The boolean is `true` iff this call created the object. Concurrent
    /// calls for the same key run `create` at most once. `create` runs while
    /// the cache is locked and must not access this storage.
    pub fn compute_if_absent<F>(&self, key: &[u8], create: F) -> StoreResult<(CachedObject<T>, bool)>
    where
        F: FnOnce() -> T,
    {
        let mut cache = self.inner.lock_cache()?;
        if let Some(entry) = cache.get(key) {
            return Ok((self.handle(Arc::clone(entry)), false));
        }
        if let Some(value) = self.inner.read_backend(key)? {
            return Ok((self.insert(&mut cache, key.to_vec(), value), false));
        }

        let value = create();
        debug_assert_eq!(value.object_key(), key, "created object must match its key");
        self.inner.write_backend(key, &value)?;
        debug!(realm = %hex_prefix(&self.inner.realm), "object created");
        Ok((self.insert(&mut cache, key.to_vec(), value), true))
    }

    /// Delete the object under `key`. Handles still held observe
    /// [`CachedObject::is_deleted`]; later loads return `None`.
    ///
    /// Returns `true` if something was stored.
    pub fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let mut cache = self.inner.lock_cache()?;
        let cached = match cache.remove(key) {
            Some(entry) => {
                entry.deleted.store(true, Ordering::Release);
                true
            }
            None => false,
        };
        let stored = self.inner.backend.delete(&self.inner.backend_key(key))?;
        Ok(cached || stored)
    }

    /// Check whether an object exists under `key`.
    pub fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        let cache = self.inner.lock_cache()?;
        if cache.contains_key(key) {
            return Ok(true);
        }
        self.inner.backend.has(&self.inner.backend_key(key))
    }

    /// Load every object whose key starts with `prefix`, in key order.
    pub fn load_with_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<CachedObject<T>>> {
        let realm_len = self.inner.realm.len();
        let keys = self
            .inner
            .backend
            .keys_with_prefix(&self.inner.backend_key(prefix))?;

        let mut objects = Vec::with_capacity(keys.len());
        for full_key in keys {
            if let Some(object) = self.load(&full_key[realm_len..])? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Keys (without realm) of every stored object starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let realm_len = self.inner.realm.len();
        let keys = self
            .inner
            .backend
            .keys_with_prefix(&self.inner.backend_key(prefix))?;
        Ok(keys.into_iter().map(|key| key[realm_len..].to_vec()).collect())
    }

    /// Write every modified cached entry back to the backend.
    pub fn flush(&self) -> StoreResult<usize> {
        let entries: Vec<Arc<CacheEntry<T>>> = {
            let cache = self.inner.lock_cache()?;
            cache.values().cloned().collect()
        };
        let mut written = 0;
        for entry in entries {
            if entry.deleted.load(Ordering::Acquire) || !entry.modified.load(Ordering::Acquire) {
                continue;
            }
            self.inner.persist(&entry)?;
            written += 1;
        }
        if written > 0 {
            debug!(realm = %hex_prefix(&self.inner.realm), written, "storage flushed");
        }
        Ok(written)
    }
}

impl<T: StorableObject> Clone for ObjectStorage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StorableObject> fmt::Debug for ObjectStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("realm", &hex_prefix(&self.inner.realm))
            .field("cached", &self.cached_len())
            .finish()
    }
}

fn hex_prefix(realm: &[u8]) -> String {
    realm.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reference-counted handle to a cached object.
///
/// Cloning retains the entry; dropping releases it. When the last handle is
/// dropped, pending modifications are written back and the entry leaves the
/// cache.
pub struct CachedObject<T: StorableObject> {
    storage: Arc<StorageInner<T>>,
    entry: Arc<CacheEntry<T>>,
}

impl<T: StorableObject> CachedObject<T> {
    /// Storage key of the object (without realm).
    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }

    /// Shared access to the object.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.entry.value.read().expect("lock poisoned")
    }

    /// Exclusive access to the object. Marks it modified.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let guard = self.entry.value.write().expect("lock poisoned");
        self.entry.modified.store(true, Ordering::Release);
        guard
    }

    /// `true` once the object was deleted from its storage.
    pub fn is_deleted(&self) -> bool {
        self.entry.deleted.load(Ordering::Acquire)
    }

    /// Clone of the current value.
    pub fn snapshot(&self) -> T
    where
        T: Clone,
    {
        self.read().clone()
    }
}

impl<T: StorableObject> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        self.entry.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            storage: Arc::clone(&self.storage),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<T: StorableObject> Drop for CachedObject<T> {
    fn drop(&mut self) {
        let mut cache = match self.storage.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if !self.entry.deleted.load(Ordering::Acquire) {
            if let Err(err) = self.storage.persist(&self.entry) {
                error!(
                    realm = %hex_prefix(&self.storage.realm),
                    error = %err,
                    "failed to persist released object"
                );
            }
        }
        let current = cache
            .get(&self.entry.key)
            .is_some_and(|cached| Arc::ptr_eq(cached, &self.entry));
        if current {
            cache.remove(&self.entry.key);
        }
    }
}

impl<T: StorableObject + fmt::Debug> fmt::Debug for CachedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedObject")
            .field("value", &*self.read())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
