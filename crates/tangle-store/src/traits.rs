use crate::error::StoreResult;

/// Ordered key/value backend.
///
/// Implementations must be safe to share between threads. Keys are opaque
/// byte strings; callers namespace them with a realm prefix.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Check whether `key` exists.
    fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Delete `key`. Returns `true` if it existed.
    fn delete(&self, key: &[u8]) -> StoreResult<bool>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<Vec<u8>>>;
}
