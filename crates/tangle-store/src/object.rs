use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

/// An entity that can live in an [`ObjectStorage`](crate::ObjectStorage).
///
/// The key identifies the entity within its storage realm. Keys of related
/// entities should share a prefix so they can be scanned together.
pub trait StorableObject: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn object_key(&self) -> Vec<u8>;
}

/// Encode an object for the backend.
pub fn encode<T: Serialize>(object: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(object)?)
}

/// Decode an object read from the backend.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(bincode::deserialize(bytes)?)
}
