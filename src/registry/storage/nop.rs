use super::{Storage, StorageError};

/// Accepts every write and forgets it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopStorage;

impl<K, V> Storage<K, V> for NopStorage {
    fn get(&self, _key: &K) -> Result<V, StorageError> {
        Err(StorageError::UnknownKey)
    }

    fn set(&self, _key: &K, _value: &V) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete(&self, _key: &K) -> Result<(), StorageError> {
        Ok(())
    }

    fn range(&self, _f: &mut dyn FnMut(K, V) -> bool) -> Result<(), StorageError> {
        Ok(())
    }
}
