use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use super::{Storage, StorageError};

#[derive(Debug)]
pub struct MemoryStorage<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> MemoryStorage<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryStorage<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Storage<K, V> for MemoryStorage<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Result<V, StorageError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(StorageError::UnknownKey)
    }

    fn set(&self, key: &K, value: &V) -> Result<(), StorageError> {
        self.entries.lock().insert(key.clone(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn range(&self, f: &mut dyn FnMut(K, V) -> bool) -> Result<(), StorageError> {
        // Snapshot first so `f` never runs under the lock.
        let entries: Vec<(K, V)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let storage = MemoryStorage::<String, u32>::new();
        assert!(matches!(storage.get(&"a".into()), Err(StorageError::UnknownKey)));
        storage.set(&"a".into(), &1).unwrap();
        storage.set(&"a".into(), &2).unwrap();
        assert_eq!(storage.get(&"a".into()).unwrap(), 2);
        storage.delete(&"a".into()).unwrap();
        storage.delete(&"a".into()).unwrap();
        assert!(matches!(storage.get(&"a".into()), Err(StorageError::UnknownKey)));
    }

    #[test]
    fn range_stops_when_asked() {
        let storage = MemoryStorage::<u32, u32>::new();
        for i in 0..5 {
            storage.set(&i, &(i * 10)).unwrap();
        }
        let mut seen = 0;
        storage
            .range(&mut |_, _| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        assert_eq!(seen, 2);
    }
}
