use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{Storage, StorageError};

const TEMP_PREFIX: &str = ".tmp-";

/// One file per key: the file name is the hex-encoded JSON key and the content is
/// the JSON value. Writes land in a temporary file first and are renamed into place.
#[derive(Debug)]
pub struct DiskStorage<K, V> {
    dir: PathBuf,
    _entries: PhantomData<fn() -> (K, V)>,
}

impl<K, V> DiskStorage<K, V> {
    /// Opens `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _entries: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<K: Serialize + DeserializeOwned, V: Serialize + DeserializeOwned> DiskStorage<K, V> {
    fn path_of(&self, key: &K) -> Result<PathBuf, StorageError> {
        let encoded = hex::encode(serde_json::to_vec(key)?);
        Ok(self.dir.join(encoded))
    }

    fn decode_key(file_name: &str) -> Result<K, StorageError> {
        let raw = hex::decode(file_name)
            .map_err(|e| StorageError::InvalidEntry(format!("{file_name}: {e}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn read_entry(path: &Path, file_name: &str) -> Result<(K, V), StorageError> {
        let key = Self::decode_key(file_name)?;
        let value = serde_json::from_slice(&fs::read(path)?)?;
        Ok((key, value))
    }
}

impl<K, V> Storage<K, V> for DiskStorage<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    fn get(&self, key: &K) -> Result<V, StorageError> {
        let bytes = match fs::read(self.path_of(key)?) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::UnknownKey)
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn set(&self, key: &K, value: &V) -> Result<(), StorageError> {
        let path = self.path_of(key)?;
        let body = serde_json::to_vec_pretty(value)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), StorageError> {
        match fs::remove_file(self.path_of(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn range(&self, f: &mut dyn FnMut(K, V) -> bool) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "skipping storage entry with a non utf-8 name");
                continue;
            };
            if file_name.starts_with(TEMP_PREFIX) {
                continue;
            }
            match Self::read_entry(&entry.path(), file_name) {
                Ok((key, value)) => {
                    if !f(key, value) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping unreadable storage entry");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::storage::{SamplerKey, SamplerRecord};

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SamplerKey::new("resource1", "sampler1");
        let record = SamplerRecord::default();
        {
            let storage = DiskStorage::<SamplerKey, SamplerRecord>::open(dir.path()).unwrap();
            storage.set(&key, &record).unwrap();
        }
        let storage = DiskStorage::<SamplerKey, SamplerRecord>::open(dir.path()).unwrap();
        assert_eq!(storage.get(&key).unwrap(), record);

        let mut seen = Vec::new();
        storage
            .range(&mut |k, _| {
                seen.push(k);
                true
            })
            .unwrap();
        assert_eq!(seen, vec![key.clone()]);

        storage.delete(&key).unwrap();
        assert!(matches!(storage.get(&key), Err(StorageError::UnknownKey)));
    }

    #[test]
    fn range_skips_temp_files_directories_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::<SamplerKey, SamplerRecord>::open(dir.path()).unwrap();
        storage
            .set(&SamplerKey::new("r", "n"), &SamplerRecord::default())
            .unwrap();
        fs::write(dir.path().join(".tmp-leftover"), b"{").unwrap();
        fs::write(dir.path().join("not-hex"), b"{}").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut count = 0;
        storage
            .range(&mut |_, _| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
