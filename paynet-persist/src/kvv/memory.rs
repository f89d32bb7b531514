use crate::kvv::{Error, KVVPersister, KVVStore, KVV};
use log::*;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A key-version-value in-memory store.
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
    store_id: [u8; 16],
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl MemoryKVVStore {
    /// Create a new MemoryKVVStore
    pub fn new() -> KVVPersister<Self> {
        Self::with_store_id([0; 16])
    }

    /// Create a new MemoryKVVStore reporting the given store id
    pub fn with_store_id(store_id: [u8; 16]) -> KVVPersister<Self> {
        let store = Self { data: Mutex::new(BTreeMap::new()), store_id };
        KVVPersister(store)
    }

    fn data(&self) -> MutexGuard<BTreeMap<String, (u64, Vec<u8>)>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_version(
    key: &str,
    version: u64,
    value: &[u8],
    existing: Option<&(u64, Vec<u8>)>,
) -> Result<bool, Error> {
    if let Some((ver, val)) = existing {
        if version < *ver {
            error!("version mismatch for {}: {} < {}", key, version, ver);
            // version cannot go backwards
            return Err(Error::VersionMismatch(format!("{}: {} < {}", key, version, ver)));
        } else if version == *ver {
            // if same version, value must not have changed
            if val.as_slice() != value {
                error!("value mismatch for {}: {}", key, version);
                return Err(Error::VersionMismatch(format!("{}: value changed at {}", key, version)));
            }
            return Ok(false);
        }
    }
    Ok(true)
}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let mut data = self.data();
        if check_version(key, version, &value, data.get(key))? {
            data.insert(key.to_string(), (version, value));
        }
        Ok(())
    }

    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        let mut data = self.data();
        for kvv in kvvs.iter() {
            let (version, value) = &kvv.1;
            check_version(&kvv.0, *version, value, data.get(&kvv.0))?;
        }
        for kvv in kvvs.into_iter() {
            let (key, vv) = kvv.into_inner();
            data.insert(key, vv);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        Ok(self.data().get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.data().get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data();
        let mut result = Vec::new();
        for (k, (ver, value)) in data.range(prefix.to_string()..) {
            if k.starts_with(prefix) {
                result.push(KVV(k.clone(), (*ver, value.clone())));
            } else {
                break;
            }
        }
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data().clear();
        Ok(())
    }

    fn store_id(&self) -> [u8; 16] {
        self.store_id
    }
}
