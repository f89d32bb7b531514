use super::{KVVPersister, KVVStore, KVV};
use paynet::persist::Error;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::*;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

// this is stored in the meta table, so there's no opportunity for a collision
const STORE_ID_KEY: &str = "store_id";

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

fn db_error(e: impl Into<redb::Error>) -> Error {
    Error::Internal(format!("redb: {}", e.into()))
}

/// A key-version-value store backed by redb
pub struct RedbKVVStore {
    db: Database,
    // current versions for each key, so versioning can be enforced without reading values
    versions: Mutex<BTreeMap<String, u64>>,
    store_id: [u8; 16],
}

impl RedbKVVStore {
    /// Open or create the store in the directory `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<KVVPersister<Self>, Error> {
        Ok(KVVPersister(Self::new_store(path)?))
    }

    /// Open or create the bare store in the directory `path`
    pub fn new_store<P: AsRef<Path>>(path: P) -> Result<RedbKVVStore, Error> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)
                .map_err(|e| Error::Unavailable(format!("create {}: {}", path.display(), e)))?;
        }
        if !path.is_dir() {
            return Err(Error::Unavailable(format!("{} is not a directory", path.display())));
        }
        let mut db = Database::create(path.join("redb")).map_err(db_error)?;
        if !db.check_integrity().map_err(db_error)? {
            warn!("redb at {} was repaired", path.display());
        }

        let store_id = {
            // create the tables and the store id if they don't exist
            let tx = db.begin_write().map_err(db_error)?;
            tx.open_table(TABLE).map_err(db_error)?;
            let mut id_table = tx.open_table(META_TABLE).map_err(db_error)?;
            let existing = id_table
                .get(STORE_ID_KEY)
                .map_err(db_error)?
                .and_then(|id| <[u8; 16]>::try_from(id.value()).ok());
            let store_id = match existing {
                Some(id) => id,
                None => {
                    let store_id = uuid::Uuid::new_v4().into_bytes();
                    id_table.insert(STORE_ID_KEY, store_id.as_slice()).map_err(db_error)?;
                    store_id
                }
            };
            drop(id_table);
            tx.commit().map_err(db_error)?;
            store_id
        };

        let mut versions = BTreeMap::new();
        {
            // load the current versions
            let tx = db.begin_read().map_err(db_error)?;
            let table = tx.open_table(TABLE).map_err(db_error)?;
            for item in table.iter().map_err(db_error)? {
                let (key, vv) = item.map_err(db_error)?;
                let (version, _) = Self::decode_vv(vv.value())?;
                versions.insert(key.value().to_string(), version);
            }
        }
        info!("opened redb store {} with {} keys", uuid::Uuid::from_bytes(store_id), versions.len());

        Ok(Self { db, versions: Mutex::new(versions), store_id })
    }

    fn versions(&self) -> MutexGuard<BTreeMap<String, u64>> {
        self.versions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode_vv(vv: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if vv.len() < 8 {
            return Err(Error::Internal(format!("short value of {} bytes", vv.len())));
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&vv[..8]);
        Ok((u64::from_be_bytes(version), vv[8..].to_vec()))
    }

    fn encode_vv(version: u64, value: Vec<u8>) -> Vec<u8> {
        let mut vv = Vec::with_capacity(value.len() + 8);
        vv.extend_from_slice(&version.to_be_bytes());
        vv.extend_from_slice(&value);
        vv
    }
}

impl KVVStore for RedbKVVStore {
    type Iter = Iter;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let version = self.versions().get(key).map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error> {
        let vv = Self::encode_vv(version, value);
        let mut versions = self.versions();

        if let Some(v) = versions.get(key) {
            if version < *v {
                error!("version mismatch for {}: {} < {}", key, version, v);
                // version cannot go backwards
                return Err(Error::VersionMismatch(format!("{}: {} < {}", key, version, v)));
            } else if version == *v {
                // if same version, value must not have changed
                let tx = self.db.begin_read().map_err(db_error)?;
                let table = tx.open_table(TABLE).map_err(db_error)?;
                let existing = table.get(key).map_err(db_error)?;
                if existing.map(|e| e.value() != vv.as_slice()).unwrap_or(true) {
                    error!("value mismatch for {}: {}", key, version);
                    return Err(Error::VersionMismatch(format!("{}: value changed at {}", key, version)));
                }
                return Ok(());
            }
        }
        let tx = self.db.begin_write().map_err(db_error)?;
        {
            let mut table = tx.open_table(TABLE).map_err(db_error)?;
            table.insert(key, vv.as_slice()).map_err(db_error)?;
        }
        tx.commit().map_err(db_error)?;
        versions.insert(key.to_string(), version);
        Ok(())
    }

    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error> {
        let tx = self.db.begin_write().map_err(db_error)?;
        let mut table = tx.open_table(TABLE).map_err(db_error)?;
        let mut mismatch = None;
        let mut staged_versions: BTreeMap<String, u64> = BTreeMap::new();
        let mut versions = self.versions();

        for kvv in kvvs.into_iter() {
            let (key, (version, value)) = kvv.into_inner();
            let vv = Self::encode_vv(version, value);
            if let Some(v) = versions.get(&key) {
                if version < *v {
                    // version cannot go backwards
                    error!("version mismatch for {}: {} < {}", key, version, v);
                    mismatch = Some(format!("{}: {} < {}", key, version, v));
                    continue;
                } else if version == *v {
                    // if same version, value must not have changed
                    let existing = table.get(key.as_str()).map_err(db_error)?;
                    if existing.map(|e| e.value() != vv.as_slice()).unwrap_or(true) {
                        error!("value mismatch for {}: {}", key, version);
                        mismatch = Some(format!("{}: value changed at {}", key, version));
                    }
                    continue;
                }
            }
            table.insert(key.as_str(), vv.as_slice()).map_err(db_error)?;
            staged_versions.insert(key, version);
        }
        drop(table);
        if let Some(reason) = mismatch {
            // be explicit about aborting the transaction
            tx.abort().map_err(db_error)?;
            return Err(Error::VersionMismatch(reason));
        }
        tx.commit().map_err(db_error)?;
        versions.extend(staged_versions);
        Ok(())
    }

    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let tx = self.db.begin_read().map_err(db_error)?;
        let table = tx.open_table(TABLE).map_err(db_error)?;
        match table.get(key).map_err(db_error)? {
            Some(vv) => Ok(Some(Self::decode_vv(vv.value())?)),
            None => Ok(None),
        }
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        Ok(self.versions().get(key).copied())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let tx = self.db.begin_read().map_err(db_error)?;
        let table = tx.open_table(TABLE).map_err(db_error)?;
        let mut result = Vec::new();
        for item in table.range(prefix..).map_err(db_error)? {
            let (key, vv) = item.map_err(db_error)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let (version, value) = Self::decode_vv(vv.value())?;
            result.push(KVV(key.value().to_string(), (version, value)));
        }
        Ok(Iter(result.into_iter()))
    }

    fn clear_database(&self) -> Result<(), Error> {
        let tx = self.db.begin_write().map_err(db_error)?;
        tx.delete_table(TABLE).map_err(db_error)?;
        tx.open_table(TABLE).map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        self.versions().clear();
        Ok(())
    }

    fn store_id(&self) -> [u8; 16] {
        self.store_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paynet::channel::BalanceSplit;
    use paynet::persist::Persist;
    use paynet::util::test_utils::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test_log::test]
    fn basic_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        store.put("foo1", b"bar".to_vec())?;
        store.put("foo2", b"boo".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 0);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar");
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        store.put_with_version("foo1", 1, b"bar2".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar2");

        // wrong version
        assert!(store.put_with_version("foo1", 0, b"bar2".to_vec()).is_err());

        // the id and the versions survive a reopen
        let id = store.store_id();
        drop(store);
        let store = RedbKVVStore::new_store(tempdir.path())?;
        assert_eq!(store.store_id(), id);
        assert_eq!(store.get_version("foo1")?, Some(1));

        store.clear_database()?;
        assert!(store.get("foo1")?.is_none());
        assert_eq!(store.get_prefix("foo")?.count(), 0);
        Ok(())
    }

    #[test_log::test]
    fn put_batch_test() -> Result<(), Error> {
        let tempdir = tempfile::tempdir().unwrap();
        let store = RedbKVVStore::new_store(tempdir.path())?;
        let kvvs = vec![
            KVV("foo1".to_string(), (0, b"bar".to_vec())),
            KVV("foo1".to_string(), (0, b"bar".to_vec())),
            KVV("foo2".to_string(), (0, b"bar".to_vec())),
        ];
        assert!(store.put_batch(kvvs).is_ok());
        let kvvs = vec![
            KVV("foo1".to_string(), (1, b"bar2".to_vec())),
            KVV("foo2".to_string(), (0, b"bar3".to_vec())),
        ];
        assert!(store.put_batch(kvvs).is_err());
        // the aborted batch left foo1 alone
        assert_eq!(store.get("foo1")?.unwrap(), (0, b"bar".to_vec()));
        store.put_with_version("foo1", 1, b"bar3".to_vec())?;
        assert_eq!(store.get_version("foo1")?.unwrap(), 1);
        assert_eq!(store.get("foo1")?.unwrap().1, b"bar3");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn node_restart_test() {
        let tempdir = tempfile::tempdir().unwrap();
        let net = TestNetwork::new();
        let persister: Arc<dyn Persist> = Arc::new(RedbKVVStore::new(tempdir.path()).unwrap());
        let alice = net.add_node_with_persister("alice", persister, |c| c.commitment_fee_sat = 0);
        let bob = net.add_node("bob", 0);
        let channel_id = alice.open(&bob.config().listen_addr, 100).await.unwrap();
        alice.pay(&channel_id, 30).await.unwrap();
        let before = alice.channel(&channel_id).await.unwrap();
        // redb allows one open handle, so wait for in-flight calls to let go
        assert!(wait_until(Duration::from_secs(2), || Arc::strong_count(&alice) == 1).await);
        drop(alice);

        // a fresh store handle over the same files
        let persister: Arc<dyn Persist> = Arc::new(RedbKVVStore::new(tempdir.path()).unwrap());
        let alice = net.add_node_with_persister("alice", persister, |c| c.commitment_fee_sat = 0);
        assert_eq!(alice.channel(&channel_id).await.unwrap(), before);
        assert_eq!(alice.routing_table().lookup(&bob.get_id()).unwrap().next_hop, bob.get_id());

        alice.pay(&channel_id, 10).await.unwrap();
        assert_eq!(bob.balance(&channel_id).await.unwrap(), BalanceSplit::new(40, 60));
        let second = alice.open(&bob.config().listen_addr, 100).await.unwrap();
        let restored = alice.channel(&second).await.unwrap();
        assert_ne!(restored.setup.funding_pubkey, before.setup.funding_pubkey);
    }
}
