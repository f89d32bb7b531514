pub mod memory;
#[cfg(feature = "redb-kvv")]
pub mod redb;

use crate::model::*;
use core::fmt::Debug;
use core::ops::Deref;
use paynet::channel::{Channel, ChannelId};
use paynet::commitment::Commitment;
use paynet::node::NodeState;
use paynet::peer::NodeId;
use paynet::persist::{CommitmentSide, Error, Persist};
use paynet::routing::RoutingEntry;
use serde::de::DeserializeOwned;
use serde::Serialize;

const NODE_STATE_PREFIX: &str = "node/state";
const CHANNEL_PREFIX: &str = "channel";
const COMMITMENT_PREFIX: &str = "commitment";
const ROUTE_PREFIX: &str = "route";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&self.1 .1).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store
pub trait KVVStore: Send + Sync {
    type Iter: Iterator<Item = KVV>;

    /// Put a key-value pair into the store, bumping its version
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// If the key already exists, the version must be greater than the existing version.
    fn put_with_version(&self, key: &str, version: u64, value: Vec<u8>) -> Result<(), Error>;
    /// Atomically put several KVVs into the store
    fn put_batch(&self, kvvs: Vec<KVV>) -> Result<(), Error>;
    /// Get a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
    /// A random identifier fixed when the store was created
    fn store_id(&self) -> [u8; 16];
}

/// Adapter for a KVVStore to implement Persist.
// NOTE: we can't use a generic impl because Persist is not in this crate.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> KVVPersister<S> {
    fn next_version(&self, key: &str) -> Result<u64, Error> {
        Ok(self.get_version(key)?.map(|v| v + 1).unwrap_or(0))
    }

    fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get(key)? {
            Some((_, value)) => Ok(Some(decode(key, &value)?)),
            None => Ok(None),
        }
    }

    fn commitment_kvvs(&self, node_id: &NodeId, channel: &Channel) -> Result<Vec<KVV>, Error> {
        let mut kvvs = Vec::with_capacity(2);
        for (side, commitment) in [
            (CommitmentSide::Holder, &channel.holder_commitment),
            (CommitmentSide::Counterparty, &channel.counterparty_commitment),
        ] {
            let key = commitment_key(node_id, &channel.id, side);
            let version = self.next_version(&key)?;
            kvvs.push(KVV(key, (version, encode(&CommitmentEntry::from(commitment))?)));
        }
        Ok(kvvs)
    }

    fn load_commitment(
        &self,
        node_id: &NodeId,
        channel_id: &ChannelId,
        side: CommitmentSide,
    ) -> Result<Commitment, Error> {
        let key = commitment_key(node_id, channel_id, side);
        let entry: CommitmentEntry = self
            .get_entry(&key)?
            .ok_or_else(|| Error::NotFound(format!("{} commitment of {}", side.as_str(), channel_id)))?;
        entry.try_into()
    }

    fn load_channel(
        &self,
        node_id: &NodeId,
        channel_id: &ChannelId,
        entry: ChannelEntry,
    ) -> Result<Channel, Error> {
        let holder = self.load_commitment(node_id, channel_id, CommitmentSide::Holder)?;
        let counterparty = self.load_commitment(node_id, channel_id, CommitmentSide::Counterparty)?;
        Ok(entry.into_channel(holder, counterparty))
    }
}

impl<S: KVVStore> Persist for KVVPersister<S> {
    fn new_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error> {
        let key = make_key(NODE_STATE_PREFIX, &node_id.pubkey().serialize());
        if self.get_version(&key)?.is_some() {
            return Err(Error::AlreadyExists(format!("node {}", node_id)));
        }
        self.put(&key, encode(&NodeStateEntry::from(state))?)
    }

    fn update_node(&self, node_id: &NodeId, state: &NodeState) -> Result<(), Error> {
        let key = make_key(NODE_STATE_PREFIX, &node_id.pubkey().serialize());
        self.put(&key, encode(&NodeStateEntry::from(state))?)
    }

    fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeState>, Error> {
        let key = make_key(NODE_STATE_PREFIX, &node_id.pubkey().serialize());
        Ok(self.get_entry::<NodeStateEntry>(&key)?.map(NodeState::from))
    }

    fn new_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error> {
        let key = channel_key(node_id, &channel.id);
        if self.get_version(&key)?.is_some() {
            return Err(Error::AlreadyExists(format!("channel {}", channel.id)));
        }
        let mut kvvs = self.commitment_kvvs(node_id, channel)?;
        kvvs.push(KVV(key, (0, encode(&ChannelEntry::from(channel))?)));
        self.put_batch(kvvs)
    }

    fn update_channel(&self, node_id: &NodeId, channel: &Channel) -> Result<(), Error> {
        let key = channel_key(node_id, &channel.id);
        let version = self
            .get_version(&key)?
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel.id)))?;
        let mut kvvs = self.commitment_kvvs(node_id, channel)?;
        kvvs.push(KVV(key, (version + 1, encode(&ChannelEntry::from(channel))?)));
        self.put_batch(kvvs)
    }

    fn get_channel(&self, node_id: &NodeId, channel_id: &ChannelId) -> Result<Channel, Error> {
        let key = channel_key(node_id, channel_id);
        let entry: ChannelEntry = self
            .get_entry(&key)?
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel_id)))?;
        self.load_channel(node_id, channel_id, entry)
    }

    fn get_node_channels(&self, node_id: &NodeId) -> Result<Vec<Channel>, Error> {
        let prefix = make_key(CHANNEL_PREFIX, &node_id.pubkey().serialize()) + SEPARATOR;
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_r, value)) = kvv.into_inner();
            let suffix = extract_key_suffix(&prefix, &key)?;
            let channel_id = ChannelId::new(
                suffix
                    .try_into()
                    .map_err(|_| Error::Internal(format!("bad channel id in key {}", key)))?,
            );
            let entry: ChannelEntry = decode(&key, &value)?;
            res.push(self.load_channel(node_id, &channel_id, entry)?);
        }
        Ok(res)
    }

    fn update_route(&self, node_id: &NodeId, entry: &RoutingEntry) -> Result<(), Error> {
        let key = make_key2(
            ROUTE_PREFIX,
            &node_id.pubkey().serialize(),
            &entry.destination.pubkey().serialize(),
        );
        self.put(&key, encode(entry)?)
    }

    fn get_routes(&self, node_id: &NodeId) -> Result<Vec<RoutingEntry>, Error> {
        let prefix = make_key(ROUTE_PREFIX, &node_id.pubkey().serialize()) + SEPARATOR;
        self.get_prefix(&prefix)?
            .map(KVV::into_inner)
            .map(|(key, (_r, value))| decode(&key, &value))
            .collect()
    }

    fn clear_database(&self) -> Result<(), Error> {
        // delegate to the underlying store
        self.0.clear_database()
    }
}

fn encode<T: Serialize>(entry: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(entry).map_err(|e| Error::Internal(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(key: &str, value: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(value).map_err(|e| Error::Internal(format!("decode {}: {}", key, e)))
}

fn channel_key(node_id: &NodeId, channel_id: &ChannelId) -> String {
    make_key2(CHANNEL_PREFIX, &node_id.pubkey().serialize(), channel_id.as_slice())
}

fn commitment_key(node_id: &NodeId, channel_id: &ChannelId, side: CommitmentSide) -> String {
    make_key2(COMMITMENT_PREFIX, &node_id.pubkey().serialize(), channel_id.as_slice())
        + SEPARATOR
        + side.as_str()
}

fn make_key(prefix: impl Into<String>, key: &[u8]) -> String {
    format!("{}/{}", prefix.into(), hex::encode(key))
}

fn make_key2(prefix: impl Into<String>, key1: &[u8], key2: &[u8]) -> String {
    format!("{}/{}/{}", prefix.into(), hex::encode(key1), hex::encode(key2))
}

fn extract_key_suffix(prefix: &str, key: &str) -> Result<Vec<u8>, Error> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Internal(format!("key {} outside {}", key, prefix)))?;
    hex::decode(suffix).map_err(|e| Error::Internal(format!("invalid hex in key {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvv::memory::MemoryKVVStore;
    use paynet::channel::{BalanceSplit, ChannelStatus};
    use paynet::routing::RouteMetadata;
    use paynet::util::test_utils::*;
    use test_log::test;

    #[test]
    fn node_state_test() {
        let persister = MemoryKVVStore::new();
        let node_id = make_test_node_id(1);
        assert!(persister.get_node(&node_id).unwrap().is_none());
        persister.new_node(&node_id, &NodeState::default()).unwrap();
        assert!(matches!(
            persister.new_node(&node_id, &NodeState::default()),
            Err(Error::AlreadyExists(_))
        ));
        persister.update_node(&node_id, &NodeState { next_key_index: 3 }).unwrap();
        assert_eq!(persister.get_node(&node_id).unwrap().unwrap().next_key_index, 3);
    }

    #[test]
    fn channel_test() {
        let persister = MemoryKVVStore::new();
        let node_id = make_test_node_id(1);
        let pair = make_test_channel_pair(100_000, 1_000);
        let mut channel = pair.a;

        assert!(matches!(persister.update_channel(&node_id, &channel), Err(Error::NotFound(_))));
        persister.new_channel(&node_id, &channel).unwrap();
        assert!(matches!(persister.new_channel(&node_id, &channel), Err(Error::AlreadyExists(_))));
        assert_eq!(persister.get_channel(&node_id, &channel.id).unwrap(), channel);

        let pending = channel
            .propose_update(&pair.secp_ctx, &pair.sk_a, &BalanceSplit::new(60_000, 39_000))
            .unwrap();
        channel.holder_commitment = pending.holder_commitment;
        channel.counterparty_commitment = pending.counterparty_commitment;
        channel.status = ChannelStatus::Closing;
        persister.update_channel(&node_id, &channel).unwrap();

        let channels = persister.get_node_channels(&node_id).unwrap();
        assert_eq!(channels, vec![channel.clone()]);
        assert_eq!(channels[0].holder_commitment.number, 1);

        // channels are per node
        assert!(persister.get_node_channels(&make_test_node_id(2)).unwrap().is_empty());
        assert!(matches!(
            persister.get_channel(&make_test_node_id(2), &channel.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn route_test() {
        let persister = MemoryKVVStore::new();
        let (a, b, c) = (make_test_node_id(1), make_test_node_id(2), make_test_node_id(3));
        let metadata = RouteMetadata { origin: b, via_channel: ChannelId::new([1; 32]), hops: 0 };
        let direct = RoutingEntry { destination: b, next_hop: b, metadata: metadata.clone() };
        let relayed = RoutingEntry {
            destination: c,
            next_hop: b,
            metadata: RouteMetadata { hops: 1, ..metadata.clone() },
        };
        persister.update_route(&a, &direct).unwrap();
        persister.update_route(&a, &relayed).unwrap();
        assert_eq!(persister.get_routes(&a).unwrap().len(), 2);

        // upsert by destination
        let replaced = RoutingEntry { next_hop: c, ..relayed.clone() };
        persister.update_route(&a, &replaced).unwrap();
        let routes = persister.get_routes(&a).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&replaced));
        assert!(persister.get_routes(&b).unwrap().is_empty());

        persister.clear_database().unwrap();
        assert!(persister.get_routes(&a).unwrap().is_empty());
    }
}
