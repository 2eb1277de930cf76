// Sled-backed checkpoint storage, one tree per bucket.
use crate::{
    app::state_storage::StateStorage,
    events::ComponentValue,
    snapshot::{
        PackedIndex,
        StateCache,
        StateCacheParts,
    },
};
use anyhow::Context;
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use sled::{
    Config,
    Db,
    Transactional,
    Tree,
    transaction::ConflictableTransactionError,
};
use std::{
    collections::BTreeMap,
    convert::{
        Infallible,
        TryInto,
    },
    path::Path,
};

const CURRENT_KEY: &[u8] = b"current";
const COMPONENTS_KEY: &[u8] = b"components";
const ENTITIES_KEY: &[u8] = b"entities";

#[derive(Clone)]
pub struct SledStateStorage {
    component_values: Tree,
    mappings: Tree,
    block_number: Tree,
    last_kamigaze_block: Tree,
    last_kamigaze_entity: Tree,
    last_kamigaze_component: Tree,
    kamigaze_nonce: Tree,
}

impl SledStateStorage {
    pub fn new(db: &Db) -> crate::Result<Self> {
        Ok(Self {
            component_values: open_tree(db, "ComponentValues")?,
            mappings: open_tree(db, "Mappings")?,
            block_number: open_tree(db, "BlockNumber")?,
            last_kamigaze_block: open_tree(db, "LastKamigazeBlock")?,
            last_kamigaze_entity: open_tree(db, "LastKamigazeEntity")?,
            last_kamigaze_component: open_tree(db, "LastKamigazeComponent")?,
            kamigaze_nonce: open_tree(db, "KamigazeNonce")?,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let config = Config::default().path(path);
        let db = config.open().context("open sled database")?;
        Self::new(&db)
    }

    fn read_values(&self) -> crate::Result<BTreeMap<PackedIndex, ComponentValue>> {
        let mut state = BTreeMap::new();
        for entry in self.component_values.iter() {
            let (key, value) = entry.context("iterate component values")?;
            let index = PackedIndex::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .context("component value key must be 8 bytes")?,
            );
            state.insert(index, deserialize(value.as_ref())?);
        }
        Ok(state)
    }

    fn read_ids(&self, key: &[u8]) -> crate::Result<Vec<String>> {
        match self.mappings.get(key)? {
            Some(value) => deserialize(value.as_ref()),
            None => Ok(Vec::new()),
        }
    }
}

impl StateStorage for SledStateStorage {
    /// Commits the whole checkpoint in one transaction across all trees, so a
    /// reader after a crash sees either the previous checkpoint or this one.
    fn to_store(&mut self, cache: &StateCache) -> crate::Result<()> {
        let mut values = Vec::with_capacity(cache.state.len());
        for (index, value) in &cache.state {
            values.push((index.to_be_bytes(), serialize(value, "component value")?));
        }
        let mut stale = Vec::new();
        for key in self.component_values.iter().keys() {
            let key = key.context("iterate component values")?;
            let live = <[u8; 8]>::try_from(key.as_ref())
                .map(|bytes| cache.state.contains_key(&PackedIndex::from_be_bytes(bytes)))
                .unwrap_or(false);
            if !live {
                stale.push(key);
            }
        }
        let components = serialize(&cache.components, "component mappings")?;
        let entities = serialize(&cache.entities, "entity mappings")?;

        (
            &self.component_values,
            &self.mappings,
            &self.last_kamigaze_block,
            &self.last_kamigaze_entity,
            &self.last_kamigaze_component,
            &self.kamigaze_nonce,
            &self.block_number,
        )
            .transaction(|(values_tree, mappings, kami_block, kami_entity, kami_component, kami_nonce, block)| {
                for key in &stale {
                    values_tree.remove(key.clone())?;
                }
                for (key, value) in &values {
                    values_tree.insert(key.as_slice(), value.as_slice())?;
                }
                mappings.insert(COMPONENTS_KEY, components.as_slice())?;
                mappings.insert(ENTITIES_KEY, entities.as_slice())?;
                kami_block.insert(CURRENT_KEY, cache.last_kamigaze_block.to_be_bytes().as_slice())?;
                kami_entity.insert(CURRENT_KEY, cache.last_kamigaze_entity.to_be_bytes().as_slice())?;
                kami_component.insert(CURRENT_KEY, cache.last_kamigaze_component.to_be_bytes().as_slice())?;
                kami_nonce.insert(CURRENT_KEY, cache.kamigaze_nonce.to_be_bytes().as_slice())?;
                block.insert(CURRENT_KEY, cache.block_number.to_be_bytes().as_slice())?;
                Ok::<_, ConflictableTransactionError<Infallible>>(())
            })
            .context("commit checkpoint")?;
        self.block_number.flush().context("flush checkpoint")?;
        Ok(())
    }

    fn from_store(&self) -> crate::Result<StateCache> {
        let parts = StateCacheParts {
            state: self.read_values()?,
            block_number: read_u64(&self.block_number)?,
            components: self.read_ids(COMPONENTS_KEY)?,
            entities: self.read_ids(ENTITIES_KEY)?,
            last_kamigaze_block: read_u64(&self.last_kamigaze_block)?,
            last_kamigaze_entity: read_u64(&self.last_kamigaze_entity)?,
            last_kamigaze_component: read_u64(&self.last_kamigaze_component)?,
            kamigaze_nonce: read_u64(&self.kamigaze_nonce)?,
        };
        Ok(StateCache::from_parts(parts))
    }
}

fn open_tree(db: &Db, name: &str) -> crate::Result<Tree> {
    db.open_tree(name)
        .with_context(|| format!("open {name} tree"))
}

fn read_u64(tree: &Tree) -> crate::Result<u64> {
    match tree.get(CURRENT_KEY)? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_ref()
                .try_into()
                .context("stored counter should be 8 bytes")?;
            Ok(u64::from_be_bytes(arr))
        }
        None => Ok(0),
    }
}

fn serialize<T: Serialize>(value: &T, label: &str) -> crate::Result<Vec<u8>> {
    serde_json::to_vec(value).with_context(|| format!("serialize {label}"))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    serde_json::from_slice(bytes).context("deserialize sled record")
}
