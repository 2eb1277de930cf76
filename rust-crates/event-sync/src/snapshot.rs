use crate::{
    app::ecs::{
        EcsStore,
        apply_update,
    },
    events::{
        ComponentValue,
        NetworkComponentUpdate,
    },
};
use std::collections::{
    BTreeMap,
    HashMap,
};

pub type PackedIndex = u64;

pub fn pack(component_index: u32, entity_index: u32) -> PackedIndex {
    (u64::from(component_index) << 32) | u64::from(entity_index)
}

pub fn unpack(index: PackedIndex) -> (u32, u32) {
    ((index >> 32) as u32, index as u32)
}

/// Checkpointed world state: every live component value plus the block it
/// was observed at. Component and entity ids are interned by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateCache {
    pub state: BTreeMap<PackedIndex, ComponentValue>,
    pub block_number: u64,
    pub components: Vec<String>,
    pub entities: Vec<String>,
    component_to_index: HashMap<String, u32>,
    entity_to_index: HashMap<String, u32>,
    pub last_kamigaze_block: u64,
    pub last_kamigaze_entity: u64,
    pub last_kamigaze_component: u64,
    pub kamigaze_nonce: u64,
}

/// Persisted fields of a cache. The index maps are rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateCacheParts {
    pub state: BTreeMap<PackedIndex, ComponentValue>,
    pub block_number: u64,
    pub components: Vec<String>,
    pub entities: Vec<String>,
    pub last_kamigaze_block: u64,
    pub last_kamigaze_entity: u64,
    pub last_kamigaze_component: u64,
    pub kamigaze_nonce: u64,
}

impl StateCache {
    pub fn from_parts(parts: StateCacheParts) -> Self {
        let component_to_index = index_map(&parts.components);
        let entity_to_index = index_map(&parts.entities);
        Self {
            state: parts.state,
            block_number: parts.block_number,
            components: parts.components,
            entities: parts.entities,
            component_to_index,
            entity_to_index,
            last_kamigaze_block: parts.last_kamigaze_block,
            last_kamigaze_entity: parts.last_kamigaze_entity,
            last_kamigaze_component: parts.last_kamigaze_component,
            kamigaze_nonce: parts.kamigaze_nonce,
        }
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn store_event(&mut self, update: &NetworkComponentUpdate) {
        let component = intern(&mut self.components, &mut self.component_to_index, &update.component);
        let entity = intern(&mut self.entities, &mut self.entity_to_index, &update.entity);
        let key = pack(component, entity);
        match &update.value {
            Some(value) => {
                self.state.insert(key, value.clone());
            }
            None => {
                self.state.remove(&key);
            }
        }
        self.set_block_number(update.block_number);
    }

    pub fn get(&self, component: &str, entity: &str) -> Option<&ComponentValue> {
        let component = *self.component_to_index.get(component)?;
        let entity = *self.entity_to_index.get(entity)?;
        self.state.get(&pack(component, entity))
    }

    /// Never moves backward.
    pub fn set_block_number(&mut self, block_number: u64) {
        self.block_number = self.block_number.max(block_number);
    }

    /// Applies every cached value to `store`, returning how many were applied.
    pub fn replay_into<E: EcsStore>(&self, store: &mut E) -> usize {
        let mut replayed = 0;
        for (key, value) in &self.state {
            let (component, entity) = unpack(*key);
            let (Some(component), Some(entity)) = (
                self.components.get(component as usize),
                self.entities.get(entity as usize),
            ) else {
                tracing::warn!(key, "Cached value points at an unknown index, skipping");
                continue;
            };
            apply_update(
                store,
                &NetworkComponentUpdate {
                    component: component.clone(),
                    entity: entity.clone(),
                    value: Some(value.clone()),
                    block_number: self.block_number,
                    last_event_in_tx: true,
                    tx_hash: String::new(),
                    tx_metadata: None,
                },
            );
            replayed += 1;
        }
        replayed
    }

    pub fn to_parts(&self) -> StateCacheParts {
        StateCacheParts {
            state: self.state.clone(),
            block_number: self.block_number,
            components: self.components.clone(),
            entities: self.entities.clone(),
            last_kamigaze_block: self.last_kamigaze_block,
            last_kamigaze_entity: self.last_kamigaze_entity,
            last_kamigaze_component: self.last_kamigaze_component,
            kamigaze_nonce: self.kamigaze_nonce,
        }
    }
}

fn index_map(ids: &[String]) -> HashMap<String, u32> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i as u32))
        .collect()
}

fn intern(ids: &mut Vec<String>, index: &mut HashMap<String, u32>, id: &str) -> u32 {
    if let Some(i) = index.get(id) {
        return *i;
    }
    let i = ids.len() as u32;
    ids.push(id.to_string());
    index.insert(id.to_string(), i);
    i
}
