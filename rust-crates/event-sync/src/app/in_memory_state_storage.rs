use crate::{
    app::state_storage::StateStorage,
    lock,
    snapshot::{
        StateCache,
        StateCacheParts,
    },
};
use std::sync::{
    Arc,
    Mutex,
};

#[derive(Clone, Default)]
pub struct InMemoryStateStorage {
    checkpoint: Arc<Mutex<Option<StateCacheParts>>>,
    writes: Arc<Mutex<Vec<u64>>>,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_cache(cache: &StateCache) -> Self {
        let storage = Self::default();
        *lock(&storage.checkpoint) = Some(cache.to_parts());
        storage
    }

    /// Block number of every checkpoint written, in order.
    pub fn checkpoint_blocks(&self) -> Vec<u64> {
        lock(&self.writes).clone()
    }
}

impl StateStorage for InMemoryStateStorage {
    fn to_store(&mut self, cache: &StateCache) -> crate::Result<()> {
        *lock(&self.checkpoint) = Some(cache.to_parts());
        lock(&self.writes).push(cache.block_number);
        Ok(())
    }

    fn from_store(&self) -> crate::Result<StateCache> {
        let parts = lock(&self.checkpoint).clone().unwrap_or_default();
        Ok(StateCache::from_parts(parts))
    }
}
