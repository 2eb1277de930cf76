use crate::snapshot::StateCache;

pub trait StateStorage {
    /// Write the whole cache as the current checkpoint.
    fn to_store(&mut self, cache: &StateCache) -> crate::Result<()>;

    /// Load the current checkpoint. An empty store yields an empty cache.
    fn from_store(&self) -> crate::Result<StateCache>;
}
