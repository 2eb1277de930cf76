use crate::events::{
    ComponentValue,
    NetworkComponentUpdate,
};
use std::collections::{
    BTreeSet,
    HashMap,
};

/// Client-side entity store the sync loop writes into.
pub trait EcsStore {
    fn create_entity(&mut self, entity: &str);
    fn has_entity(&self, entity: &str) -> bool;
    fn set_component(&mut self, component: &str, entity: &str, value: ComponentValue);
    /// Merges object fields into the current value; anything else overwrites.
    fn update_component(&mut self, component: &str, entity: &str, value: ComponentValue);
    fn remove_component(&mut self, component: &str, entity: &str);
    fn get_component_value(&self, component: &str, entity: &str) -> Option<&ComponentValue>;
    fn has_component(&self, component: &str, entity: &str) -> bool {
        self.get_component_value(component, entity).is_some()
    }
}

pub fn apply_update<E: EcsStore + ?Sized>(store: &mut E, update: &NetworkComponentUpdate) {
    match &update.value {
        Some(value) => {
            if !store.has_entity(&update.entity) {
                store.create_entity(&update.entity);
            }
            store.set_component(&update.component, &update.entity, value.clone());
        }
        None => store.remove_component(&update.component, &update.entity),
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct InMemoryEcs {
    entities: BTreeSet<String>,
    components: HashMap<String, HashMap<String, ComponentValue>>,
}

impl InMemoryEcs {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Entities holding a value for `component`.
    pub fn entities_with(&self, component: &str) -> Vec<&str> {
        let mut entities: Vec<&str> = self
            .components
            .get(component)
            .map(|values| values.keys().map(String::as_str).collect())
            .unwrap_or_default();
        entities.sort_unstable();
        entities
    }
}

impl EcsStore for InMemoryEcs {
    fn create_entity(&mut self, entity: &str) {
        self.entities.insert(entity.to_string());
    }

    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains(entity)
    }

    fn set_component(&mut self, component: &str, entity: &str, value: ComponentValue) {
        self.components
            .entry(component.to_string())
            .or_default()
            .insert(entity.to_string(), value);
    }

    fn update_component(&mut self, component: &str, entity: &str, value: ComponentValue) {
        let values = self.components.entry(component.to_string()).or_default();
        match (values.get_mut(entity), value) {
            (Some(ComponentValue::Object(current)), ComponentValue::Object(patch)) => {
                current.extend(patch);
            }
            (_, value) => {
                values.insert(entity.to_string(), value);
            }
        }
    }

    fn remove_component(&mut self, component: &str, entity: &str) {
        if let Some(values) = self.components.get_mut(component) {
            values.remove(entity);
        }
    }

    fn get_component_value(&self, component: &str, entity: &str) -> Option<&ComponentValue> {
        self.components.get(component)?.get(entity)
    }
}
