use std::{
    cmp::Ordering,
    collections::{
        BinaryHeap,
        HashMap,
    },
};

pub const DEFAULT_PRIORITY: i64 = 0;

/// Keyed max-priority queue. Equal priorities pop in insertion order.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Slot>,
    items: HashMap<String, (u64, T)>,
    sequence: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct Slot {
    priority: i64,
    sequence: u64,
    id: String,
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            items: HashMap::new(),
            sequence: 0,
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, item: T) -> bool {
        self.add_with_priority(id, item, DEFAULT_PRIORITY)
    }

    /// Returns `false` and leaves the queue untouched when `id` is already pending.
    pub fn add_with_priority(&mut self, id: impl Into<String>, item: T, priority: i64) -> bool {
        let id = id.into();
        if self.items.contains_key(&id) {
            return false;
        }
        let sequence = self.sequence;
        self.sequence += 1;
        self.items.insert(id.clone(), (sequence, item));
        self.heap.push(Slot {
            priority,
            sequence,
            id,
        });
        true
    }

    pub fn next(&mut self) -> Option<T> {
        while let Some(slot) = self.heap.pop() {
            // removed ids leave their slot behind; skip it unless the id was re-added
            match self.items.get(&slot.id) {
                Some((sequence, _)) if *sequence == slot.sequence => {
                    return self.items.remove(&slot.id).map(|(_, item)| item);
                }
                _ => continue,
            }
        }
        None
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.items.remove(id).map(|(_, item)| item)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
