use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// FNV-1a (64-bit) over the UTF-8 bytes of `key`.
///
/// Stable across processes, unlike `std`'s randomly seeded hasher.
pub fn stable_hash(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

/// Concurrent map that remembers registration order.
///
/// Re-registering an id replaces its value but keeps its original position.
pub(crate) struct OrderedRegistry<T> {
    entries: DashMap<String, (u64, T)>,
    next_seq: AtomicU64,
}

impl<T: Clone> OrderedRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn insert(&self, id: &str, value: T) {
        match self.entries.get_mut(id) {
            Some(mut entry) => entry.1 = value,
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .entry(id.to_string())
                    .and_modify(|entry| entry.1 = value.clone())
                    .or_insert((seq, value));
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<T> {
        self.entries.get(id).map(|entry| entry.1.clone())
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|(_, (_, value))| value)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in registration order.
    pub(crate) fn ordered(&self) -> Vec<(String, T)> {
        let mut entries: Vec<(u64, String, T)> = self
            .entries
            .iter()
            .map(|e| (e.value().0, e.key().clone(), e.value().1.clone()))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries.into_iter().map(|(_, id, value)| (id, value)).collect()
    }

    /// Id of the earliest registered entry still present.
    pub(crate) fn first_id(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|e| e.value().0)
            .map(|e| e.key().clone())
    }

    /// Id at `stable_hash(key) % len` in registration order.
    pub(crate) fn id_by_hash(&self, key: &str) -> Option<String> {
        let ids = self.ordered();
        if ids.is_empty() {
            return None;
        }
        let index = (stable_hash(key) % ids.len() as u64) as usize;
        ids.into_iter().nth(index).map(|(id, _)| id)
    }

    /// Id at `counter % len` in registration order.
    pub(crate) fn id_by_index(&self, counter: usize) -> Option<String> {
        let ids = self.ordered();
        if ids.is_empty() {
            return None;
        }
        let index = counter % ids.len();
        ids.into_iter().nth(index).map(|(id, _)| id)
    }
}
