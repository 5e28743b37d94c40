//! Bounded LRU store for cache entries.
//!
//! Entries live in a slab of nodes threaded on a doubly-linked recency list
//! (head = most recently touched), so lookup, touch, insert and eviction are
//! all O(1).

use std::collections::HashMap;

use crate::cache::entry::CacheEntry;

struct Node<T> {
    key: String,
    entry: CacheEntry<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU map from cache key to entry with a fixed capacity.
pub struct EvictionStore<T> {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node<T>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    capacity: usize,
}

impl<T> EvictionStore<T> {
    /// Create a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free_list: Vec::new(),
            capacity,
        }
    }

    /// Look up an entry, counting the read and marking it most recent.
    pub fn get(&mut self, key: &str) -> Option<&CacheEntry<T>> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        let node = self.nodes[idx].as_mut()?;
        node.entry.touch();
        Some(&node.entry)
    }

    /// Look up an entry without touching recency or hit count.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<T>> {
        let idx = *self.map.get(key)?;
        self.nodes[idx].as_ref().map(|node| &node.entry)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or replace an entry as most recent.
    ///
    /// Returns the key evicted to make room, if any. Replacing an existing key
    /// never evicts.
    pub fn insert(&mut self, key: String, entry: CacheEntry<T>) -> Option<String> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = &mut self.nodes[idx] {
                node.entry = entry;
            }
            self.move_to_front(idx);
            return None;
        }

        let evicted = if self.map.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        let idx = self.alloc_node();
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            entry,
            prev: None,
            next: self.head,
        });
        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.map.insert(key, idx);

        evicted
    }

    /// Remove a key, returning its entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        self.free_list.push(idx);
        self.nodes[idx].take().map(|node| node.entry)
    }

    /// Keep only the entries for which `keep` returns true. Returns removed keys.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str, &CacheEntry<T>) -> bool,
    {
        let doomed: Vec<String> = self
            .iter()
            .filter(|(key, entry)| !keep(key, entry))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed
    }

    /// Iterate from most to least recently touched.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            store: self,
            cursor: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }
        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = &mut self.nodes[prev_idx] {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next_idx) => {
                if let Some(next_node) = &mut self.nodes[next_idx] {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn evict(&mut self) -> Option<String> {
        let tail_idx = self.tail?;
        self.unlink(tail_idx);
        let node = self.nodes[tail_idx].take()?;
        self.map.remove(&node.key);
        self.free_list.push(tail_idx);
        Some(node.key)
    }

    fn alloc_node(&mut self) -> usize {
        match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        }
    }
}

/// Iterator over `(key, entry)` in recency order.
pub struct Iter<'a, T> {
    store: &'a EvictionStore<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a str, &'a CacheEntry<T>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.store.nodes[idx].as_ref()?;
        self.cursor = node.next;
        Some((node.key.as_str(), &node.entry))
    }
}
