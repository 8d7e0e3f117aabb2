//! Arena-backed LRU list.
//!
//! Nodes live in a `Vec` and link to each other by index, so promotion and
//! eviction never allocate. Freed slots are reused by later inserts.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    entry: Option<(K, V)>,
    prev: usize,
    next: usize,
}

/// A map ordered from most to least recently used.
pub struct LruList<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: usize,
    tail: usize,
}

impl<K: Hash + Eq + Clone, V> LruList<K, V> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the list holds no entry.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Looks up a value without changing its position.
    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.nodes[idx].entry.as_ref().map(|(_, v)| v)
    }

    /// Mutable lookup without changing the position.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.nodes[idx].entry.as_mut().map(|(_, v)| v)
    }

    /// Moves an entry to the front. Returns false if it is absent.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.unlink(idx);
                self.push_front(idx);
                true
            }
            None => false,
        }
    }

    /// Inserts at the front, replacing and returning any previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            self.unlink(idx);
            self.push_front(idx);
            return self.nodes[idx].entry.replace((key, value)).map(|(_, v)| v);
        }

        let node = Node {
            entry: Some((key.clone(), value)),
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        None
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.release(idx).map(|(_, v)| v)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_back(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let (key, value) = self.release(self.tail)?;
        self.index.remove(&key);
        Some((key, value))
    }

    /// Iterates from least to most recently used.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            cursor: self.tail,
            forward: false,
        }
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn release(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        self.free.push(idx);
        self.nodes[idx].entry.take()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head == NIL {
            self.tail = idx;
        } else {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
    }
}

impl<K: Hash + Eq + Clone, V> Default for LruList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over `(key, value)` pairs in LRU order.
pub struct Iter<'a, K, V> {
    list: &'a LruList<K, V>,
    cursor: usize,
    forward: bool,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cursor];
        self.cursor = if self.forward { node.next } else { node.prev };
        node.entry.as_ref().map(|(k, v)| (k, v))
    }
}
