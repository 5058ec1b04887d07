//! Intrusive doubly-linked LRU list over a slab, indexed by key.
//!
//! Every operation is O(1): nodes live in a `Vec` and link to each other by
//! index, freed slots are recycled through a free list, and a `HashMap`
//! maps keys to slots. The head is the most recently used entry.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

struct Node<T> {
    key: String,
    value: Option<T>,
    prev: usize,
    next: usize,
}

pub(crate) struct LruList<T> {
    nodes: Vec<Node<T>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<T> LruList<T> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Insert at the head, returning the value previously stored under `key`.
    pub(crate) fn insert(&mut self, key: String, value: T) -> Option<T> {
        let previous = self.remove(&key);
        let node = Node {
            key: key.clone(),
            value: Some(value),
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.push_front(slot);
        self.index.insert(key, slot);
        previous
    }

    /// Look up `key` and mark it most recently used.
    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        let slot = *self.index.get(key)?;
        self.unlink(slot);
        self.push_front(slot);
        self.nodes[slot].value.as_mut()
    }

    /// Look up `key` without touching recency.
    pub(crate) fn peek(&self, key: &str) -> Option<&T> {
        let slot = *self.index.get(key)?;
        self.nodes[slot].value.as_ref()
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<T> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        self.release(slot)
    }

    /// Remove and return the least recently used entry.
    pub(crate) fn pop_lru(&mut self) -> Option<(String, T)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        let key = std::mem::take(&mut self.nodes[slot].key);
        self.index.remove(&key);
        self.unlink(slot);
        self.release(slot).map(|value| (key, value))
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn release(&mut self, slot: usize) -> Option<T> {
        let node = &mut self.nodes[slot];
        node.key.clear();
        self.free.push(slot);
        node.value.take()
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
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
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}
