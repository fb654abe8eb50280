//! Hash map id -> Entry, plus an insertion-ordered doubly linked list used
//! for the batched, refcount-propagating cursor scan that every long-lived
//! operation (Tick, Flush, Snapshot, ColdFlush, metadata scan) relies on
//! (§4.2, §4.3).

use std::{
    collections::HashMap,
    sync::Arc,
};

use crate::{
    collaborators::Series,
    entry::Entry,
    types::SeriesId,
};

type Link<S> = std::sync::Arc<parking_lot::Mutex<ListNode<S>>>;

struct ListNode<S: Series> {
    entry: Arc<Entry<S>>,
    next: Option<Link<S>>,
    prev: Option<std::sync::Weak<parking_lot::Mutex<ListNode<S>>>>,
}

/// Map + insertion-ordered list. Every mutation takes the caller's shard
/// write lock (this type has no locking of its own); it's meant to live
/// behind `common::sync::Writer<ShardMap<S>>`.
pub struct ShardMap<S: Series> {
    map: HashMap<SeriesId, Link<S>>,
    head: Option<Link<S>>,
    tail: Option<Link<S>>,
    len: usize,
}

impl<S: Series> Default for ShardMap<S> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<S: Series> ShardMap<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: &[u8]) -> Option<Arc<Entry<S>>> {
        self.map.get(id).map(|link| link.lock().entry.clone())
    }

    /// Insert `entry` into both the map and the tail of the list. Caller
    /// must have already verified `entry.id` is absent (`SetUnsafe`, §4.2:
    /// no copy, no finalize -- the id bytes are shared with the entry, not
    /// duplicated).
    pub fn insert(&mut self, entry: Arc<Entry<S>>) {
        let node = Arc::new(parking_lot::Mutex::new(ListNode {
            entry: entry.clone(),
            next: None,
            prev: self.tail.as_ref().map(Arc::downgrade),
        }));
        if let Some(tail) = &self.tail {
            tail.lock().next = Some(node.clone());
        } else {
            self.head = Some(node.clone());
        }
        self.tail = Some(node.clone());
        self.map.insert(entry.id.clone(), node);
        self.len += 1;
    }

    pub fn delete(&mut self, id: &[u8]) -> Option<Arc<Entry<S>>> {
        let node = self.map.remove(id)?;
        let guard = node.lock();
        let prev = guard.prev.as_ref().and_then(|w| w.upgrade());
        let next = guard.next.clone();
        drop(guard);
        match (&prev, &next) {
            (Some(p), Some(n)) => {
                p.lock().next = Some(n.clone());
                n.lock().prev = Some(Arc::downgrade(p));
            },
            (Some(p), None) => {
                p.lock().next = None;
                self.tail = Some(p.clone());
            },
            (None, Some(n)) => {
                n.lock().prev = None;
                self.head = Some(n.clone());
            },
            (None, None) => {
                self.head = None;
                self.tail = None;
            },
        }
        self.len -= 1;
        Some(node.lock().entry.clone())
    }

    fn front(&self) -> Option<Link<S>> {
        self.head.clone()
    }
}

/// A cursor surviving across shard-lock acquisitions, per §4.3. Holds a ref
/// on the node it currently points at so it isn't invalidated by concurrent
/// inserts/deletes while the scan's per-batch callback runs unlocked.
pub struct Cursor<S: Series> {
    current: Option<Link<S>>,
    /// Ref held on `current.entry` across the gap between batches (step 1
    /// drops it on the *next* acquire).
    held_ref: Option<Arc<Entry<S>>>,
    done: bool,
}

impl<S: Series> Cursor<S> {
    pub fn new() -> Self {
        Self {
            current: None,
            held_ref: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Compute the batch size per §4.3: `max(min_batch, ceil(0.01 * n))`.
    pub fn batch_size(n: usize, min_batch: usize) -> usize {
        let scaled = (n + 99) / 100;
        scaled.max(min_batch)
    }

    /// Take the next batch of up to `batch_size` entries under the shard
    /// read lock. Returns the entries (each with an acquired ref, which the
    /// caller must release after the callback runs) and whether the list
    /// was exhausted.
    pub fn next_batch(&mut self, map: &ShardMap<S>, batch_size: usize) -> Vec<Arc<Entry<S>>> {
        // Step 1: drop the ref held across the previous gap.
        if let Some(prev) = self.held_ref.take() {
            prev.release_ref();
        }
        let start = if self.current.is_some() {
            self.current.clone()
        } else if !self.done {
            map.front()
        } else {
            None
        };
        let mut batch = Vec::with_capacity(batch_size);
        let mut node = start;
        let mut last_entry_node: Option<Link<S>> = None;
        while batch.len() < batch_size {
            let Some(n) = node.clone() else { break };
            let (entry, next) = {
                let guard = n.lock();
                (guard.entry.clone(), guard.next.clone())
            };
            entry.acquire_ref();
            batch.push(entry);
            last_entry_node = Some(n);
            node = next;
        }
        // Step 3: take an extra ref on the element after the batch so the
        // list position survives concurrent mutations until the next call.
        match node {
            Some(next_node) => {
                let next_entry = next_node.lock().entry.clone();
                next_entry.acquire_ref();
                self.held_ref = Some(next_entry);
                self.current = Some(next_node);
            },
            None => {
                self.current = None;
                self.held_ref = None;
                self.done = true;
            },
        }
        let _ = last_entry_node;
        batch
    }

    /// Step 5: the callback signaled "stop" -- drop the held cursor ref.
    pub fn stop(&mut self) {
        if let Some(prev) = self.held_ref.take() {
            prev.release_ref();
        }
        self.current = None;
        self.done = true;
    }
}

impl<S: Series> Default for Cursor<S> {
    fn default() -> Self {
        Self::new()
    }
}
