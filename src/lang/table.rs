//! Open hashing map keyed by [`Value`].
//!
//! Buckets are singly linked chains; the bucket array always has a power of
//! two length so the index is `hash & (capacity - 1)`. Keys compare with
//! [`values_equal`], so object keys compare by identity and strings (being
//! interned) by content.
//!
//! The map never touches the heap: callers pass the key's hash in, which for
//! objects lives in the object header.

use crate::lang::object::ObjRef;
use crate::lang::value::{Value, values_equal};

const LOAD_FACTOR: f64 = 0.65;

/// Values a table can report to the collector during marking.
pub trait Trace {
    fn trace(&self, out: &mut Vec<Value>);
}

impl Trace for Value {
    fn trace(&self, out: &mut Vec<Value>) {
        out.push(*self);
    }
}

impl Trace for () {
    fn trace(&self, _out: &mut Vec<Value>) {}
}

#[derive(Debug)]
struct Entry<V> {
    hash: u32,
    key: Value,
    value: V,
    next: Option<Box<Entry<V>>>,
}

#[derive(Debug)]
pub struct Table<V> {
    buckets: Vec<Option<Box<Entry<V>>>>,
    count: usize,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 { 8 } else { capacity * 2 }
}

impl<V> Table<V> {
    pub fn new() -> Self {
        Table {
            buckets: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn find(&self, key: Value, hash: u32) -> Option<&Entry<V>> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut current = self.buckets[self.bucket_index(hash)].as_deref();
        while let Some(entry) = current {
            if values_equal(entry.key, key) {
                return Some(entry);
            }
            current = entry.next.as_deref();
        }
        None
    }

    fn find_mut(&mut self, key: Value, hash: u32) -> Option<&mut Entry<V>> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = self.bucket_index(hash);
        let mut current = self.buckets[index].as_deref_mut();
        while let Some(entry) = current {
            if values_equal(entry.key, key) {
                return Some(entry);
            }
            current = entry.next.as_deref_mut();
        }
        None
    }

    pub fn contains(&self, key: Value, hash: u32) -> bool {
        self.find(key, hash).is_some()
    }

    /// Inserts or overwrites. Returns `true` when the key was new.
    pub fn put(&mut self, key: Value, hash: u32, value: V) -> bool {
        if let Some(entry) = self.find_mut(key, hash) {
            entry.value = value;
            return false;
        }
        if (self.count + 1) as f64 > self.buckets.len() as f64 * LOAD_FACTOR {
            self.grow();
        }
        let index = self.bucket_index(hash);
        let next = self.buckets[index].take();
        self.buckets[index] = Some(Box::new(Entry {
            hash,
            key,
            value,
            next,
        }));
        self.count += 1;
        true
    }

    fn grow(&mut self) {
        let capacity = grow_capacity(self.buckets.len());
        let old = std::mem::replace(&mut self.buckets, (0..capacity).map(|_| None).collect());
        for mut head in old {
            while let Some(mut entry) = head {
                head = entry.next.take();
                let index = self.bucket_index(entry.hash);
                entry.next = self.buckets[index].take();
                self.buckets[index] = Some(entry);
            }
        }
    }

    /// Unlinks the entry for `key`. Returns `true` if one was removed.
    pub fn remove(&mut self, key: Value, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.bucket_index(hash);
        let mut link = &mut self.buckets[index];
        loop {
            let found = match link {
                None => return false,
                Some(entry) => values_equal(entry.key, key),
            };
            if found {
                if let Some(mut entry) = link.take() {
                    *link = entry.next.take();
                }
                self.count -= 1;
                return true;
            }
            match link {
                Some(entry) => link = &mut entry.next,
                None => return false,
            }
        }
    }

    /// Walks the bucket for `hash` and returns the first key accepted by
    /// `matches`, without needing a constructed key.
    pub fn find_key(&self, hash: u32, mut matches: impl FnMut(Value) -> bool) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut current = self.buckets[self.bucket_index(hash)].as_deref();
        while let Some(entry) = current {
            if entry.hash == hash && matches(entry.key) {
                return Some(entry.key);
            }
            current = entry.next.as_deref();
        }
        None
    }

    /// Drops every entry whose key is an object that `is_marked` rejects.
    /// Non-object keys are always kept.
    pub fn sweep_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let mut link = bucket;
            loop {
                let dead = match link {
                    None => break,
                    Some(entry) => entry.key.as_obj().is_some_and(|r| !is_marked(r)),
                };
                if dead {
                    if let Some(mut entry) = link.take() {
                        *link = entry.next.take();
                    }
                    removed += 1;
                    continue;
                }
                match link {
                    Some(entry) => link = &mut entry.next,
                    None => break,
                }
            }
        }
        self.count -= removed;
        removed
    }

    /// Entries in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, &V)> + '_ {
        self.buckets.iter().flat_map(|bucket| {
            let mut current = bucket.as_deref();
            std::iter::from_fn(move || {
                let entry = current?;
                current = entry.next.as_deref();
                Some((entry.key, &entry.value))
            })
        })
    }
}

impl<V: Copy> Table<V> {
    pub fn get(&self, key: Value, hash: u32) -> Option<V> {
        self.find(key, hash).map(|entry| entry.value)
    }
}

impl<V: Trace> Table<V> {
    /// Reports every key and value to the collector.
    pub fn trace(&self, out: &mut Vec<Value>) {
        for (key, value) in self.iter() {
            out.push(key);
            value.trace(out);
        }
    }
}
