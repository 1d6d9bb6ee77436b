//! Open-addressed hash table keyed by values
//!
//! Linear probing with tombstones: an empty slot has a `nil` key and `nil`
//! value; a tombstone has a `nil` key and a `true` value, so probe chains
//! survive deletion. Capacity doubles from 8 at a 0.75 load factor, with
//! tombstones counted against the load.
//!
//! Key hashing needs the heap (interned strings carry their hash in the
//! object), so the mutating operations take a `&Heap` alongside.

use crate::heap::Heap;
use crate::object::ObjHandle;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) key: Value,
    pub(crate) value: Value,
}

const EMPTY: Entry = Entry {
    key: Value::Nil,
    value: Value::Nil,
};

const TOMBSTONE: Entry = Entry {
    key: Value::Nil,
    value: Value::Bool(true),
};

/// Hash table from values to values
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots (zero until the first insertion)
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Look up `key`
    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(heap, key)];
        if entry.key == Value::Nil {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or update `key`. Returns true when the key was not present.
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            self.grow(heap);
        }

        let slot = self.find_slot(heap, key);
        let entry = &mut self.entries[slot];
        let is_new = entry.key == Value::Nil;
        // Reusing a tombstone does not change the load count.
        if is_new && entry.value == Value::Nil {
            self.count += 1;
        }
        *entry = Entry { key, value };
        is_new
    }

    /// Remove `key`, leaving a tombstone. Returns true when it was present.
    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(heap, key);
        if self.entries[slot].key == Value::Nil {
            return false;
        }
        self.entries[slot] = TOMBSTONE;
        true
    }

    /// Find an interned string by contents, before any object exists for it.
    /// Compares by (length, hash, bytes).
    pub fn find_string(&self, heap: &Heap, text: &str, hash: u32) -> Option<ObjHandle> {
        if self.count == 0 {
            return None;
        }

        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.key == Value::Nil {
                // A truly empty slot ends the probe chain; a tombstone does not.
                if entry.value == Value::Nil {
                    return None;
                }
            } else if let Value::Obj(handle) = entry.key {
                let string = heap.string(handle);
                if string.len() == text.len() && string.hash == hash && string.as_str() == text {
                    return Some(handle);
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Iterate live entries
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.key != Value::Nil)
            .map(|entry| (entry.key, entry.value))
    }

    /// Key stored at slot `index` (`nil` for empty slots and tombstones)
    pub(crate) fn key_at(&self, index: usize) -> Value {
        self.entries[index].key
    }

    /// Tombstone the slot at `index` directly; used by the GC's weak-clear
    /// pass, which already knows where the entry lives.
    pub(crate) fn tombstone_at(&mut self, index: usize) {
        self.entries[index] = TOMBSTONE;
    }

    /// Probe for `key`: returns the slot holding it, or the slot where it
    /// would be inserted (preferring the first tombstone on the chain).
    fn find_slot(&self, heap: &Heap, key: Value) -> usize {
        let capacity = self.capacity();
        let mut index = heap.hash_value(key) as usize % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &self.entries[index];
            if entry.key == Value::Nil {
                if entry.value == Value::Nil {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) % capacity;
        }
    }

    /// Double the capacity and re-insert live entries, dropping tombstones
    fn grow(&mut self, heap: &Heap) {
        let capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };

        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if entry.key == Value::Nil {
                continue;
            }
            let slot = self.find_slot(heap, entry.key);
            self.entries[slot] = entry;
            self.count += 1;
        }
    }
}
