//! Open-addressed, linearly-probed hash table keyed by symbol name,
//! hashed with FNV-1a, resizing at a 0.75 load factor (spec §4.3).
//!
//! No file in the retrieved corpus implements this exact structure
//! (most linkers in the pack reach for `std::collections::HashMap`); the
//! shape here follows the spec text directly. FNV-1a's constants are the
//! published algorithm constants.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

enum Slot<V> {
    Empty,
    Occupied(String, V),
    /// Left behind by `remove`; probing must continue past it, but it is
    /// free for a new insertion.
    Tombstone,
}

/// A minimal open-addressing hash table matching spec §4.3's resolver
/// table (not a general-purpose map — the linker only ever looks symbols
/// up by exact name and never removes, but `Tombstone` is kept for
/// structural completeness and to document probe-continuation behavior).
pub struct FnvTable<V> {
    slots: Vec<Slot<V>>,
    len: usize,
}

impl<V> FnvTable<V> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(4).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self { slots, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn load_factor_after_insert(&self) -> f64 {
        (self.len + 1) as f64 / self.slots.len() as f64
    }

    fn probe_index(&self, name: &str) -> usize {
        (fnv1a(name.as_bytes()) as usize) & (self.slots.len() - 1)
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        let mask = self.slots.len() - 1;
        let mut idx = self.probe_index(name);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, v) if k == name => return Some(v),
                _ => idx = (idx + 1) & mask,
            }
        }
        None
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        let mask = self.slots.len() - 1;
        let mut idx = self.probe_index(name);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(k, _) if k == name => {
                    if let Slot::Occupied(_, v) = &mut self.slots[idx] {
                        return Some(v);
                    }
                    unreachable!()
                }
                _ => idx = (idx + 1) & mask,
            }
        }
        None
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert `value` under `name`, returning the previous value if the
    /// key was already present.
    pub fn insert(&mut self, name: String, value: V) -> Option<V> {
        if self.load_factor_after_insert() > 0.75 {
            self.grow();
        }
        self.insert_no_resize(name, value)
    }

    fn insert_no_resize(&mut self, name: String, value: V) -> Option<V> {
        let mask = self.slots.len() - 1;
        let mut idx = self.probe_index(&name);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let target = first_tombstone.unwrap_or(idx);
                    self.slots[target] = Slot::Occupied(name, value);
                    self.len += 1;
                    return None;
                }
                Slot::Occupied(k, _) if *k == name => {
                    let old = std::mem::replace(&mut self.slots[idx], Slot::Occupied(name, value));
                    return match old {
                        Slot::Occupied(_, v) => Some(v),
                        _ => unreachable!(),
                    };
                }
                Slot::Tombstone if first_tombstone.is_none() => {
                    first_tombstone = Some(idx);
                    idx = (idx + 1) & mask;
                }
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let mut old_slots = Vec::with_capacity(new_capacity);
        old_slots.resize_with(new_capacity, || Slot::Empty);
        std::mem::swap(&mut self.slots, &mut old_slots);
        self.len = 0;
        for slot in old_slots {
            if let Slot::Occupied(k, v) = slot {
                self.insert_no_resize(k, v);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((k.as_str(), v)),
            _ => None,
        })
    }
}

impl<V> Default for FnvTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
