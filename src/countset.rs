//! First-fit slot allocator backing each network's address pool.
//!
//! A [`CountSet`] holds the allocated offsets of a pool as a sorted list of
//! unique integers in `[0, size)`. [`CountSet::add`] always hands out the
//! lowest free offset, so recycled slots are reused before the pool grows
//! toward its upper end.

use serde::{Deserialize, Serialize};

/// Returned by [`CountSet::add`] when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("overflow: all {size} slots are allocated")]
pub struct Overflow {
    pub size: u32,
}

/// Sorted set of allocated slot offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSet {
    /// Total number of slots.
    pub size: u32,
    /// Allocated offsets, ascending, no duplicates.
    #[serde(default)]
    pub values: Vec<u32>,
}

impl CountSet {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            values: Vec::new(),
        }
    }

    /// Returns the lowest free offset and the index it belongs at in `values`.
    fn next(&self) -> (u32, usize) {
        let mut candidate = 0u32;
        for (index, &value) in self.values.iter().enumerate() {
            if value != candidate {
                return (candidate, index);
            }
            candidate += 1;
        }
        (candidate, self.values.len())
    }

    /// Allocates the lowest free offset.
    ///
    /// The set is left unchanged when it is full.
    pub fn add(&mut self) -> Result<u32, Overflow> {
        if self.is_full() {
            return Err(Overflow { size: self.size });
        }
        let (offset, index) = self.next();
        self.values.insert(index, offset);
        Ok(offset)
    }

    /// Frees `offset`. Freeing an offset that is not allocated does nothing.
    pub fn remove(&mut self, offset: u32) {
        if let Ok(index) = self.values.binary_search(&offset) {
            self.values.remove(index);
        }
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.values.binary_search(&offset).is_ok()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.size as usize
    }
}
