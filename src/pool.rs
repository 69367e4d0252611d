//! Generation-checked resource pools
//!
//! Every record the engine hands out (devices, open endpoints, URBs) lives in a
//! slot of a [`Pool`]. A [`Key`] names a slot together with the generation it
//! was issued for; freeing a slot bumps its generation, so a stale key is
//! rejected in O(1) instead of aliasing whatever reuses the slot.

use alloc::vec::Vec;
use core::fmt;

use crate::{error::PoolKind, Result, UsbError};

/// Pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCapacity {
    /// At most `n` live records
    Bounded(usize),
    /// Grows on demand
    Unbounded,
}

impl PoolCapacity {
    fn limit(self) -> usize {
        match self {
            PoolCapacity::Bounded(n) => n,
            PoolCapacity::Unbounded => usize::from(u16::MAX),
        }
    }

    fn is_zero(self) -> bool {
        self == PoolCapacity::Bounded(0)
    }
}

/// Slot index plus generation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u16,
    generation: u16,
}

impl Key {
    /// Packed form, generation in the upper half
    pub fn raw(self) -> u32 {
        (u32::from(self.generation) << 16) | u32::from(self.index)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            index: raw as u16,
            generation: (raw >> 16) as u16,
        }
    }

    pub fn index(self) -> u16 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: Option<usize>,
    pub in_use: usize,
    pub high_water: usize,
    pub alloc_failures: usize,
}

struct Slot<T> {
    generation: u16,
    item: Option<T>,
}

/// Fixed or growable arena with generation-checked keys
pub struct Pool<T> {
    kind: PoolKind,
    capacity: PoolCapacity,
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    stats: PoolStats,
}

impl<T> Pool<T> {
    /// Create a pool. Bounded pools reserve their slots up front.
    pub fn new(kind: PoolKind, capacity: PoolCapacity) -> Result<Self> {
        if capacity.is_zero() || capacity.limit() > usize::from(u16::MAX) {
            return Err(UsbError::InvalidArgument);
        }

        let reserve = match capacity {
            PoolCapacity::Bounded(n) => n,
            PoolCapacity::Unbounded => 0,
        };

        Ok(Self {
            kind,
            capacity,
            slots: Vec::with_capacity(reserve),
            free: Vec::with_capacity(reserve),
            stats: PoolStats {
                capacity: match capacity {
                    PoolCapacity::Bounded(n) => Some(n),
                    PoolCapacity::Unbounded => None,
                },
                ..PoolStats::default()
            },
        })
    }

    pub fn alloc(&mut self, item: T) -> Result<Key> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity.limit() => {
                self.slots.push(Slot {
                    generation: 1,
                    item: None,
                });
                (self.slots.len() - 1) as u16
            }
            None => {
                self.stats.alloc_failures += 1;
                return Err(UsbError::AllocationFailed(self.kind));
            }
        };

        let slot = &mut self.slots[usize::from(index)];
        slot.item = Some(item);
        self.stats.in_use += 1;
        self.stats.high_water = self.stats.high_water.max(self.stats.in_use);

        Ok(Key {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(usize::from(key.index))
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.item.as_ref())
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(usize::from(key.index))
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.item.as_mut())
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Release a slot and invalidate every key issued for it
    pub fn free(&mut self, key: Key) -> Option<T> {
        let slot = self
            .slots
            .get_mut(usize::from(key.index))
            .filter(|slot| slot.generation == key.generation)?;
        let item = slot.item.take()?;

        // Zero is never issued, so a default-constructed key never matches.
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            generation => generation,
        };
        self.free.push(key.index);
        self.stats.in_use -= 1;

        Some(item)
    }

    pub fn len(&self) -> usize {
        self.stats.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.stats.in_use == 0
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Keys of all live records
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.item.as_ref().map(|_| Key {
                index: index as u16,
                generation: slot.generation,
            })
        })
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish()
    }
}
