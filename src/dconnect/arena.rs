//! Generation-checked slab behind wire instance handles.
//!
//! A handle packs `(slot, generation)` into a u64:
//! ```text
//! bit 63..33  generation (31 bits)
//! bit 32..1   slot + 1
//! bit 0       always clear on the wire as a handle; set marks a remote ref
//! ```
//! Slot 0 never encodes to 0, so the all-zero value is the null handle.
//! Removing an entry bumps its slot's generation, so a stale or forged
//! handle never resolves to whatever reuses the slot.

use std::fmt;

use crate::types::{Error, Result};

const GENERATION_MASK: u32 = 0x7FFF_FFFF;

/// Opaque, generation-checked reference to an exported instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    pub const NULL: InstanceHandle = InstanceHandle(0);

    /// Low bit used by the nested-object encoding: set means "wrap as a stub".
    pub const REMOTE_BIT: u64 = 1;

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    fn pack(slot: u32, generation: u32) -> Self {
        let index = u64::from(slot) + 1;
        Self((u64::from(generation & GENERATION_MASK) << 33) | (index << 1))
    }

    fn unpack(self) -> Option<(usize, u32)> {
        if self.0 & Self::REMOTE_BIT != 0 {
            return None;
        }
        let index = (self.0 >> 1) & 0xFFFF_FFFF;
        if index == 0 {
            return None;
        }
        Some(((index - 1) as usize, (self.0 >> 33) as u32))
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceHandle({:#x})", self.0)
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert the value built from its own handle.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(InstanceHandle) -> T) -> Result<InstanceHandle> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|s| *s < u32::MAX)
                    .ok_or_else(|| Error::out_of_resources("instance arena is full"))?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                slot
            }
        };
        let entry = &mut self.slots[slot as usize];
        let handle = InstanceHandle::pack(slot, entry.generation);
        entry.value = Some(make(handle));
        self.len += 1;
        Ok(handle)
    }

    pub(crate) fn get(&self, handle: InstanceHandle) -> Option<&T> {
        let (slot, generation) = handle.unpack()?;
        let entry = self.slots.get(slot)?;
        if entry.generation != generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub(crate) fn remove(&mut self, handle: InstanceHandle) -> Option<T> {
        let (slot, generation) = handle.unpack()?;
        let entry = self.slots.get_mut(slot)?;
        if entry.generation != generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(slot as u32);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry
                .value
                .as_ref()
                .map(|v| (InstanceHandle::pack(slot as u32, entry.generation), v))
        })
    }
}
