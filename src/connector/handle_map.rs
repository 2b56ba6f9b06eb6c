//! Translates opaque 64-bit `fh` values on the wire to in-process objects.
//!
//! The source this crate's node-tree layer is modeled on embeds a nonce in the
//! unused bits of an aligned pointer. We use the documented alternative
//! instead: a slab of slots, each carrying a generation counter that is bumped
//! every time the slot is reused. The wire contract is the same either way —
//! a handle uniquely identifies an object for its lifetime, and using a stale
//! or double-freed handle is detectable.

use std::sync::Mutex;

use crate::ll::FileHandle;

const GENERATION_BITS: u32 = 16;
const INDEX_MASK: u64 = (1 << (64 - GENERATION_BITS)) - 1;

struct Slot<T> {
    value: Option<T>,
    generation: u16,
}

/// Maps opaque [`FileHandle`] values to in-process objects of type `T`.
///
/// Guarded by a single mutex; holders are expected to be short-lived.
pub struct HandleMap<T> {
    slots: Mutex<Vec<Slot<T>>>,
    free: Mutex<Vec<usize>>,
}

impl<T> std::fmt::Debug for HandleMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.slots.lock().unwrap().len();
        f.debug_struct("HandleMap").field("slots", &len).finish()
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }
}

fn encode(index: usize, generation: u16) -> FileHandle {
    FileHandle((index as u64 & INDEX_MASK) | ((generation as u64) << (64 - GENERATION_BITS)))
}

fn decode(handle: FileHandle) -> (usize, u16) {
    let v = handle.0;
    let index = (v & INDEX_MASK) as usize;
    let generation = (v >> (64 - GENERATION_BITS)) as u16;
    (index, generation)
}

impl<T> HandleMap<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value`, returning the handle that identifies it until
    /// [`forget`](Self::forget) is called.
    pub fn register(&self, value: T) -> FileHandle {
        let mut free = self.free.lock().unwrap();
        let mut slots = self.slots.lock().unwrap();
        if let Some(index) = free.pop() {
            let slot = &mut slots[index];
            slot.value = Some(value);
            return encode(index, slot.generation);
        }
        let index = slots.len();
        slots.push(Slot {
            value: Some(value),
            generation: 0,
        });
        encode(index, 0)
    }

    /// Invokes `f` with a reference to the object `handle` refers to.
    ///
    /// Returns `None` (without calling `f`) if the handle is stale: its
    /// generation doesn't match the slot's current occupant, or the index is
    /// out of range.
    pub fn with<R>(&self, handle: FileHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let (index, generation) = decode(handle);
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref().map(f)
    }

    /// Removes the mapping for `handle`, returning the object it referred to.
    ///
    /// # Panics
    /// Panics if `handle` does not currently resolve to a live object —
    /// a double-forget indicates the inode mirror has diverged from the
    /// kernel's view of open files, which is a core-invariant violation.
    pub fn forget(&self, handle: FileHandle) -> T {
        let (index, generation) = decode(handle);
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(index)
            .unwrap_or_else(|| panic!("forget() of unknown handle {handle:?}"));
        assert_eq!(
            slot.generation, generation,
            "forget() of stale or already-forgotten handle {handle:?}"
        );
        let value = slot
            .value
            .take()
            .unwrap_or_else(|| panic!("forget() of already-forgotten handle {handle:?}"));
        slot.generation = slot.generation.wrapping_add(1);
        drop(slots);
        self.free.lock().unwrap().push(index);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_with_roundtrips() {
        let map = HandleMap::new();
        let h = map.register(42u32);
        assert_eq!(map.with(h, |v| *v), Some(42));
    }

    #[test]
    fn forget_then_with_returns_none() {
        let map = HandleMap::new();
        let h = map.register(42u32);
        map.forget(h);
        assert_eq!(map.with(h, |v| *v), None);
    }

    #[test]
    #[should_panic(expected = "already-forgotten")]
    fn double_forget_panics() {
        let map = HandleMap::new();
        let h = map.register(1u32);
        map.forget(h);
        map.forget(h);
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let map = HandleMap::new();
        let h1 = map.register(1u32);
        map.forget(h1);
        let h2 = map.register(2u32);
        assert_ne!(h1, h2);
        assert_eq!(map.with(h1, |v| *v), None);
        assert_eq!(map.with(h2, |v| *v), Some(2));
    }
}
