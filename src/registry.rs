//! Named objects.
//!
//! Each heap keeps a bounded table of `name -> Ptr` slots. It lives under the
//! same guard as the heap, so allocating and naming an object is one step to
//! any other thread. Names are what another process should use to find an
//! object after attaching.

use std::collections::HashMap;

use log::trace;

use crate::error::{HeapError, Result};
use crate::heap::{Heap, Ptr};
use crate::layout::NAME_MAX;
use crate::store::BackingStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapSlot {
    name: String,
    ptr: Ptr,
}

impl MapSlot {
    pub fn new(name: &str, ptr: Ptr) -> Self {
        MapSlot {
            name: name.to_owned(),
            ptr,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ptr(&self) -> Ptr {
        self.ptr
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HeapError::Unsupported("object names can't be empty"));
    }
    if name.len() > NAME_MAX {
        return Err(HeapError::Unsupported("object name too long"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Option<MapSlot>>,
    /// Emptied slots, reused before the table grows.
    free_slots: Vec<usize>,
    index: HashMap<String, usize>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Registry {
            capacity,
            ..Default::default()
        }
    }

    /// Rebuild a registry from its slots. `None` if a name appears twice.
    pub fn from_slots(capacity: usize, slots: Vec<Option<MapSlot>>) -> Option<Self> {
        let mut index = HashMap::with_capacity(slots.len());
        let mut free_slots = Vec::new();
        for (i, slot) in slots.iter().enumerate().rev() {
            match slot {
                Some(slot) => {
                    if index.insert(slot.name.clone(), i).is_some() {
                        return None;
                    }
                }
                None => free_slots.push(i),
            }
        }
        Some(Registry {
            slots,
            free_slots,
            index,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slots(&self) -> &[Option<MapSlot>] {
        &self.slots
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn has_room(&self) -> bool {
        !self.free_slots.is_empty() || self.slots.len() < self.capacity
    }

    /// Claim an empty slot, preferring one emptied by `unregister`.
    pub fn get_free_mapslot(&mut self) -> Result<usize> {
        if let Some(slot) = self.free_slots.pop() {
            return Ok(slot);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(None);
            return Ok(self.slots.len() - 1);
        }
        Err(HeapError::RegistryFull(self.capacity))
    }

    pub fn register(&mut self, name: &str, ptr: Ptr) -> Result<()> {
        check_name(name)?;
        if self.contains(name) {
            return Err(HeapError::NameExists(name.to_owned()));
        }
        let slot = self.get_free_mapslot()?;
        self.slots[slot] = Some(MapSlot::new(name, ptr));
        self.index.insert(name.to_owned(), slot);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Ptr> {
        self.index
            .get(name)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(MapSlot::ptr)
            .ok_or_else(|| HeapError::NotFound(name.to_owned()))
    }

    pub fn unregister(&mut self, name: &str) -> Result<Ptr> {
        let slot = self
            .index
            .remove(name)
            .ok_or_else(|| HeapError::NotFound(name.to_owned()))?;
        let ptr = self.slots[slot]
            .take()
            .map(|slot| slot.ptr)
            .ok_or(HeapError::Corrupt("registry index points at an empty slot"))?;
        self.free_slots.push(slot);
        Ok(ptr)
    }

    /// Registered names, in slot order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.slots.iter().flatten().map(MapSlot::name)
    }
}

impl<S: BackingStore> Heap<S> {
    /// Name a live object of this heap.
    pub fn register(&mut self, name: &str, ptr: Ptr) -> Result<()> {
        self.resolve_object_start(ptr)?;
        self.registry.register(name, ptr)
    }

    pub fn lookup(&self, name: &str) -> Result<Ptr> {
        self.registry.lookup(name)
    }

    /// Forget a name, returning its object. The object itself stays allocated.
    pub fn unregister(&mut self, name: &str) -> Result<Ptr> {
        self.registry.unregister(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.registry.names().map(str::to_owned).collect()
    }

    // Nothing is allocated unless the name can be registered afterwards.
    fn allocate_named_with<F>(&mut self, name: &str, allocate: F) -> Result<Ptr>
    where
        F: FnOnce(&mut Self) -> Result<Ptr>,
    {
        check_name(name)?;
        if self.registry.contains(name) {
            return Err(HeapError::NameExists(name.to_owned()));
        }
        if !self.registry.has_room() {
            return Err(HeapError::RegistryFull(self.registry.capacity()));
        }

        let ptr = allocate(self)?;
        self.registry.register(name, ptr)?;
        trace!("Named {} {:?}", ptr, name);
        Ok(ptr)
    }

    pub fn allocate_named(&mut self, name: &str, size: usize) -> Result<Ptr> {
        self.allocate_named_with(name, |heap| heap.allocate(size))
    }

    pub fn allocate_zeroed_named(&mut self, name: &str, count: usize, size: usize) -> Result<Ptr> {
        self.allocate_named_with(name, |heap| heap.allocate_zeroed(count, size))
    }

    pub fn allocate_aligned_named(
        &mut self,
        name: &str,
        alignment: usize,
        size: usize,
    ) -> Result<Ptr> {
        self.allocate_named_with(name, |heap| heap.allocate_aligned(alignment, size))
    }

    /// Free a named object and drop its name.
    pub fn free_named(&mut self, name: &str) -> Result<()> {
        let ptr = self.registry.lookup(name)?;
        self.free(ptr)?;
        self.registry.unregister(name)?;
        Ok(())
    }
}
