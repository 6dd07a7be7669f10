use log::debug;

use crate::lang::descriptor::TypeDescriptor;
use crate::lang::value::{HeapRef, Value};
use crate::runtime::call_stack::CallStack;
use crate::runtime::error::VmError;

/// Oldest generation; survivors here stay here.
pub const MAX_GENERATION: u8 = 2;

const OBJECT_HEADER: usize = std::mem::size_of::<HeapObject>();

// =============================================================================
// HEAP OBJECT
// =============================================================================

/// A collected object: an array (`type_tag` starts with `[`) or a record
/// (`type_tag` is the class name).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    pub type_tag: String,
    pub element_type: Option<TypeDescriptor>,
    pub fields: Vec<Value>,
    pub marked: bool,
    pub generation: u8,
    footprint: usize,
}

impl HeapObject {
    fn new(
        type_tag: String,
        element_type: Option<TypeDescriptor>,
        fields: Vec<Value>,
        footprint: usize,
    ) -> Self {
        HeapObject {
            type_tag,
            element_type,
            fields,
            marked: false,
            generation: 0,
            footprint,
        }
    }

    pub fn is_array(&self) -> bool {
        self.type_tag.starts_with('[')
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }
}

/// header + type tag + one `Value` per field + string payloads
pub fn estimate_footprint(type_tag: &str, fields: &[Value]) -> usize {
    OBJECT_HEADER
        + type_tag.len()
        + fields.len() * std::mem::size_of::<Value>()
        + fields.iter().map(Value::payload_bytes).sum::<usize>()
}

/// Footprint of `len` copies of `element`, computed without building them.
/// `None` if it does not fit in `usize`.
fn array_footprint(type_tag: &str, element: &Value, len: usize) -> Option<usize> {
    std::mem::size_of::<Value>()
        .checked_add(element.payload_bytes())?
        .checked_mul(len)?
        .checked_add(OBJECT_HEADER + type_tag.len())
}

/// Slot index as a handle id; `None` once the id space is used up.
fn slot_id(slot: usize) -> Option<u32> {
    u32::try_from(slot).ok()
}

/// Outcome of one collection, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub freed: usize,
    pub promoted: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

// =============================================================================
// HEAP
// =============================================================================

/// Arena of `Option` slots addressed by `HeapRef`, with a free list.
///
/// Slot 0 is permanently empty so `HeapRef::NULL` never resolves. Objects
/// never move; a handle stays valid for as long as its object survives.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    live: usize,
    used_bytes: usize,
    max_bytes: usize,
    gc_enabled: bool,
    collections: usize,
}

impl Heap {
    pub fn new(max_bytes: usize, gc_enabled: bool) -> Self {
        Heap {
            slots: vec![None],
            free: Vec::new(),
            live: 0,
            used_bytes: 0,
            max_bytes,
            gc_enabled,
            collections: 0,
        }
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn is_live(&self, r: HeapRef) -> bool {
        self.get(r).is_ok()
    }

    pub fn generation_of(&self, r: HeapRef) -> Option<u8> {
        self.get(r).ok().map(|obj| obj.generation)
    }

    // Allocation

    /// Allocate an object, collecting first if the footprint limit would be
    /// exceeded: generation 0, then everything.
    pub fn allocate(
        &mut self,
        type_tag: &str,
        fields: Vec<Value>,
        roots: &CallStack,
    ) -> Result<HeapRef, VmError> {
        let requested = estimate_footprint(type_tag, &fields);
        self.make_room(requested, roots)?;

        let element_type = if type_tag.starts_with('[') {
            TypeDescriptor::parse(type_tag)
                .ok()
                .and_then(|d| d.element().cloned())
        } else {
            None
        };
        self.insert(HeapObject::new(type_tag.to_string(), element_type, fields, requested))
    }

    /// Allocate an array of `len` default-initialised elements. The limit is
    /// checked before any element exists.
    pub fn allocate_array(
        &mut self,
        element: &TypeDescriptor,
        len: usize,
        roots: &CallStack,
    ) -> Result<HeapRef, VmError> {
        let default = element
            .default_value()
            .ok_or_else(|| VmError::MalformedDescriptor {
                descriptor: format!("[{}", element),
            })?;
        let tag = format!("[{}", element);
        let requested =
            array_footprint(&tag, &default, len).ok_or_else(|| self.exhausted(usize::MAX))?;
        self.make_room(requested, roots)?;

        let fields = vec![default; len];
        self.insert(HeapObject::new(tag, Some(element.clone()), fields, requested))
    }

    fn make_room(&mut self, requested: usize, roots: &CallStack) -> Result<(), VmError> {
        if self.would_exceed(requested) && self.gc_enabled {
            self.collect(0, roots);
            if self.would_exceed(requested) {
                self.collect_full(roots);
            }
        }
        if self.would_exceed(requested) {
            return Err(self.exhausted(requested));
        }
        Ok(())
    }

    fn insert(&mut self, object: HeapObject) -> Result<HeapRef, VmError> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = slot_id(self.slots.len()).ok_or_else(|| self.exhausted(object.footprint))?;
                self.slots.push(None);
                id
            }
        };

        self.used_bytes += object.footprint;
        self.live += 1;
        self.slots[id as usize] = Some(object);
        Ok(HeapRef(id))
    }

    fn exhausted(&self, requested: usize) -> VmError {
        VmError::HeapExhausted {
            requested,
            used: self.used_bytes,
            limit: self.max_bytes,
        }
    }

    fn would_exceed(&self, requested: usize) -> bool {
        self.used_bytes.saturating_add(requested) > self.max_bytes
    }

    // Access

    pub fn get(&self, r: HeapRef) -> Result<&HeapObject, VmError> {
        self.slots
            .get(r.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(VmError::InvalidHeapRef(r.0))
    }

    pub fn get_mut(&mut self, r: HeapRef) -> Result<&mut HeapObject, VmError> {
        self.slots
            .get_mut(r.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(VmError::InvalidHeapRef(r.0))
    }

    fn array(&self, r: HeapRef) -> Result<&HeapObject, VmError> {
        let obj = self.get(r)?;
        if !obj.is_array() {
            return Err(VmError::NotAnArray(obj.type_tag.clone()));
        }
        Ok(obj)
    }

    pub fn array_len(&self, r: HeapRef) -> Result<usize, VmError> {
        Ok(self.array(r)?.fields.len())
    }

    pub fn load_element(&self, r: HeapRef, index: &Value) -> Result<Value, VmError> {
        let obj = self.array(r)?;
        let slot = element_slot(index, obj.fields.len())?;
        Ok(obj.fields[slot].clone())
    }

    pub fn store_element(&mut self, r: HeapRef, index: &Value, value: Value) -> Result<(), VmError> {
        let obj = self.array(r)?;
        let slot = element_slot(index, obj.fields.len())?;
        if let Some(element) = &obj.element_type {
            if !element.matches(&value) {
                return Err(VmError::type_mismatch(
                    "STELEM",
                    format!("cannot store {} into {}", value.type_name(), obj.type_tag),
                ));
            }
        }

        let delta = value.payload_bytes() as isize - obj.fields[slot].payload_bytes() as isize;
        let obj = self.get_mut(r)?;
        obj.fields[slot] = value;
        obj.footprint = obj.footprint.saturating_add_signed(delta);
        self.used_bytes = self.used_bytes.saturating_add_signed(delta);
        Ok(())
    }

    // Collection

    /// Collect generation `generation`: unmarked objects of that generation
    /// are freed, marked ones promoted. Other generations are left alone.
    pub fn collect(&mut self, generation: u8, roots: &CallStack) -> CollectStats {
        self.mark(roots);
        let stats = self.sweep(Some(generation));
        debug!(
            "gc: generation {} freed {} promoted {} ({} -> {} bytes)",
            generation, stats.freed, stats.promoted, stats.bytes_before, stats.bytes_after
        );
        stats
    }

    /// Mark once and sweep every generation.
    pub fn collect_full(&mut self, roots: &CallStack) -> CollectStats {
        self.mark(roots);
        let stats = self.sweep(None);
        debug!(
            "gc: full freed {} promoted {} ({} -> {} bytes)",
            stats.freed, stats.promoted, stats.bytes_before, stats.bytes_after
        );
        stats
    }

    fn mark(&mut self, roots: &CallStack) {
        for obj in self.slots.iter_mut().flatten() {
            obj.marked = false;
        }

        let mut worklist: Vec<HeapRef> = roots.roots().filter_map(Value::as_heap_ref).collect();

        while let Some(r) = worklist.pop() {
            let Some(Some(obj)) = self.slots.get_mut(r.0 as usize) else {
                continue;
            };
            if obj.marked {
                continue;
            }
            obj.marked = true;
            worklist.extend(obj.fields.iter().filter_map(Value::as_heap_ref));
        }
    }

    fn sweep(&mut self, target: Option<u8>) -> CollectStats {
        let mut stats = CollectStats {
            bytes_before: self.used_bytes,
            ..CollectStats::default()
        };

        for (id, slot) in self.slots.iter_mut().enumerate() {
            let Some(obj) = slot.as_mut() else {
                continue;
            };
            if target.is_some_and(|g| g != obj.generation) {
                obj.marked = false;
                continue;
            }

            if obj.marked {
                obj.marked = false;
                if obj.generation < MAX_GENERATION {
                    obj.generation += 1;
                    stats.promoted += 1;
                }
            } else {
                self.used_bytes -= obj.footprint;
                self.live -= 1;
                self.free.push(id as u32);
                *slot = None;
                stats.freed += 1;
            }
        }

        self.collections += 1;
        stats.bytes_after = self.used_bytes;
        stats
    }
}

fn element_slot(index: &Value, len: usize) -> Result<usize, VmError> {
    let n = index.as_i128().ok_or_else(|| {
        VmError::type_mismatch(
            "array index",
            format!("expected an integer, got {}", index.type_name()),
        )
    })?;
    if n < 0 || n >= len as i128 {
        return Err(VmError::IndexOutOfBounds {
            index: index.to_string(),
            len,
        });
    }
    Ok(n as usize)
}
