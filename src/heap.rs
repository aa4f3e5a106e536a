// File: src/heap.rs
//
// Mark-sweep heap for Ape runtime objects.
// Objects live in a slot arena addressed by ObjectRef indices; the collector
// is stop-the-world and non-moving. Swept slots are recycled through bounded
// per-type pools, with oversized payloads bypassing the pools.

use crate::bytecode::CompilationResult;
use crate::errors::Traceback;
use crate::value::{value_hash, values_equal, ObjectRef, Value};
use crate::vm::Vm;
use ahash::AHashMap;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

/// A sweep runs once this many allocations have happened since the last one.
pub const GC_SWEEP_INTERVAL: usize = 128;

/// Maximum number of recycled slots kept per object type.
const POOL_MAX_SIZE: usize = 2048;

const ARRAY_POOL_MAX_LEN: usize = 1024;
const MAP_POOL_MAX_LEN: usize = 1024;
const STRING_POOL_MAX_CAPACITY: usize = 4096;

pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Value>;
pub type ExternalCopyFn = Rc<dyn Fn(&dyn Any) -> Option<Box<dyn Any>>>;
pub type ExternalDestroyFn = Rc<dyn Fn(&mut dyn Any)>;

pub struct StrData {
    pub value: String,
    /// Lazily computed byte hash; 0 means "not yet computed", and a raw
    /// hash of 0 is stored as 1 to preserve the sentinel.
    pub hash: Cell<u64>,
}

/// Value-keyed map with custom hash/eq over values. Iteration order is
/// insertion order.
#[derive(Default)]
pub struct MapData {
    entries: Vec<(Value, Value)>,
    index: AHashMap<u64, Vec<u32>>,
}

impl MapData {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn entry_at(&self, ix: usize) -> Option<(Value, Value)> {
        self.entries.get(ix).copied()
    }
}

pub struct FunctionData {
    pub name: String,
    pub comp_result: Rc<CompilationResult>,
    pub num_locals: usize,
    pub num_args: usize,
    pub free_vals: Vec<Value>,
}

pub struct NativeData {
    pub name: String,
    pub func: NativeFn,
}

/// Opaque host payload with its capability pair: the copy callback is only
/// consulted on deep copy, the destroy callback only on sweep.
pub struct ExternalData {
    pub data: Box<dyn Any>,
    pub copy_fn: Option<ExternalCopyFn>,
    pub destroy_fn: Option<ExternalDestroyFn>,
}

pub struct ErrorData {
    pub message: String,
    pub traceback: Option<Traceback>,
}

pub enum ObjectPayload {
    Freed,
    Str(StrData),
    Array(Vec<Value>),
    Map(MapData),
    Function(FunctionData),
    Native(NativeData),
    External(ExternalData),
    Error(ErrorData),
}

impl ObjectPayload {
    fn pool_index(&self) -> Option<usize> {
        match self {
            ObjectPayload::Str(_) => Some(0),
            ObjectPayload::Array(_) => Some(1),
            ObjectPayload::Map(_) => Some(2),
            ObjectPayload::Function(_) => Some(3),
            ObjectPayload::Native(_) => Some(4),
            ObjectPayload::External(_) => Some(5),
            ObjectPayload::Error(_) => Some(6),
            ObjectPayload::Freed => None,
        }
    }

    fn bypasses_pool(&self) -> bool {
        match self {
            ObjectPayload::Array(items) => items.len() > ARRAY_POOL_MAX_LEN,
            ObjectPayload::Map(map) => map.len() > MAP_POOL_MAX_LEN,
            ObjectPayload::Str(s) => s.value.capacity() > STRING_POOL_MAX_CAPACITY,
            _ => false,
        }
    }
}

const NUM_POOL_TYPES: usize = 7;

pub struct ObjectData {
    pub marked: bool,
    pub payload: ObjectPayload,
}

pub struct Heap {
    slots: Vec<ObjectData>,
    pools: [Vec<u32>; NUM_POOL_TYPES],
    free_slots: Vec<u32>,
    allocations_since_sweep: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            pools: Default::default(),
            free_slots: Vec::new(),
            allocations_since_sweep: 0,
        }
    }

    pub fn payload(&self, obj: ObjectRef) -> &ObjectPayload {
        &self.slots[obj.0 as usize].payload
    }

    pub fn payload_mut(&mut self, obj: ObjectRef) -> &mut ObjectPayload {
        &mut self.slots[obj.0 as usize].payload
    }

    pub fn live_object_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot.payload, ObjectPayload::Freed))
            .count()
    }

    // === Allocation ===

    fn alloc_payload(&mut self, payload: ObjectPayload) -> Value {
        self.allocations_since_sweep += 1;
        let pool_ix = payload.pool_index().expect("cannot allocate a freed payload");
        let slot_ix = self.pools[pool_ix].pop().or_else(|| self.free_slots.pop());
        let ix = match slot_ix {
            Some(ix) => {
                self.slots[ix as usize] = ObjectData { marked: false, payload };
                ix
            }
            None => {
                self.slots.push(ObjectData { marked: false, payload });
                (self.slots.len() - 1) as u32
            }
        };
        Value::Object(ObjectRef(ix))
    }

    pub fn alloc_string(&mut self, value: impl Into<String>) -> Value {
        self.alloc_payload(ObjectPayload::Str(StrData { value: value.into(), hash: Cell::new(0) }))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        self.alloc_payload(ObjectPayload::Array(items))
    }

    pub fn alloc_map(&mut self) -> Value {
        self.alloc_payload(ObjectPayload::Map(MapData::default()))
    }

    pub fn alloc_function(&mut self, data: FunctionData) -> Value {
        self.alloc_payload(ObjectPayload::Function(data))
    }

    pub fn alloc_native(&mut self, name: impl Into<String>, func: NativeFn) -> Value {
        self.alloc_payload(ObjectPayload::Native(NativeData { name: name.into(), func }))
    }

    pub fn alloc_external(
        &mut self,
        data: Box<dyn Any>,
        copy_fn: Option<ExternalCopyFn>,
        destroy_fn: Option<ExternalDestroyFn>,
    ) -> Value {
        self.alloc_payload(ObjectPayload::External(ExternalData { data, copy_fn, destroy_fn }))
    }

    pub fn alloc_error(&mut self, message: impl Into<String>) -> Value {
        self.alloc_payload(ObjectPayload::Error(ErrorData {
            message: message.into(),
            traceback: None,
        }))
    }

    // === Strings ===

    pub fn string_value(&self, obj: ObjectRef) -> Option<&str> {
        match self.payload(obj) {
            ObjectPayload::Str(s) => Some(&s.value),
            _ => None,
        }
    }

    /// Cached stable hash of a string object's bytes.
    pub fn string_hash(&self, obj: ObjectRef) -> u64 {
        let ObjectPayload::Str(s) = self.payload(obj) else {
            return 0;
        };
        let cached = s.hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hash = crate::value::hash_bytes(s.value.as_bytes());
        if hash == 0 {
            hash = 1;
        }
        s.hash.set(hash);
        hash
    }

    // === Maps ===

    pub fn map_len(&self, map: ObjectRef) -> usize {
        match self.payload(map) {
            ObjectPayload::Map(m) => m.len(),
            _ => 0,
        }
    }

    pub fn map_get(&self, map: ObjectRef, key: Value) -> Option<Value> {
        let hash = value_hash(self, key)?;
        let ObjectPayload::Map(m) = self.payload(map) else {
            return None;
        };
        let candidates = m.index.get(&hash)?;
        for &entry_ix in candidates {
            let (entry_key, entry_value) = m.entries[entry_ix as usize];
            if values_equal(self, entry_key, key) {
                return Some(entry_value);
            }
        }
        None
    }

    /// Inserts or replaces a key. Returns false for unhashable keys.
    /// Key hashes are computed once on insert; a stored key's hash must stay
    /// stable for its lifetime in the map.
    pub fn map_set(&mut self, map: ObjectRef, key: Value, value: Value) -> bool {
        let Some(hash) = value_hash(self, key) else {
            return false;
        };
        let existing = {
            let ObjectPayload::Map(m) = self.payload(map) else {
                return false;
            };
            let mut found = None;
            if let Some(candidates) = m.index.get(&hash) {
                for &entry_ix in candidates {
                    let (entry_key, _) = m.entries[entry_ix as usize];
                    if values_equal(self, entry_key, key) {
                        found = Some(entry_ix);
                        break;
                    }
                }
            }
            found
        };
        let ObjectPayload::Map(m) = self.payload_mut(map) else {
            return false;
        };
        match existing {
            Some(entry_ix) => m.entries[entry_ix as usize].1 = value,
            None => {
                let entry_ix = m.entries.len() as u32;
                m.entries.push((key, value));
                m.index.entry(hash).or_default().push(entry_ix);
            }
        }
        true
    }

    pub fn map_entry_at(&self, map: ObjectRef, ix: usize) -> Option<(Value, Value)> {
        match self.payload(map) {
            ObjectPayload::Map(m) => m.entry_at(ix),
            _ => None,
        }
    }

    pub fn map_keys(&self, map: ObjectRef) -> Vec<Value> {
        match self.payload(map) {
            ObjectPayload::Map(m) => m.entries().iter().map(|(k, _)| *k).collect(),
            _ => Vec::new(),
        }
    }

    // === Deep copy ===

    /// Structure-preserving deep copy: shared substructure stays shared and
    /// cycles are closed through the copies map. Functions share their
    /// compilation result; externals are copied through their copy
    /// callback, or shared when they have none.
    pub fn deep_copy(&mut self, value: Value) -> Value {
        let mut copies = AHashMap::new();
        self.deep_copy_inner(value, &mut copies)
    }

    fn deep_copy_inner(&mut self, value: Value, copies: &mut AHashMap<u32, Value>) -> Value {
        let Value::Object(obj) = value else {
            return value;
        };
        if let Some(copy) = copies.get(&obj.0) {
            return *copy;
        }
        match self.payload(obj) {
            ObjectPayload::Str(s) => {
                let text = s.value.clone();
                let copy = self.alloc_string(text);
                copies.insert(obj.0, copy);
                copy
            }
            ObjectPayload::Array(items) => {
                let items = items.clone();
                let copy = self.alloc_array(Vec::with_capacity(items.len()));
                copies.insert(obj.0, copy);
                let copied: Vec<Value> =
                    items.iter().map(|item| self.deep_copy_inner(*item, copies)).collect();
                if let Value::Object(copy_obj) = copy {
                    if let ObjectPayload::Array(dest) = self.payload_mut(copy_obj) {
                        *dest = copied;
                    }
                }
                copy
            }
            ObjectPayload::Map(m) => {
                let entries: Vec<(Value, Value)> = m.entries().to_vec();
                let copy = self.alloc_map();
                copies.insert(obj.0, copy);
                let Value::Object(copy_obj) = copy else {
                    return copy;
                };
                for (key, value) in entries {
                    let key_copy = self.deep_copy_inner(key, copies);
                    let value_copy = self.deep_copy_inner(value, copies);
                    self.map_set(copy_obj, key_copy, value_copy);
                }
                copy
            }
            ObjectPayload::Function(function) => {
                let name = function.name.clone();
                let comp_result = Rc::clone(&function.comp_result);
                let num_locals = function.num_locals;
                let num_args = function.num_args;
                let free_vals = function.free_vals.clone();
                let copy = self.alloc_function(FunctionData {
                    name,
                    comp_result,
                    num_locals,
                    num_args,
                    free_vals: Vec::new(),
                });
                copies.insert(obj.0, copy);
                let copied: Vec<Value> =
                    free_vals.iter().map(|v| self.deep_copy_inner(*v, copies)).collect();
                if let Value::Object(copy_obj) = copy {
                    if let ObjectPayload::Function(dest) = self.payload_mut(copy_obj) {
                        dest.free_vals = copied;
                    }
                }
                copy
            }
            ObjectPayload::External(ext) => {
                let Some(copy_fn) = ext.copy_fn.clone() else {
                    return value;
                };
                let copied_data = copy_fn(&*ext.data);
                let destroy_fn = ext.destroy_fn.clone();
                match copied_data {
                    Some(data) => {
                        let copy = self.alloc_external(data, Some(copy_fn), destroy_fn);
                        copies.insert(obj.0, copy);
                        copy
                    }
                    None => value,
                }
            }
            ObjectPayload::Error(error) => {
                let message = error.message.clone();
                let traceback = error.traceback.clone();
                let copy = self.alloc_error(message);
                if let Value::Object(copy_obj) = copy {
                    if let ObjectPayload::Error(dest) = self.payload_mut(copy_obj) {
                        dest.traceback = traceback;
                    }
                }
                copies.insert(obj.0, copy);
                copy
            }
            ObjectPayload::Native(_) | ObjectPayload::Freed => value,
        }
    }

    // === Garbage collection ===

    pub fn should_sweep(&self) -> bool {
        self.allocations_since_sweep > GC_SWEEP_INTERVAL
    }

    pub fn unmark_all(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        let Value::Object(obj) = value else {
            return;
        };
        let mut worklist = vec![obj];
        while let Some(obj) = worklist.pop() {
            let slot = &mut self.slots[obj.0 as usize];
            if slot.marked {
                continue;
            }
            slot.marked = true;
            match &slot.payload {
                ObjectPayload::Array(items) => {
                    for item in items {
                        if let Value::Object(child) = item {
                            worklist.push(*child);
                        }
                    }
                }
                ObjectPayload::Map(map) => {
                    for (key, value) in map.entries() {
                        if let Value::Object(child) = key {
                            worklist.push(*child);
                        }
                        if let Value::Object(child) = value {
                            worklist.push(*child);
                        }
                    }
                }
                ObjectPayload::Function(function) => {
                    for free_val in &function.free_vals {
                        if let Value::Object(child) = free_val {
                            worklist.push(*child);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    pub fn mark_values(&mut self, values: &[Value]) {
        for value in values {
            self.mark_value(*value);
        }
    }

    /// Frees every unmarked object. Freed slots go to the per-type pool for
    /// fast reuse, unless the pool is full or the payload is oversized.
    pub fn sweep(&mut self) {
        self.allocations_since_sweep = 0;
        for ix in 0..self.slots.len() {
            let slot = &mut self.slots[ix];
            if slot.marked || matches!(slot.payload, ObjectPayload::Freed) {
                continue;
            }
            let pool_ix = slot.payload.pool_index();
            let bypass = slot.payload.bypasses_pool();
            let mut payload = std::mem::replace(&mut slot.payload, ObjectPayload::Freed);
            if let ObjectPayload::External(ext) = &mut payload {
                if let Some(destroy_fn) = ext.destroy_fn.take() {
                    destroy_fn(&mut *ext.data);
                }
            }
            drop(payload);
            match pool_ix {
                Some(pool_ix) if !bypass && self.pools[pool_ix].len() < POOL_MAX_SIZE => {
                    self.pools[pool_ix].push(ix as u32);
                }
                _ => self.free_slots.push(ix as u32),
            }
        }
    }
}
