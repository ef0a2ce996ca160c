//! Mark-sweep collector and object arena.
//!
//! Objects live in `objects`, a vector of optional slots addressed by
//! [`ObjRef`]. Freed slots go on a free list and are reused. The arena is the
//! sweep set: every allocated object stays in it until a sweep finds it
//! unmarked.
//!
//! Collection can only run inside [`Collector::alloc`] (or an explicit
//! [`Collector::collect_garbage`]), before the new object is inserted. Any
//! value the new object refers to must therefore already be reachable from
//! the roots passed in or pinned on the safe stack.

use std::borrow::Cow;

use crate::bytecode::Bytecode;
use crate::lang::object::{
    HeapObject, Obj, ObjArray, ObjClosure, ObjDict, ObjError, ObjFunction, ObjNative, ObjRef,
    ObjString, ObjUpvalue, UpvalueState,
};
use crate::lang::table::Table;
use crate::lang::value::{Value, hash_bytes, hash_int};
use crate::runtime::vm::NativeFn;

/// Where the collector finds its roots besides the safe stack.
pub trait RootSet {
    /// Pushes every root value (operand stack, globals, ...).
    fn trace_roots(&self, out: &mut Vec<Value>);

    /// Head of the open-upvalue list, linked through `ObjUpvalue::next`.
    fn open_upvalues(&self) -> Option<ObjRef> {
        None
    }
}

/// Root set for code running outside the VM: only the safe stack counts.
pub struct NoRoots;

impl RootSet for NoRoots {
    fn trace_roots(&self, _out: &mut Vec<Value>) {}
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bytes allocated before the first collection.
    pub initial_threshold: usize,
    /// Next threshold is live bytes times this factor.
    pub growth_factor: usize,
    /// Collect on every allocation.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: 1024 * 1024,
            growth_factor: 2,
            stress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub objects_allocated: usize,
    pub objects_freed: usize,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

pub struct Collector {
    objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    live: usize,

    /// Interned strings; keys only.
    strings: Table<()>,

    gray: Vec<ObjRef>,
    safe: Vec<Value>,
    scratch: Vec<Value>,

    bytes_allocated: usize,
    next_gc: usize,
    next_identity: u32,

    config: GcConfig,
    stats: GcStats,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        Collector {
            objects: Vec::new(),
            free: Vec::new(),
            live: 0,
            strings: Table::new(),
            gray: Vec::new(),
            safe: Vec::new(),
            scratch: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            next_identity: 0,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            ..self.stats
        }
    }

    pub fn object_count(&self) -> usize {
        self.live
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // =========================================================================
    // Safe stack
    // =========================================================================

    /// Pins `value` against collection until the matching [`pop_safe`].
    ///
    /// [`pop_safe`]: Collector::pop_safe
    pub fn push_safe(&mut self, value: Value) {
        self.safe.push(value);
    }

    pub fn pop_safe(&mut self) -> Option<Value> {
        self.safe.pop()
    }

    pub fn safe_depth(&self) -> usize {
        self.safe.len()
    }

    /// Drops pins above `depth`, used to unwind after a failed construction.
    pub fn truncate_safe(&mut self, depth: usize) {
        self.safe.truncate(depth);
    }

    // =========================================================================
    // Access
    // =========================================================================

    fn header(&self, r: ObjRef) -> &HeapObject {
        match self.objects.get(r.index()) {
            Some(Some(object)) => object,
            _ => panic!("dangling object reference {}", r),
        }
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        matches!(self.objects.get(r.index()), Some(Some(_)))
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.header(r).obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match self.objects.get_mut(r.index()) {
            Some(Some(object)) => &mut object.obj,
            _ => panic!("dangling object reference {}", r),
        }
    }

    /// Hash used as the key hash in tables: content hash for strings,
    /// identity hash for other objects, value hash for immediates.
    pub fn hash_value(&self, value: Value) -> u32 {
        match value {
            Value::Obj(r) => self.header(r).hash,
            other => other.immediate_hash().unwrap_or_default(),
        }
    }

    pub fn string_bytes(&self, r: ObjRef) -> Option<&[u8]> {
        match self.get(r) {
            Obj::String(s) => Some(&s.bytes),
            _ => None,
        }
    }

    pub fn string_lossy(&self, r: ObjRef) -> Cow<'_, str> {
        match self.get(r) {
            Obj::String(s) => s.as_str_lossy(),
            other => Cow::Borrowed(other.kind().name()),
        }
    }

    pub fn as_function(&self, r: ObjRef) -> Option<&ObjFunction> {
        match self.get(r) {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self, r: ObjRef) -> Option<&mut ObjFunction> {
        match self.get_mut(r) {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Inserts `obj` with an identity hash.
    pub fn alloc(&mut self, obj: Obj, roots: &dyn RootSet) -> ObjRef {
        self.next_identity = self.next_identity.wrapping_add(1);
        let hash = hash_int(self.next_identity);
        self.alloc_with_hash(obj, hash, roots)
    }

    fn alloc_with_hash(&mut self, obj: Obj, hash: u32, roots: &dyn RootSet) -> ObjRef {
        let size = obj.estimate_size();
        self.bytes_allocated += size;
        if self.config.stress || self.bytes_allocated > self.next_gc {
            self.collect_garbage(roots);
        }

        let object = HeapObject {
            hash,
            marked: false,
            size,
            obj,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(object);
                index
            }
            None => {
                self.objects.push(Some(object));
                (self.objects.len() - 1) as u32
            }
        };
        self.live += 1;
        self.stats.objects_allocated += 1;
        ObjRef::from_index(index)
    }

    /// Recharges `r` at its current size after it grew or shrank in place.
    ///
    /// Growth counts like an allocation and may collect, so `r` must be
    /// reachable from `roots` or the safe stack.
    pub fn track_growth(&mut self, r: ObjRef, roots: &dyn RootSet) {
        let Some(Some(object)) = self.objects.get_mut(r.index()) else {
            return;
        };
        let size = object.obj.estimate_size();
        let before = std::mem::replace(&mut object.size, size);
        if size <= before {
            self.bytes_allocated = self.bytes_allocated.saturating_sub(before - size);
            return;
        }
        self.bytes_allocated += size - before;
        if self.config.stress || self.bytes_allocated > self.next_gc {
            self.collect_garbage(roots);
        }
    }

    /// Returns the canonical string for `bytes`, allocating it on first use.
    pub fn intern(&mut self, bytes: &[u8], roots: &dyn RootSet) -> ObjRef {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.find_interned(bytes, hash) {
            return existing;
        }
        let string = Obj::String(ObjString {
            bytes: bytes.into(),
        });
        let r = self.alloc_with_hash(string, hash, roots);
        self.strings.put(Value::Obj(r), hash, ());
        r
    }

    pub fn intern_str(&mut self, s: &str, roots: &dyn RootSet) -> ObjRef {
        self.intern(s.as_bytes(), roots)
    }

    /// Finds an already interned string without allocating.
    pub fn lookup_interned(&self, bytes: &[u8]) -> Option<ObjRef> {
        self.find_interned(bytes, hash_bytes(bytes))
    }

    fn find_interned(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        let objects = &self.objects;
        self.strings
            .find_key(hash, |key| {
                let Some(r) = key.as_obj() else { return false };
                matches!(
                    objects.get(r.index()),
                    Some(Some(HeapObject { obj: Obj::String(s), .. })) if &*s.bytes == bytes
                )
            })
            .and_then(Value::as_obj)
    }

    /// Allocates an empty function. `None` names the top-level script.
    pub fn new_function(&mut self, name: Option<&str>, arity: u8, roots: &dyn RootSet) -> ObjRef {
        let name = name.map(|n| self.intern_str(n, roots));
        if let Some(name) = name {
            self.push_safe(Value::Obj(name));
        }
        let function = self.alloc(
            Obj::Function(ObjFunction {
                name,
                arity,
                upvalue_count: 0,
                bytecode: Bytecode::new(),
            }),
            roots,
        );
        if name.is_some() {
            self.pop_safe();
        }
        function
    }

    /// Allocates a closure with room for the function's upvalues; the caller
    /// fills them in.
    pub fn new_closure(&mut self, function: ObjRef, roots: &dyn RootSet) -> ObjRef {
        let count = self.as_function(function).map_or(0, |f| f.upvalue_count);
        self.alloc(
            Obj::Closure(ObjClosure {
                function,
                upvalues: Vec::with_capacity(count),
            }),
            roots,
        )
    }

    pub fn new_upvalue(&mut self, slot: usize, next: Option<ObjRef>, roots: &dyn RootSet) -> ObjRef {
        self.alloc(
            Obj::Upvalue(ObjUpvalue {
                state: UpvalueState::Open(slot),
                next,
            }),
            roots,
        )
    }

    /// `values` must be rooted by the caller until this returns.
    pub fn new_array(&mut self, values: Vec<Value>, roots: &dyn RootSet) -> ObjRef {
        self.alloc(Obj::Array(ObjArray { values }), roots)
    }

    pub fn new_dict(&mut self, roots: &dyn RootSet) -> ObjRef {
        self.alloc(Obj::Dict(ObjDict::default()), roots)
    }

    /// Builds an error value. The payload, if any, must already be rooted;
    /// it stays pinned while the message is interned and the error allocated.
    pub fn new_error(&mut self, message: &str, payload: Option<Value>, roots: &dyn RootSet) -> Value {
        if let Some(payload) = payload {
            self.push_safe(payload);
        }
        let message = self.intern_str(message, roots);
        self.push_safe(Value::Obj(message));
        let error = self.alloc(Obj::Error(ObjError { message, payload }), roots);
        self.pop_safe();
        if payload.is_some() {
            self.pop_safe();
        }
        Value::Obj(error)
    }

    pub fn new_native(
        &mut self,
        name: &str,
        arity: u8,
        function: NativeFn,
        roots: &dyn RootSet,
    ) -> ObjRef {
        let name = self.intern_str(name, roots);
        self.push_safe(Value::Obj(name));
        let native = self.alloc(
            Obj::Native(ObjNative {
                name,
                arity,
                function,
            }),
            roots,
        );
        self.pop_safe();
        native
    }

    // =========================================================================
    // Collection
    // =========================================================================

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: ObjRef) {
        let Some(Some(object)) = self.objects.get_mut(r.index()) else {
            return;
        };
        if object.marked {
            return;
        }
        object.marked = true;
        // strings have no outgoing references
        if !matches!(object.obj, Obj::String(_)) {
            self.gray.push(r);
        }
    }

    fn mark_roots(&mut self, roots: &dyn RootSet, pending: &mut Vec<Value>) {
        roots.trace_roots(pending);
        pending.extend_from_slice(&self.safe);
        for value in pending.drain(..) {
            self.mark_value(value);
        }

        let mut next = roots.open_upvalues();
        while let Some(upvalue) = next {
            self.mark_object(upvalue);
            next = match self.get(upvalue) {
                Obj::Upvalue(u) => u.next,
                _ => None,
            };
        }
    }

    fn blacken(&mut self, pending: &mut Vec<Value>) {
        while let Some(r) = self.gray.pop() {
            self.get(r).trace(pending);
            for value in pending.drain(..) {
                self.mark_value(value);
            }
        }
    }

    fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut freed_bytes = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            let Some(object) = slot else { continue };
            if object.marked {
                object.marked = false;
                continue;
            }
            freed_bytes += object.size;
            *slot = None;
            self.free.push(index as u32);
            freed += 1;
        }
        (freed, freed_bytes)
    }

    /// Runs a full mark-sweep cycle and returns the number of objects freed.
    pub fn collect_garbage(&mut self, roots: &dyn RootSet) -> usize {
        let mut pending = std::mem::take(&mut self.scratch);
        pending.clear();

        self.mark_roots(roots, &mut pending);
        self.blacken(&mut pending);
        self.scratch = pending;

        let objects = &self.objects;
        let dropped_strings = self.strings.sweep_unmarked(|r| {
            matches!(objects.get(r.index()), Some(Some(object)) if object.marked)
        });

        let (freed, freed_bytes) = self.sweep();
        self.live -= freed;
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = (self.bytes_allocated * self.config.growth_factor)
            .max(self.config.initial_threshold);

        self.stats.collections += 1;
        self.stats.objects_freed += freed;

        tracing::debug!(
            freed,
            dropped_strings,
            live = self.live,
            bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc cycle"
        );
        freed
    }
}
