use std::fmt;
use std::mem::size_of;

use crate::bytecode::Bytecode;
use crate::lang::table::Table;
use crate::lang::value::Value;
use crate::runtime::vm::NativeFn;

/// Handle to an object in the collector's arena.
///
/// Handles are plain indices: copying one does not keep the object alive.
/// Only values reachable from a root survive a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn from_index(index: u32) -> Self {
        ObjRef(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Closure,
    Upvalue,
    Array,
    Dict,
    Error,
    Native,
}

impl ObjKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjKind::String => "string",
            ObjKind::Function => "function",
            ObjKind::Closure => "function",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Array => "array",
            ObjKind::Dict => "dict",
            ObjKind::Error => "error",
            ObjKind::Native => "native",
        }
    }
}

/// Arena slot contents: the GC header plus the object itself.
#[derive(Debug)]
pub struct HeapObject {
    pub hash: u32,
    pub marked: bool,
    pub size: usize,
    pub obj: Obj,
}

#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Array(ObjArray),
    Dict(ObjDict),
    Error(ObjError),
    Native(ObjNative),
}

#[derive(Debug)]
pub struct ObjString {
    pub bytes: Box<[u8]>,
}

impl ObjString {
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug)]
pub struct ObjFunction {
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub bytecode: Bytecode,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    /// Filled left to right while the closure instruction runs.
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Index of the captured slot on the VM operand stack.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
    /// Next entry in the VM's open-upvalue list, sorted by slot, highest first.
    pub next: Option<ObjRef>,
}

impl ObjUpvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjArray {
    pub values: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct ObjDict {
    pub map: Table<Value>,
}

#[derive(Debug)]
pub struct ObjError {
    pub message: ObjRef,
    pub payload: Option<Value>,
}

pub struct ObjNative {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeFn,
}

impl fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl Obj {
    pub fn kind(&self) -> ObjKind {
        match self {
            Obj::String(_) => ObjKind::String,
            Obj::Function(_) => ObjKind::Function,
            Obj::Closure(_) => ObjKind::Closure,
            Obj::Upvalue(_) => ObjKind::Upvalue,
            Obj::Array(_) => ObjKind::Array,
            Obj::Dict(_) => ObjKind::Dict,
            Obj::Error(_) => ObjKind::Error,
            Obj::Native(_) => ObjKind::Native,
        }
    }

    /// Pushes every value this object directly references.
    ///
    /// Strings reference nothing; the collector never blackens them.
    pub fn trace(&self, out: &mut Vec<Value>) {
        match self {
            Obj::String(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    out.push(Value::Obj(name));
                }
                out.extend_from_slice(&f.bytecode.constants);
            }
            Obj::Closure(c) => {
                out.push(Value::Obj(c.function));
                out.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            Obj::Upvalue(u) => {
                // an open upvalue's slot is already a stack root
                if let UpvalueState::Closed(v) = u.state {
                    out.push(v);
                }
            }
            Obj::Array(a) => out.extend_from_slice(&a.values),
            Obj::Dict(d) => d.map.trace(out),
            Obj::Error(e) => {
                out.push(Value::Obj(e.message));
                if let Some(payload) = e.payload {
                    out.push(payload);
                }
            }
            Obj::Native(n) => out.push(Value::Obj(n.name)),
        }
    }

    /// Rough byte footprint, used to drive the collection threshold.
    pub fn estimate_size(&self) -> usize {
        let payload = match self {
            Obj::String(s) => s.bytes.len(),
            Obj::Function(f) => {
                f.bytecode.code.capacity() + f.bytecode.constants.capacity() * size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Array(a) => a.values.capacity() * size_of::<Value>(),
            Obj::Dict(d) => d.map.capacity() * size_of::<usize>() + d.map.len() * 40,
            Obj::Error(_) => 0,
            Obj::Native(_) => 0,
        };
        size_of::<HeapObject>() + payload
    }
}
