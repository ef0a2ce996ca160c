use crate::lang::object::ObjRef;

/// Runtime value in the yaspl language.
///
/// Values are copied everywhere; only `Obj` carries reference semantics,
/// through a handle into the collector's arena.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    /// The null value, spelled `nihl` in source.
    Nihl,

    Bool(bool),

    /// Every number is a double.
    Number(f64),

    /// Reference to a heap object owned by the collector.
    Obj(ObjRef),
}

impl Value {
    /// C-like truthiness: only `nihl`, `false` and `0` are falsy.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nihl | Value::Bool(false))
            && !matches!(self, Value::Number(n) if n == 0.0)
    }

    pub fn is_nihl(self) -> bool {
        matches!(self, Value::Nihl)
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_obj(self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the number as an `i64` if it has no fractional part.
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Value::Number(n) if is_integral(n) => Some(n as i64),
            _ => None,
        }
    }

    /// Hash of a non-object value. Objects carry their own hash in the heap.
    pub fn immediate_hash(self) -> Option<u32> {
        match self {
            Value::Nihl => Some(hash_int(42)),
            Value::Bool(b) => Some(hash_int(b as u32 + 31)),
            Value::Number(n) => Some(hash_number(n)),
            Value::Obj(_) => None,
        }
    }
}

/// Tag mismatch is never equal; objects compare by identity.
pub fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nihl, Value::Nihl) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Obj(a), Value::Obj(b)) => a == b,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(*self, *other)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Obj(r)
    }
}

pub fn is_integral(n: f64) -> bool {
    n.is_finite() && n.fract() == 0.0
}

/// Thomas Wang's 32-bit integer mix.
pub fn hash_int(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed55d16).wrapping_add(a << 12);
    a = (a ^ 0xc761c23c) ^ (a >> 19);
    a = a.wrapping_add(0x165667b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2646c) ^ (a << 9);
    a = a.wrapping_add(0xfd7046c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a4f09) ^ (a >> 16);
    a
}

/// FNV-1a over raw bytes; used for interned strings.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub fn hash_number(n: f64) -> u32 {
    // 0.0 and -0.0 compare equal and must land in the same bucket
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    hash_int((bits as u32) ^ ((bits >> 32) as u32))
}
