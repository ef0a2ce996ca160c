//! Indexing, concatenation and string conversion.
//!
//! Failures here are recoverable: they come back as `Error` values that the
//! running program can inspect, never as a VM abort. Arguments are expected
//! to be rooted by the caller (in practice they are still on the operand
//! stack).

use std::fmt;

use crate::lang::object::{Obj, ObjRef, UpvalueState};
use crate::lang::value::Value;
use crate::runtime::heap::{Collector, RootSet};

enum Element {
    Value(Value),
    Byte(u8),
}

enum Joined {
    Bytes(Vec<u8>),
    Values(Vec<Value>),
}

/// Resolves `index` against a sequence of `len` items named `kind`.
fn checked_index(index: Value, len: usize, kind: &str) -> Result<usize, String> {
    let Some(i) = index.as_integer() else {
        return Err(format!("invalid index for {}", kind));
    };
    match usize::try_from(i) {
        Ok(i) if i < len => Ok(i),
        _ => Err(format!("{} index out of bounds", kind)),
    }
}

impl Collector {
    /// `target[index]`. A missing dict key reads as `nihl`.
    pub fn index_get(&mut self, target: Value, index: Value, roots: &dyn RootSet) -> Value {
        let Value::Obj(r) = target else {
            return self.new_error("value not indexable", None, roots);
        };
        let element = match self.get(r) {
            Obj::String(s) => checked_index(index, s.bytes.len(), "string")
                .map(|i| Element::Byte(s.bytes[i])),
            Obj::Array(a) => checked_index(index, a.values.len(), "array")
                .map(|i| Element::Value(a.values[i])),
            Obj::Dict(d) => Ok(Element::Value(
                d.map.get(index, self.hash_value(index)).unwrap_or(Value::Nihl),
            )),
            _ => Err("object not indexable".to_string()),
        };
        match element {
            Ok(Element::Value(value)) => value,
            // strings index by byte, not by codepoint
            Ok(Element::Byte(byte)) => Value::Obj(self.intern(&[byte], roots)),
            Err(message) => self.new_error(&message, None, roots),
        }
    }

    /// `target[index] = value`; evaluates to `value` on success.
    pub fn index_set(
        &mut self,
        target: Value,
        index: Value,
        value: Value,
        roots: &dyn RootSet,
    ) -> Value {
        let Value::Obj(r) = target else {
            return self.new_error("value not indexable", None, roots);
        };
        let hash = self.hash_value(index);
        let outcome = match self.get_mut(r) {
            Obj::Array(a) => checked_index(index, a.values.len(), "array").map(|i| {
                a.values[i] = value;
            }),
            Obj::Dict(d) => {
                d.map.put(index, hash, value);
                Ok(())
            }
            _ => Err("object index not assignable".to_string()),
        };
        match outcome {
            Ok(()) => {
                self.track_growth(r, roots);
                value
            }
            Err(message) => self.new_error(&message, None, roots),
        }
    }

    /// `a ++ b` for two strings or two arrays.
    pub fn concatenate(&mut self, a: Value, b: Value, roots: &dyn RootSet) -> Value {
        let (Value::Obj(ra), Value::Obj(rb)) = (a, b) else {
            return self.new_error("cannot concatenate non objects", None, roots);
        };
        let joined = match (self.get(ra), self.get(rb)) {
            (Obj::String(x), Obj::String(y)) => Ok(Joined::Bytes([&x.bytes[..], &y.bytes[..]].concat())),
            (Obj::Array(x), Obj::Array(y)) => {
                Ok(Joined::Values([&x.values[..], &y.values[..]].concat()))
            }
            (x, y) if x.kind() != y.kind() => Err("cannot concatenate objects of different types"),
            _ => Err("cannot concatenate objects that are not strings or arrays"),
        };
        match joined {
            Ok(Joined::Bytes(bytes)) => Value::Obj(self.intern(&bytes, roots)),
            Ok(Joined::Values(values)) => {
                self.push_safe(a);
                self.push_safe(b);
                let array = self.new_array(values, roots);
                self.pop_safe();
                self.pop_safe();
                Value::Obj(array)
            }
            Err(message) => self.new_error(message, None, roots),
        }
    }

    /// Canonical text of `value` as an interned string. Strings map to
    /// themselves.
    pub fn value_to_string(&mut self, value: Value, roots: &dyn RootSet) -> Value {
        if let Value::Obj(r) = value {
            if self.string_bytes(r).is_some() {
                return value;
            }
        }
        let text = self.display_value(value);
        Value::Obj(self.intern(text.as_bytes(), roots))
    }

    pub fn display_value(&self, value: Value) -> String {
        self.display(value).to_string()
    }

    pub fn display(&self, value: Value) -> ValueDisplay<'_> {
        ValueDisplay { heap: self, value }
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nihl => "nihl",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(r) => self.get(r).kind().name(),
        }
    }
}

/// Renders a value the way `print` shows it.
pub struct ValueDisplay<'a> {
    heap: &'a Collector,
    value: Value,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut path = Vec::new();
        write_value(self.heap, f, self.value, &mut path)
    }
}

fn write_value(
    heap: &Collector,
    f: &mut fmt::Formatter<'_>,
    value: Value,
    path: &mut Vec<ObjRef>,
) -> fmt::Result {
    match value {
        Value::Nihl => write!(f, "nihl"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", n),
        Value::Obj(r) => write_object(heap, f, r, path),
    }
}

/// Containers already on the render path print as `<self>`.
fn write_element(
    heap: &Collector,
    f: &mut fmt::Formatter<'_>,
    value: Value,
    path: &mut Vec<ObjRef>,
) -> fmt::Result {
    match value {
        Value::Obj(r) if path.contains(&r) => write!(f, "<self>"),
        _ => write_value(heap, f, value, path),
    }
}

fn write_object(
    heap: &Collector,
    f: &mut fmt::Formatter<'_>,
    r: ObjRef,
    path: &mut Vec<ObjRef>,
) -> fmt::Result {
    match heap.get(r) {
        Obj::String(s) => write!(f, "{}", s.as_str_lossy()),
        Obj::Function(function) => match function.name {
            Some(name) => write!(f, "<{} function>", heap.string_lossy(name)),
            None => write!(f, "<init>"),
        },
        Obj::Closure(closure) => write_object(heap, f, closure.function, path),
        Obj::Upvalue(upvalue) => match upvalue.state {
            UpvalueState::Closed(value) => {
                write!(f, "upvalue ")?;
                write_value(heap, f, value, path)
            }
            UpvalueState::Open(slot) => write!(f, "upvalue <slot {}>", slot),
        },
        Obj::Error(error) => {
            write!(f, "{}", heap.string_lossy(error.message))?;
            if let Some(payload) = error.payload {
                write!(f, " (")?;
                write_element(heap, f, payload, path)?;
                write!(f, ")")?;
            }
            Ok(())
        }
        Obj::Array(array) => {
            path.push(r);
            write!(f, "[")?;
            for (i, &value) in array.values.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_element(heap, f, value, path)?;
            }
            path.pop();
            write!(f, "]")
        }
        Obj::Dict(dict) => {
            path.push(r);
            write!(f, "{{")?;
            for (i, (key, &value)) in dict.map.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_element(heap, f, key, path)?;
                write!(f, " => ")?;
                write_element(heap, f, value, path)?;
            }
            path.pop();
            write!(f, "}}")
        }
        Obj::Native(native) => write!(f, "<native {}>", heap.string_lossy(native.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::heap::NoRoots;

    fn string(heap: &mut Collector, s: &str) -> Value {
        Value::Obj(heap.intern_str(s, &NoRoots))
    }

    fn array(heap: &mut Collector, values: Vec<Value>) -> Value {
        Value::Obj(heap.new_array(values, &NoRoots))
    }

    /// Asserts `value` is an error whose message contains `needle`.
    fn assert_error_value(heap: &Collector, value: Value, needle: &str) {
        let Some(r) = value.as_obj() else {
            panic!("expected error value, got {:?}", value);
        };
        match heap.get(r) {
            Obj::Error(e) => {
                let message = heap.string_lossy(e.message);
                assert!(
                    message.contains(needle),
                    "expected error containing '{}', got: {}",
                    needle,
                    message
                );
            }
            other => panic!("expected error value, got {}", other.kind().name()),
        }
    }

    #[test]
    fn test_literal_text_forms() {
        let heap = Collector::new();
        assert_eq!(heap.display_value(Value::Nihl), "nihl");
        assert_eq!(heap.display_value(Value::Bool(true)), "true");
        assert_eq!(heap.display_value(Value::Bool(false)), "false");
        assert_eq!(heap.display_value(Value::Number(6.4)), "6.4");
        assert_eq!(heap.display_value(Value::Number(1024.0)), "1024");
        assert_eq!(heap.display_value(Value::Number(-0.5)), "-0.5");
        assert_eq!(heap.display_value(Value::Number(0.1 + 0.2)), "0.30000000000000004");
    }

    #[test]
    fn test_number_text_round_trips() {
        let heap = Collector::new();
        for n in [0.0, 1.5, -3.0, 1e-7, 123456789.125, f64::MAX] {
            let text = heap.display_value(Value::Number(n));
            assert_eq!(text.parse::<f64>().ok(), Some(n), "{}", text);
        }
    }

    #[test]
    fn test_array_indexing_bounds() {
        let mut heap = Collector::new();
        let arr = array(&mut heap, vec![Value::Number(10.0), Value::Number(20.0)]);

        assert_eq!(heap.index_get(arr, Value::Number(0.0), &NoRoots), Value::Number(10.0));
        assert_eq!(heap.index_get(arr, Value::Number(1.0), &NoRoots), Value::Number(20.0));

        let past_end = heap.index_get(arr, Value::Number(2.0), &NoRoots);
        assert_error_value(&heap, past_end, "array index out of bounds");
        let negative = heap.index_get(arr, Value::Number(-1.0), &NoRoots);
        assert_error_value(&heap, negative, "array index out of bounds");
        let fractional = heap.index_get(arr, Value::Number(0.5), &NoRoots);
        assert_error_value(&heap, fractional, "invalid index for array");
    }

    #[test]
    fn test_string_indexing_yields_one_byte_string() {
        let mut heap = Collector::new();
        let s = string(&mut heap, "abc");
        let b = heap.index_get(s, Value::Number(1.0), &NoRoots);
        assert_eq!(b, string(&mut heap, "b"));

        let out = heap.index_get(s, Value::Number(3.0), &NoRoots);
        assert_error_value(&heap, out, "string index out of bounds");
    }

    #[test]
    fn test_strings_are_not_assignable() {
        let mut heap = Collector::new();
        let s = string(&mut heap, "abc");
        let result = heap.index_set(s, Value::Number(0.0), Value::Nihl, &NoRoots);
        assert_error_value(&heap, result, "object index not assignable");
    }

    #[test]
    fn test_non_objects_are_not_indexable() {
        let mut heap = Collector::new();
        let result = heap.index_get(Value::Number(3.0), Value::Number(0.0), &NoRoots);
        assert_error_value(&heap, result, "value not indexable");
    }

    #[test]
    fn test_dict_get_set() {
        let mut heap = Collector::new();
        let dict = Value::Obj(heap.new_dict(&NoRoots));
        let key = string(&mut heap, "k");

        assert_eq!(heap.index_get(dict, key, &NoRoots), Value::Nihl);
        let assigned = heap.index_set(dict, key, Value::Number(7.0), &NoRoots);
        assert_eq!(assigned, Value::Number(7.0));

        // an equal string built separately is the same key
        let again = string(&mut heap, "k");
        assert_eq!(heap.index_get(dict, again, &NoRoots), Value::Number(7.0));
    }

    #[test]
    fn test_array_set_in_place() {
        let mut heap = Collector::new();
        let arr = array(&mut heap, vec![Value::Nihl]);
        heap.index_set(arr, Value::Number(0.0), Value::Bool(true), &NoRoots);
        assert_eq!(heap.display_value(arr), "[true]");
    }

    #[test]
    fn test_concatenate_strings_is_interned() {
        let mut heap = Collector::new();
        let a = string(&mut heap, "foo");
        let b = string(&mut heap, "bar");
        let joined = heap.concatenate(a, b, &NoRoots);
        assert_eq!(joined, string(&mut heap, "foobar"));
    }

    #[test]
    fn test_concatenate_arrays() {
        let mut heap = Collector::new();
        let a = array(&mut heap, vec![Value::Number(1.0)]);
        let b = array(&mut heap, vec![Value::Number(2.0), Value::Number(3.0)]);
        let joined = heap.concatenate(a, b, &NoRoots);
        assert_eq!(heap.display_value(joined), "[1, 2, 3]");
        assert_ne!(joined, a);
    }

    #[test]
    fn test_concatenate_rejections() {
        let mut heap = Collector::new();
        let s = string(&mut heap, "x");
        let arr = array(&mut heap, Vec::new());
        let dict = Value::Obj(heap.new_dict(&NoRoots));

        let r = heap.concatenate(Value::Number(1.0), s, &NoRoots);
        assert_error_value(&heap, r, "cannot concatenate non objects");
        let r = heap.concatenate(s, arr, &NoRoots);
        assert_error_value(&heap, r, "different types");
        let r = heap.concatenate(dict, dict, &NoRoots);
        assert_error_value(&heap, r, "not strings or arrays");
    }

    #[test]
    fn test_self_reference_renders_placeholder() {
        let mut heap = Collector::new();
        let arr = array(&mut heap, vec![Value::Number(1.0)]);
        let Some(r) = arr.as_obj() else { unreachable!() };
        if let Obj::Array(a) = heap.get_mut(r) {
            a.values.push(arr);
        }
        assert_eq!(heap.display_value(arr), "[1, <self>]");
    }

    #[test]
    fn test_nested_containers() {
        let mut heap = Collector::new();
        let inner = array(&mut heap, vec![Value::Bool(false)]);
        let dict = Value::Obj(heap.new_dict(&NoRoots));
        let key = string(&mut heap, "a");
        heap.index_set(dict, key, inner, &NoRoots);
        assert_eq!(heap.display_value(dict), "{a => [false]}");
    }

    #[test]
    fn test_error_text_includes_payload() {
        let mut heap = Collector::new();
        let err = heap.new_error("boom", Some(Value::Number(3.0)), &NoRoots);
        assert_eq!(heap.display_value(err), "boom (3)");
    }

    #[test]
    fn test_function_text() {
        let mut heap = Collector::new();
        let named = heap.new_function(Some("add"), 2, &NoRoots);
        let script = heap.new_function(None, 0, &NoRoots);
        assert_eq!(heap.display_value(Value::Obj(named)), "<add function>");
        assert_eq!(heap.display_value(Value::Obj(script)), "<init>");
    }

    #[test]
    fn test_value_to_string_interns() {
        let mut heap = Collector::new();
        let text = heap.value_to_string(Value::Number(2.5), &NoRoots);
        assert_eq!(text, string(&mut heap, "2.5"));
        let s = string(&mut heap, "same");
        assert_eq!(heap.value_to_string(s, &NoRoots), s);
    }

    #[test]
    fn test_type_names() {
        let mut heap = Collector::new();
        let s = string(&mut heap, "s");
        assert_eq!(heap.type_name(Value::Nihl), "nihl");
        assert_eq!(heap.type_name(Value::Number(1.0)), "number");
        assert_eq!(heap.type_name(s), "string");
    }
}
