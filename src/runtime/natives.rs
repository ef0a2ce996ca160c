//! Built-in host functions.
//!
//! Misuse never aborts the run: a native handed the wrong kind of value
//! returns an `Error` value instead.

use crate::lang::object::Obj;
use crate::lang::value::Value;
use crate::runtime::vm::Vm;

pub fn register(vm: &mut Vm<'_>) {
    vm.declare_native("tostr", 1, native_tostr);
    vm.declare_native("typeof", 1, native_typeof);
    vm.declare_native("len", 1, native_len);
    vm.declare_native("push", 2, native_push);
    vm.declare_native("error", 2, native_error);
    vm.declare_native("iserror", 1, native_iserror);
    vm.declare_native("collect", 0, native_collect);
}

fn native_tostr(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    vm.value_to_string(args[0])
}

fn native_typeof(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    let name = vm.heap().type_name(args[0]);
    vm.intern(name)
}

fn native_len(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    let len = match args[0].as_obj().map(|r| vm.obj(r)) {
        Some(Obj::String(s)) => Some(s.bytes.len()),
        Some(Obj::Array(a)) => Some(a.values.len()),
        Some(Obj::Dict(d)) => Some(d.map.len()),
        _ => None,
    };
    match len {
        Some(len) => Value::Number(len as f64),
        None => vm.new_error("len expects a string, array or dict", Some(args[0])),
    }
}

/// Appends in place and returns the array.
fn native_push(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    if let Some(r) = args[0].as_obj() {
        if let Obj::Array(a) = vm.obj_mut(r) {
            a.values.push(args[1]);
            vm.track_growth(r);
            return args[0];
        }
    }
    vm.new_error("push expects an array", Some(args[0]))
}

fn native_error(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    let message = match args[0].as_obj().map(|r| vm.obj(r)) {
        Some(Obj::String(s)) => s.as_str_lossy().into_owned(),
        _ => return vm.new_error("error message must be a string", Some(args[0])),
    };
    let payload = if args[1].is_nihl() { None } else { Some(args[1]) };
    vm.new_error(&message, payload)
}

fn native_iserror(vm: &mut Vm<'_>, args: &[Value]) -> Value {
    let is_error = matches!(args[0].as_obj().map(|r| vm.obj(r)), Some(Obj::Error(_)));
    Value::Bool(is_error)
}

fn native_collect(vm: &mut Vm<'_>, _args: &[Value]) -> Value {
    Value::Number(vm.collect_garbage() as f64)
}
