use std::io::{self, Write};

use crate::bytecode::OpCode;
use crate::bytecode::disasm::format_instruction;
use crate::lang::object::{Obj, ObjRef, UpvalueState};
use crate::lang::table::Table;
use crate::lang::value::Value;
use crate::runtime::heap::{Collector, RootSet};
use crate::runtime::natives;
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};

pub const MAX_FRAMES: usize = 256;
pub const MAX_STACK: usize = MAX_FRAMES * u8::MAX as usize;

/// Host function callable from the language. Arguments are a copy; the
/// originals stay on the operand stack (and rooted) for the whole call.
pub type NativeFn = fn(&mut Vm<'_>, &[Value]) -> Value;

pub type RuntimeResult = Result<Value, RuntimeError>;

type Step<T> = Result<T, RuntimeErrorKind>;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_frames: usize,
    pub max_stack: usize,
    /// Emit a `trace` event per instruction.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: MAX_FRAMES,
            max_stack: MAX_STACK,
            trace_execution: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    pub function: ObjRef,
    pub pc: usize,
    /// Stack index of the first argument; the callee sits just below.
    pub base: usize,
}

/// Everything the collector scans while the VM runs.
#[derive(Debug, Default)]
pub struct VmState {
    stack: Vec<Value>,
    globals: Table<Value>,
    /// Sorted by slot, highest first.
    open_upvalues: Option<ObjRef>,
}

impl RootSet for VmState {
    fn trace_roots(&self, out: &mut Vec<Value>) {
        out.extend_from_slice(&self.stack);
        self.globals.trace(out);
    }

    fn open_upvalues(&self) -> Option<ObjRef> {
        self.open_upvalues
    }
}

enum Flow {
    Continue,
    Finished(Value),
}

pub struct Vm<'h> {
    heap: &'h mut Collector,
    frames: Vec<CallFrame>,
    state: VmState,
    config: VmConfig,
    out: Box<dyn Write + 'h>,
}

impl<'h> Vm<'h> {
    pub fn new(heap: &'h mut Collector) -> Self {
        Self::with_config(heap, VmConfig::default())
    }

    pub fn with_config(heap: &'h mut Collector, config: VmConfig) -> Self {
        Vm {
            heap,
            frames: Vec::with_capacity(config.max_frames),
            state: VmState::default(),
            config,
            out: Box::new(io::stdout()),
        }
    }

    /// Redirects `print` output.
    pub fn with_output(mut self, out: impl Write + 'h) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn heap(&self) -> &Collector {
        &*self.heap
    }

    pub fn stack(&self) -> &[Value] {
        &self.state.stack
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let key = Value::Obj(self.heap.lookup_interned(name.as_bytes())?);
        self.state.globals.get(key, self.heap.hash_value(key))
    }

    // =========================================================================
    // Host helpers for natives
    // =========================================================================

    pub fn new_error(&mut self, message: &str, payload: Option<Value>) -> Value {
        self.heap.new_error(message, payload, &self.state)
    }

    pub fn intern(&mut self, text: &str) -> Value {
        Value::Obj(self.heap.intern_str(text, &self.state))
    }

    pub fn value_to_string(&mut self, value: Value) -> Value {
        self.heap.value_to_string(value, &self.state)
    }

    pub fn collect_garbage(&mut self) -> usize {
        self.heap.collect_garbage(&self.state)
    }

    pub fn obj(&self, r: ObjRef) -> &Obj {
        self.heap.get(r)
    }

    pub fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.heap.get_mut(r)
    }

    /// Call after growing `r` through [`Vm::obj_mut`]; may collect.
    pub fn track_growth(&mut self, r: ObjRef) {
        self.heap.track_growth(r, &self.state);
    }

    /// Binds a host function under `name` in the globals.
    pub fn declare_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let native = self.heap.new_native(name, arity, function, &self.state);
        self.heap.push_safe(Value::Obj(native));
        let key = self.heap.intern_str(name, &self.state);
        self.heap.pop_safe();
        let key = Value::Obj(key);
        let hash = self.heap.hash_value(key);
        self.state.globals.put(key, hash, Value::Obj(native));
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Runs a compiled script function to its outermost `return`.
    pub fn interpret(&mut self, function: ObjRef) -> RuntimeResult {
        self.heap.push_safe(Value::Obj(function));
        natives::register(self);
        let closure = self.heap.new_closure(function, &self.state);
        self.heap.pop_safe();

        let started = self
            .push(Value::Obj(closure))
            .and_then(|()| self.call_closure(closure, 0));
        if let Err(kind) = started {
            return Err(self.fail(kind));
        }
        self.run()
    }

    fn run(&mut self) -> RuntimeResult {
        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished(value)) => return Ok(value),
                Err(kind) => return Err(self.fail(kind)),
            }
        }
    }

    /// Attaches line and call stack, then resets the VM.
    fn fail(&mut self, kind: RuntimeErrorKind) -> RuntimeError {
        let mut error = RuntimeError::new(kind);
        let mut innermost = true;
        for frame in self.frames.iter().rev() {
            let Some(function) = self.heap.as_function(frame.function) else {
                continue;
            };
            let line = function.bytecode.line_at(frame.pc.saturating_sub(1));
            if innermost {
                error = error.at_line(line);
                innermost = false;
            }
            let context = match function.name {
                Some(name) => format!("[line {}] in {}()", line, self.heap.string_lossy(name)),
                None => format!("[line {}] in script", line),
            };
            error.call_stack.insert(0, context);
        }
        self.state.stack.clear();
        self.state.open_upvalues = None;
        self.frames.clear();
        error
    }

    // =========================================================================
    // Stack
    // =========================================================================

    fn push(&mut self, value: Value) -> Step<()> {
        if self.state.stack.len() >= self.config.max_stack {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        self.state.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Step<Value> {
        self.state
            .stack
            .pop()
            .ok_or(RuntimeErrorKind::Malformed("stack underflow"))
    }

    fn peek(&self, distance: usize) -> Step<Value> {
        let len = self.state.stack.len();
        if distance >= len {
            return Err(RuntimeErrorKind::Malformed("stack underflow"));
        }
        Ok(self.state.stack[len - 1 - distance])
    }

    /// Replaces the top `count` values with `value`.
    fn replace_top(&mut self, count: usize, value: Value) -> Step<()> {
        let len = self.state.stack.len();
        if count > len {
            return Err(RuntimeErrorKind::Malformed("stack underflow"));
        }
        self.state.stack.truncate(len - count);
        self.push(value)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    fn frame(&self) -> Step<&CallFrame> {
        self.frames
            .last()
            .ok_or(RuntimeErrorKind::Malformed("no active frame"))
    }

    fn read_byte(&mut self) -> Step<u8> {
        let Some(frame) = self.frames.last_mut() else {
            return Err(RuntimeErrorKind::Malformed("no active frame"));
        };
        let byte = self
            .heap
            .as_function(frame.function)
            .and_then(|f| f.bytecode.code.get(frame.pc))
            .copied();
        frame.pc += 1;
        byte.ok_or(RuntimeErrorKind::Malformed("unexpected end of code"))
    }

    fn read_u16(&mut self) -> Step<u16> {
        let hi = self.read_byte()?;
        let lo = self.read_byte()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_operand(&mut self, wide: bool) -> Step<usize> {
        if wide {
            Ok(self.read_u16()? as usize)
        } else {
            Ok(self.read_byte()? as usize)
        }
    }

    fn constant(&self, index: usize) -> Step<Value> {
        let frame = self.frame()?;
        self.heap
            .as_function(frame.function)
            .and_then(|f| f.bytecode.constants.get(index))
            .copied()
            .ok_or(RuntimeErrorKind::Malformed("constant index out of range"))
    }

    fn read_constant(&mut self, wide: bool) -> Step<Value> {
        let index = self.read_operand(wide)?;
        self.constant(index)
    }

    fn jump(&mut self, offset: u16, backward: bool) -> Step<()> {
        let Some(frame) = self.frames.last_mut() else {
            return Err(RuntimeErrorKind::Malformed("no active frame"));
        };
        if backward {
            frame.pc = frame
                .pc
                .checked_sub(offset as usize)
                .ok_or(RuntimeErrorKind::Malformed("jump before start of code"))?;
        } else {
            frame.pc += offset as usize;
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn step(&mut self) -> Step<Flow> {
        if self.config.trace_execution {
            self.trace_instruction();
        }

        let byte = self.read_byte()?;
        let op = OpCode::try_from(byte).map_err(|_| RuntimeErrorKind::UnknownOpcode(byte))?;

        match op {
            OpCode::Return => return self.op_return(),

            OpCode::Const | OpCode::ConstLong => {
                let value = self.read_constant(op == OpCode::ConstLong)?;
                self.push(value)?;
            }
            OpCode::Nihl => self.push(Value::Nihl)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,

            OpCode::Negate => {
                let n = self
                    .peek(0)?
                    .as_number()
                    .ok_or(RuntimeErrorKind::OperandNotNumber)?;
                self.replace_top(1, Value::Number(-n))?;
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Greater
            | OpCode::GreaterEqual => self.binary(op)?,

            OpCode::Not => {
                let value = self.peek(0)?;
                self.replace_top(1, Value::Bool(!value.is_truthy()))?;
            }
            OpCode::Xor => {
                let b = self.peek(0)?;
                let a = self.peek(1)?;
                self.replace_top(2, Value::Bool(a.is_truthy() != b.is_truthy()))?;
            }
            OpCode::Equal | OpCode::NotEqual => {
                let b = self.peek(0)?;
                let a = self.peek(1)?;
                let equal = a == b;
                self.replace_top(2, Value::Bool(equal == (op == OpCode::Equal)))?;
            }

            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Print => {
                let value = self.peek(0)?;
                let text = self.heap.display_value(value);
                writeln!(self.out, "{}", text)
                    .map_err(|e| RuntimeErrorKind::Output(e.to_string()))?;
            }
            OpCode::Concat => {
                let b = self.peek(0)?;
                let a = self.peek(1)?;
                let joined = self.heap.concatenate(a, b, &self.state);
                self.replace_top(2, joined)?;
            }

            OpCode::GlobalDecl | OpCode::GlobalDeclLong => {
                let name = self.read_constant(op == OpCode::GlobalDeclLong)?;
                let hash = self.heap.hash_value(name);
                let value = self.peek(0)?;
                self.state.globals.put(name, hash, value);
                self.pop()?;
            }
            OpCode::GlobalGet | OpCode::GlobalGetLong => {
                let name = self.read_constant(op == OpCode::GlobalGetLong)?;
                let hash = self.heap.hash_value(name);
                match self.state.globals.get(name, hash) {
                    Some(value) => self.push(value)?,
                    None => return Err(self.undefined_global(name)),
                }
            }
            OpCode::GlobalSet | OpCode::GlobalSetLong => {
                let name = self.read_constant(op == OpCode::GlobalSetLong)?;
                let hash = self.heap.hash_value(name);
                if !self.state.globals.contains(name, hash) {
                    return Err(self.undefined_global(name));
                }
                let value = self.peek(0)?;
                self.state.globals.put(name, hash, value);
            }

            OpCode::LocalGet | OpCode::LocalGetLong => {
                let slot = self.local_slot(op == OpCode::LocalGetLong)?;
                let value = self.state.stack[slot];
                self.push(value)?;
            }
            OpCode::LocalSet | OpCode::LocalSetLong => {
                let slot = self.local_slot(op == OpCode::LocalSetLong)?;
                let value = self.peek(0)?;
                self.state.stack[slot] = value;
            }

            OpCode::UpvalueGet | OpCode::UpvalueGetLong => {
                let upvalue = self.frame_upvalue(op == OpCode::UpvalueGetLong)?;
                let value = match self.upvalue_state(upvalue)? {
                    UpvalueState::Open(slot) => *self
                        .state
                        .stack
                        .get(slot)
                        .ok_or(RuntimeErrorKind::Malformed("upvalue slot out of range"))?,
                    UpvalueState::Closed(value) => value,
                };
                self.push(value)?;
            }
            OpCode::UpvalueSet | OpCode::UpvalueSetLong => {
                let upvalue = self.frame_upvalue(op == OpCode::UpvalueSetLong)?;
                let value = self.peek(0)?;
                match self.upvalue_state(upvalue)? {
                    UpvalueState::Open(slot) => {
                        let cell = self
                            .state
                            .stack
                            .get_mut(slot)
                            .ok_or(RuntimeErrorKind::Malformed("upvalue slot out of range"))?;
                        *cell = value;
                    }
                    UpvalueState::Closed(_) => {
                        if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                            u.state = UpvalueState::Closed(value);
                        }
                    }
                }
            }
            OpCode::CloseUpvalue => {
                let top = self.state.stack.len().saturating_sub(1);
                self.close_upvalues(top);
                self.pop()?;
            }

            OpCode::JumpIfFalse => {
                let offset = self.read_u16()?;
                if !self.peek(0)?.is_truthy() {
                    self.jump(offset, false)?;
                }
            }
            OpCode::JumpIfTrue => {
                let offset = self.read_u16()?;
                if self.peek(0)?.is_truthy() {
                    self.jump(offset, false)?;
                }
            }
            OpCode::Jump => {
                let offset = self.read_u16()?;
                self.jump(offset, false)?;
            }
            OpCode::JumpBack => {
                let offset = self.read_u16()?;
                self.jump(offset, true)?;
            }

            OpCode::Call => {
                let argc = self.read_byte()?;
                let callee = self.peek(argc as usize)?;
                self.call_value(callee, argc)?;
            }

            OpCode::Closure | OpCode::ClosureLong => {
                let function = self.read_constant(op == OpCode::ClosureLong)?;
                self.make_closure(function)?;
            }

            OpCode::Array | OpCode::ArrayLong => {
                let count = self.read_operand(op == OpCode::ArrayLong)?;
                let start = self.window_start(count)?;
                let values = self.state.stack[start..].to_vec();
                let array = self.heap.new_array(values, &self.state);
                self.replace_top(count, Value::Obj(array))?;
            }
            OpCode::Dict | OpCode::DictLong => {
                let pairs = self.read_operand(op == OpCode::DictLong)?;
                let start = self.window_start(pairs * 2)?;
                // pairs stay on the stack, rooted, while the dict fills
                let dict = self.heap.new_dict(&self.state);
                for i in 0..pairs {
                    let key = self.state.stack[start + 2 * i];
                    let value = self.state.stack[start + 2 * i + 1];
                    let hash = self.heap.hash_value(key);
                    if let Obj::Dict(d) = self.heap.get_mut(dict) {
                        d.map.put(key, hash, value);
                    }
                }
                self.replace_top(pairs * 2, Value::Obj(dict))?;
                self.heap.track_growth(dict, &self.state);
            }
            OpCode::IndexGet => {
                let index = self.peek(0)?;
                let target = self.peek(1)?;
                let result = self.heap.index_get(target, index, &self.state);
                self.replace_top(2, result)?;
            }
            OpCode::IndexSet => {
                let value = self.peek(0)?;
                let index = self.peek(1)?;
                let target = self.peek(2)?;
                let result = self.heap.index_set(target, index, value, &self.state);
                self.replace_top(3, result)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn binary(&mut self, op: OpCode) -> Step<()> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;
        let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
            return Err(RuntimeErrorKind::OperandsNotNumbers);
        };
        let result = match op {
            OpCode::Add => Value::Number(x + y),
            OpCode::Sub => Value::Number(x - y),
            OpCode::Mul => Value::Number(x * y),
            OpCode::Div => {
                if y == 0.0 {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                Value::Number(x / y)
            }
            OpCode::Mod => {
                if y == 0.0 {
                    return Err(RuntimeErrorKind::ModuloByZero);
                }
                let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) else {
                    return Err(RuntimeErrorKind::NonInteger);
                };
                // truncating, like C: -7 % 2 == -1
                Value::Number(x.wrapping_rem(y) as f64)
            }
            OpCode::Pow => Value::Number(x.powf(y)),
            OpCode::Less => Value::Bool(x < y),
            OpCode::LessEqual => Value::Bool(x <= y),
            OpCode::Greater => Value::Bool(x > y),
            OpCode::GreaterEqual => Value::Bool(x >= y),
            other => return Err(RuntimeErrorKind::UnknownOpcode(other.into())),
        };
        self.replace_top(2, result)
    }

    fn undefined_global(&self, name: Value) -> RuntimeErrorKind {
        let name = match name {
            Value::Obj(r) => self.heap.string_lossy(r).into_owned(),
            other => self.heap.display_value(other),
        };
        RuntimeErrorKind::UndefinedGlobal(name)
    }

    fn window_start(&self, count: usize) -> Step<usize> {
        self.state
            .stack
            .len()
            .checked_sub(count)
            .ok_or(RuntimeErrorKind::Malformed("stack underflow"))
    }

    fn local_slot(&mut self, wide: bool) -> Step<usize> {
        let index = self.read_operand(wide)?;
        let slot = self.frame()?.base + index;
        if slot >= self.state.stack.len() {
            return Err(RuntimeErrorKind::Malformed("local slot out of range"));
        }
        Ok(slot)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(&mut self, callee: Value, argc: u8) -> Step<()> {
        let Value::Obj(r) = callee else {
            return Err(RuntimeErrorKind::NotCallable);
        };
        let native = match self.heap.get(r) {
            Obj::Closure(_) => None,
            Obj::Native(native) => Some((native.arity, native.function)),
            _ => return Err(RuntimeErrorKind::NotCallable),
        };
        match native {
            None => self.call_closure(r, argc),
            Some((arity, function)) => {
                if argc != arity {
                    return Err(RuntimeErrorKind::Arity {
                        expected: arity,
                        got: argc,
                    });
                }
                let base = self.state.stack.len() - argc as usize;
                let args = self.state.stack[base..].to_vec();
                let result = function(self, &args);
                self.replace_top(argc as usize + 1, result)
            }
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Step<()> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => return Err(RuntimeErrorKind::NotCallable),
        };
        let arity = self
            .heap
            .as_function(function)
            .map(|f| f.arity)
            .ok_or(RuntimeErrorKind::Malformed("closure without function"))?;
        if argc != arity {
            return Err(RuntimeErrorKind::Arity {
                expected: arity,
                got: argc,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            function,
            pc: 0,
            base: self.state.stack.len() - argc as usize,
        });
        Ok(())
    }

    fn op_return(&mut self) -> Step<Flow> {
        let result = self.pop()?;
        let Some(frame) = self.frames.pop() else {
            return Err(RuntimeErrorKind::Malformed("no active frame"));
        };
        self.close_upvalues(frame.base);
        self.state.stack.truncate(frame.base.saturating_sub(1));

        if self.frames.is_empty() {
            if !result.is_nihl() {
                let text = self.heap.display_value(result);
                writeln!(self.out, "{}", text)
                    .map_err(|e| RuntimeErrorKind::Output(e.to_string()))?;
            }
            return Ok(Flow::Finished(result));
        }
        self.push(result)?;
        Ok(Flow::Continue)
    }

    // =========================================================================
    // Closures
    // =========================================================================

    fn make_closure(&mut self, function: Value) -> Step<()> {
        let Some(function) = function.as_obj().filter(|&r| self.heap.as_function(r).is_some())
        else {
            return Err(RuntimeErrorKind::Malformed("closure operand is not a function"));
        };
        let count = self.heap.as_function(function).map_or(0, |f| f.upvalue_count);
        let frame = *self.frame()?;

        // Captured upvalues stay rooted through the open list or the
        // enclosing closure until the new closure owns them.
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let captures_local = self.read_byte()? != 0;
            let index = self.read_byte()? as usize;
            let upvalue = if captures_local {
                let slot = frame.base + index;
                if slot >= self.state.stack.len() {
                    return Err(RuntimeErrorKind::Malformed("upvalue slot out of range"));
                }
                self.capture_upvalue(slot)
            } else {
                match self.heap.get(frame.closure) {
                    Obj::Closure(enclosing) => *enclosing
                        .upvalues
                        .get(index)
                        .ok_or(RuntimeErrorKind::Malformed("upvalue index out of range"))?,
                    _ => return Err(RuntimeErrorKind::Malformed("frame without closure")),
                }
            };
            upvalues.push(upvalue);
        }

        let closure = self.heap.new_closure(function, &self.state);
        if let Obj::Closure(c) = self.heap.get_mut(closure) {
            c.upvalues = upvalues;
        }
        self.push(Value::Obj(closure))
    }

    fn upvalue_state(&self, upvalue: ObjRef) -> Step<UpvalueState> {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => Ok(u.state),
            _ => Err(RuntimeErrorKind::Malformed("not an upvalue")),
        }
    }

    fn upvalue_link(&self, upvalue: ObjRef) -> (Option<usize>, Option<ObjRef>) {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => (u.open_slot(), u.next),
            _ => (None, None),
        }
    }

    fn frame_upvalue(&mut self, wide: bool) -> Step<ObjRef> {
        let index = self.read_operand(wide)?;
        let closure = self.frame()?.closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c
                .upvalues
                .get(index)
                .copied()
                .ok_or(RuntimeErrorKind::Malformed("upvalue index out of range")),
            _ => Err(RuntimeErrorKind::Malformed("frame without closure")),
        }
    }

    /// Returns the open upvalue for `slot`, creating and linking one if no
    /// closure captured it yet.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.state.open_upvalues;
        while let Some(upvalue) = current {
            let (open, next) = self.upvalue_link(upvalue);
            match open {
                Some(s) if s > slot => {
                    prev = Some(upvalue);
                    current = next;
                }
                Some(s) if s == slot => return upvalue,
                _ => break,
            }
        }

        let created = self.heap.new_upvalue(slot, current, &self.state);
        match prev {
            None => self.state.open_upvalues = Some(created),
            Some(prev) => {
                if let Obj::Upvalue(u) = self.heap.get_mut(prev) {
                    u.next = Some(created);
                }
            }
        }
        created
    }

    /// Closes every open upvalue at or above `from`.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(upvalue) = self.state.open_upvalues {
            let (open, next) = self.upvalue_link(upvalue);
            let Some(slot) = open.filter(|&s| s >= from) else {
                break;
            };
            let value = self.state.stack.get(slot).copied().unwrap_or(Value::Nihl);
            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                u.state = UpvalueState::Closed(value);
                u.next = None;
            }
            self.state.open_upvalues = next;
        }
    }

    fn trace_instruction(&self) {
        let Some(frame) = self.frames.last() else { return };
        let Some(function) = self.heap.as_function(frame.function) else {
            return;
        };
        let (text, _) = format_instruction(&*self.heap, &function.bytecode, frame.pc);
        let stack = self
            .state
            .stack
            .iter()
            .map(|&v| self.heap.display_value(v))
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::trace!(target: "yaspl::vm", "{:<40} [{}]", text, stack);
    }
}

/// Runs `function` with the default configuration, reporting any runtime
/// error on stderr.
pub fn vm_execute(heap: &mut Collector, function: ObjRef) -> RuntimeResult {
    vm_execute_with(heap, function, VmConfig::default())
}

pub fn vm_execute_with(heap: &mut Collector, function: ObjRef, config: VmConfig) -> RuntimeResult {
    let mut vm = Vm::with_config(heap, config);
    let result = vm.interpret(function);
    if let Err(e) = &result {
        eprintln!("{}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::bytecode::disasm::disassemble;
    use crate::bytecode::{Bytecode, OpCode};
    use crate::runtime::heap::{GcConfig, NoRoots};
    use pretty_assertions::assert_eq;

    // ============================================================
    // Test Helpers
    // ============================================================

    /// Builds a script function from hand-assembled bytecode.
    fn script(heap: &mut Collector, build: impl FnOnce(&mut Collector, &mut Bytecode)) -> ObjRef {
        let function = heap.new_function(None, 0, &NoRoots);
        heap.push_safe(Value::Obj(function));
        let mut bc = Bytecode::new();
        build(heap, &mut bc);
        if let Some(f) = heap.as_function_mut(function) {
            f.bytecode = bc;
        }
        heap.pop_safe();
        function
    }

    /// Runs a function and returns its result and printed output.
    fn run_function(heap: &mut Collector, function: ObjRef) -> (RuntimeResult, String) {
        let mut out = Vec::new();
        let result = {
            let mut vm = Vm::new(heap).with_output(&mut out);
            vm.interpret(function)
        };
        (result, String::from_utf8(out).expect("utf8 output"))
    }

    /// Compiles and runs source, returning result and output.
    fn run_source_with(source: &str, gc: GcConfig) -> (RuntimeResult, String) {
        let mut heap = Collector::with_config(gc);
        let function = compile(source, &mut heap).expect("program should compile");
        run_function(&mut heap, function)
    }

    fn run_source(source: &str) -> (RuntimeResult, String) {
        run_source_with(source, GcConfig::default())
    }

    /// Asserts a program prints exactly `expected`.
    fn assert_output(source: &str, expected: &str) {
        let (result, out) = run_source(source);
        if let Err(e) = result {
            panic!("expected success, got: {}", e);
        }
        assert_eq!(out, expected);
    }

    /// Asserts a program aborts with an error containing the substring.
    fn assert_error(source: &str, error_contains: &str) {
        match run_source(source).0 {
            Ok(value) => panic!(
                "expected error containing '{}', got value: {:?}",
                error_contains, value
            ),
            Err(e) => assert!(
                e.message().contains(error_contains),
                "expected error containing '{}', got: {}",
                error_contains,
                e
            ),
        }
    }

    // ============================================================
    // Hand-assembled bytecode
    // ============================================================

    #[test]
    fn test_scenario_add_prints_sum() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |_, bc| {
            bc.write_constant(OpCode::Const, OpCode::ConstLong, Value::Number(1.2), 1)
                .unwrap();
            bc.write_constant(OpCode::Const, OpCode::ConstLong, Value::Number(5.2), 1)
                .unwrap();
            bc.write_op(OpCode::Add, 1);
            bc.write_op(OpCode::Return, 1);
        });

        let (result, out) = run_function(&mut heap, function);

        assert_eq!(result, Ok(Value::Number(6.4)));
        assert_eq!(out, "6.4\n");
    }

    #[test]
    fn test_scenario_modulo_result() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |_, bc| {
            bc.write_constant(OpCode::Const, OpCode::ConstLong, Value::Number(10.0), 1)
                .unwrap();
            bc.write_constant(OpCode::Const, OpCode::ConstLong, Value::Number(5.0), 1)
                .unwrap();
            bc.write_op(OpCode::Mod, 1);
            bc.write_op(OpCode::Return, 1);
        });

        let (result, out) = run_function(&mut heap, function);

        assert_eq!(result, Ok(Value::Number(0.0)));
        assert_eq!(out, "0\n");
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |_, bc| {
            bc.write_byte(250, 4);
        });

        let (result, _) = run_function(&mut heap, function);
        let err = result.expect_err("should fail");
        assert_eq!(err.kind, RuntimeErrorKind::UnknownOpcode(250));
        assert_eq!(err.line, 4);
    }

    #[test]
    fn test_long_constant_operand() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |_, bc| {
            for i in 0..300 {
                bc.add_constant(Value::Number(i as f64)).unwrap();
            }
            bc.write_variable(OpCode::Const, OpCode::ConstLong, 299, 1);
            bc.write_op(OpCode::Return, 1);
        });

        let (result, _) = run_function(&mut heap, function);
        assert_eq!(result, Ok(Value::Number(299.0)));
    }

    #[test]
    fn test_capture_past_stack_top_is_malformed() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |heap, bc| {
            let inner = heap.new_function(Some("inner"), 0, &NoRoots);
            if let Some(f) = heap.as_function_mut(inner) {
                f.upvalue_count = 1;
                f.bytecode.write_variable(OpCode::UpvalueGet, OpCode::UpvalueGetLong, 0, 2);
                f.bytecode.write_op(OpCode::Return, 2);
            }
            let index = bc.add_constant(Value::Obj(inner)).unwrap();
            bc.write_variable(OpCode::Closure, OpCode::ClosureLong, index, 1);
            // captures local 50 of a frame holding one value
            bc.write_byte(1, 1);
            bc.write_byte(50, 1);
            bc.write_op(OpCode::Call, 1);
            bc.write_byte(0, 1);
            bc.write_op(OpCode::Return, 1);
        });

        let (result, _) = run_function(&mut heap, function);
        let err = result.expect_err("should fail");
        assert_eq!(err.kind, RuntimeErrorKind::Malformed("upvalue slot out of range"));
        assert_eq!(err.line, 1);
    }

    /// Compiles `source`, checks the script's code tree uses `mnemonic`,
    /// then runs it.
    fn assert_long_form(source: &str, mnemonic: &str, expected: &str) {
        let mut heap = Collector::new();
        let function = compile(source, &mut heap).expect("program should compile");
        let listing = disassemble(&heap, function);
        assert!(
            listing.contains(mnemonic),
            "expected {} in:\n{}",
            mnemonic,
            listing
        );

        let (result, out) = run_function(&mut heap, function);
        if let Err(e) = result {
            panic!("expected success, got: {}", e);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn test_long_local_operand() {
        let mut source = String::from("func f()\n");
        for i in 0..300 {
            source.push_str(&format!("    let v{} = {}\n", i, i));
        }
        source.push_str("    ret v299\nprint f()\n");
        assert_long_form(&source, "LOCAL_GET_LONG", "299\n");
    }

    #[test]
    fn test_long_array_operand() {
        let elements: Vec<String> = (0..300).map(|i| i.to_string()).collect();
        let source = format!("let a = [{}]\nprint [len(a), a[299]]\n", elements.join(", "));
        assert_long_form(&source, "ARRAY_LONG", "[300, 299]\n");
    }

    #[test]
    fn test_long_dict_operand() {
        let entries: Vec<String> = (0..300).map(|i| format!("{} => {}", i, i * 2)).collect();
        let source = format!("let d = {{{}}}\nprint [len(d), d[299]]\n", entries.join(", "));
        assert_long_form(&source, "DICT_LONG", "[300, 598]\n");
    }

    #[test]
    fn test_dict_growth_drives_collection() {
        let source = "\
let i = 0
while i < 20
    let d = {}
    let j = 0
    while j < 2000
        d[j] = j
        j = j + 1
    i = i + 1
print i
";
        let mut heap = Collector::new();
        let function = compile(source, &mut heap).expect("program should compile");
        let (result, out) = run_function(&mut heap, function);

        assert_eq!(result, Ok(Value::Nihl));
        assert_eq!(out, "20\n");
        assert!(heap.stats().collections > 0);
    }

    #[test]
    fn test_nihl_result_is_not_printed() {
        let mut heap = Collector::new();
        let function = script(&mut heap, |_, bc| {
            bc.write_op(OpCode::Nihl, 1);
            bc.write_op(OpCode::Return, 1);
        });

        let (result, out) = run_function(&mut heap, function);
        assert_eq!(result, Ok(Value::Nihl));
        assert_eq!(out, "");
    }

    // ============================================================
    // Arithmetic
    // ============================================================

    #[test]
    fn test_arithmetic_edges() {
        assert_output("print 7 % 2\n", "1\n");
        assert_output("print 2 ^ 10\n", "1024\n");
        assert_output("print -7 % 2\n", "-1\n");
        assert_output("print 10 / 4\n", "2.5\n");
        assert_output("print 1 + 2 * 3\n", "7\n");
    }

    #[test]
    fn test_division_by_zero() {
        assert_error("print 5 / 0\n", "division by zero");
    }

    #[test]
    fn test_modulo_by_zero() {
        assert_error("print 5 % 0\n", "modulo by zero");
    }

    #[test]
    fn test_modulo_requires_integers() {
        assert_error("print 5.5 % 2\n", "only integer allowed");
    }

    #[test]
    fn test_arithmetic_type_error() {
        assert_error("print 1 + true\n", "operands must be numbers");
        assert_error("print -nihl\n", "operand must be a number");
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_output("print 1 < 2\n", "true\n");
        assert_output("print 2 <= 1\n", "false\n");
        assert_output("print 1 == 1\n", "true\n");
        assert_output("print nihl != false\n", "true\n");
        assert_output("print true xor true\n", "false\n");
        assert_output("print !0\n", "true\n");
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        // undefined global on the right is never evaluated
        assert_output("print false and missing\n", "false\n");
        assert_output("print 1 or missing\n", "1\n");
    }

    // ============================================================
    // Variables
    // ============================================================

    #[test]
    fn test_globals() {
        assert_output("let a = 1\na = a + 41\nprint a\n", "42\n");
    }

    #[test]
    fn test_undefined_global_is_fatal() {
        assert_error("print nope\n", "undefined global variable 'nope'");
        assert_error("nope = 3\n", "undefined global variable 'nope'");
    }

    #[test]
    fn test_error_carries_line() {
        let (result, _) = run_source("let a = 1\n\nprint a / 0\n");
        let err = result.expect_err("should fail");
        assert_eq!(err.line, 3);
        assert_eq!(err.call_stack, vec!["[line 3] in script".to_string()]);
    }

    #[test]
    fn test_locals_in_blocks() {
        let source = "\
if true
    let a = 1
    let b = 2
    print a + b
";
        assert_output(source, "3\n");
    }

    #[test]
    fn test_while_loop() {
        let source = "\
let i = 0
let sum = 0
while i < 5
    sum = sum + i
    i = i + 1
print sum
";
        assert_output(source, "10\n");
    }

    #[test]
    fn test_break_and_continue() {
        let source = "\
let i = 0
while true
    i = i + 1
    if i == 2
        continue
    if i > 4
        break
    print i
";
        assert_output(source, "1\n3\n4\n");
    }

    // ============================================================
    // Functions and closures
    // ============================================================

    #[test]
    fn test_function_call() {
        let source = "\
func add(a, b)
    ret a + b
print add(2, 3)
";
        assert_output(source, "5\n");
    }

    #[test]
    fn test_scenario_closure_outlives_frame() {
        let source = "\
func outer()
    let x = 10
    func inner()
        ret x
    ret inner
let f = outer()
print f()
";
        assert_output(source, "10\n");
    }

    #[test]
    fn test_scenario_arity_mismatch() {
        let source = "\
func two(a, b)
    ret a
two(1)
";
        assert_error(source, "expected 2 arguments, got 1");
    }

    #[test]
    fn test_upvalues_are_shared_while_open() {
        let source = "\
func make()
    let n = 0
    func inc()
        n = n + 1
        ret n
    func get()
        ret n
    inc()
    inc()
    ret [inc, get]
let pair = make()
pair[0]()
print pair[1]()
";
        assert_output(source, "3\n");
    }

    #[test]
    fn test_closed_upvalues_are_independent_per_call() {
        let source = "\
func counter()
    let n = 0
    func inc()
        n = n + 1
        ret n
    ret inc
let a = counter()
let b = counter()
a()
a()
print a()
print b()
";
        assert_output(source, "3\n1\n");
    }

    #[test]
    fn test_nested_upvalue_through_middle_function() {
        let source = "\
func outer()
    let x = 1
    func middle()
        func inner()
            ret x + 1
        ret inner
    ret middle()
print outer()()
";
        assert_output(source, "2\n");
    }

    #[test]
    fn test_recursion() {
        let source = "\
func fib(n)
    if n < 2
        ret n
    ret fib(n - 1) + fib(n - 2)
print fib(15)
";
        assert_output(source, "610\n");
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let source = "\
func down(n)
    ret down(n + 1)
down(0)
";
        assert_error(source, "stack overflow");
    }

    #[test]
    fn test_calling_non_function() {
        assert_error("let a = 3\na()\n", "can only call functions");
    }

    #[test]
    fn test_call_stack_lists_frames() {
        let source = "\
func inner()
    ret 1 / 0
func outer()
    ret inner()
outer()
";
        let (result, _) = run_source(source);
        let err = result.expect_err("should fail");
        assert_eq!(
            err.call_stack,
            vec![
                "[line 5] in script".to_string(),
                "[line 4] in outer()".to_string(),
                "[line 2] in inner()".to_string(),
            ]
        );
    }

    #[test]
    fn test_upvalue_dedup_same_object() {
        let mut heap = Collector::new();
        let source = "\
func make()
    let shared = 0
    func a()
        ret shared
    func b()
        ret shared
    ret [a, b]
let pair = make()
";
        let function = compile(source, &mut heap).expect("compiles");
        let mut sink = Vec::new();
        let mut vm = Vm::new(&mut heap).with_output(&mut sink);
        vm.interpret(function).expect("runs");

        let Some(Value::Obj(pair)) = vm.global("pair") else {
            panic!("pair not defined");
        };
        let Obj::Array(array) = vm.obj(pair) else {
            panic!("pair is not an array");
        };
        let upvalue_of = |v: Value| match v.as_obj().map(|r| vm.obj(r)) {
            Some(Obj::Closure(c)) => c.upvalues[0],
            _ => panic!("not a closure"),
        };
        assert_eq!(upvalue_of(array.values[0]), upvalue_of(array.values[1]));
    }

    // ============================================================
    // Aggregates
    // ============================================================

    #[test]
    fn test_array_literal_and_indexing() {
        assert_output("let a = [1, 2, 3]\nprint a[1]\n", "2\n");
        assert_output("let a = [1, 2]\na[0] = 5\nprint a\n", "[5, 2]\n");
    }

    #[test]
    fn test_index_errors_are_values() {
        let source = "\
let a = [1]
let e = a[5]
print iserror(e)
print e
";
        assert_output(source, "true\narray index out of bounds\n");
    }

    #[test]
    fn test_dict_literal() {
        assert_output("let d = {\"k\" => 1}\nprint d[\"k\"]\n", "1\n");
        assert_output("let d = {}\nprint d[\"missing\"]\n", "nihl\n");
    }

    #[test]
    fn test_concatenation() {
        assert_output("print \"ab\" ++ \"cd\"\n", "abcd\n");
        assert_output("print [1] ++ [2]\n", "[1, 2]\n");
        assert_output("print 1 ++ 2\n", "cannot concatenate non objects\n");
    }

    #[test]
    fn test_string_equality_by_interning() {
        assert_output("print \"a\" ++ \"b\" == \"ab\"\n", "true\n");
    }

    // ============================================================
    // GC integration
    // ============================================================

    #[test]
    fn test_program_survives_stress_collection() {
        let source = "\
func make(n)
    let items = []
    let i = 0
    while i < n
        items = items ++ [tostr(i) ++ \"!\"]
        i = i + 1
    func last()
        ret items[n - 1]
    ret last
let f = make(20)
let d = {\"f\" => f, \"e\" => error(\"bad\", [1, 2])}
print f()
print d[\"e\"]
";
        let (result, out) = run_source_with(
            source,
            GcConfig {
                stress: true,
                ..GcConfig::default()
            },
        );
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(out, "19!\nbad ([1, 2])\n");
    }

    #[test]
    fn test_collect_native_frees_garbage() {
        let source = "\
let i = 0
while i < 10
    [i, i]
    i = i + 1
print collect() > 0
";
        assert_output(source, "true\n");
    }

    #[test]
    fn test_runtime_error_resets_stack() {
        let mut heap = Collector::new();
        let function = compile("print 1 / 0\n", &mut heap).expect("compiles");
        let mut sink = Vec::new();
        let mut vm = Vm::new(&mut heap).with_output(&mut sink);
        assert!(vm.interpret(function).is_err());
        assert!(vm.stack().is_empty());
    }
}
