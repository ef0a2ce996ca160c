use std::fmt::Write;

use crate::bytecode::ir::Bytecode;
use crate::bytecode::op::{OpCode, Operand};
use crate::lang::object::ObjRef;
use crate::lang::table::Table;
use crate::lang::value::Value;
use crate::runtime::heap::Collector;

// =============================================================================
// Single instructions
// =============================================================================

/// Renders the instruction at `offset` and returns it with the offset of
/// the next instruction. Never panics on truncated or unknown code.
pub fn format_instruction(heap: &Collector, bc: &Bytecode, offset: usize) -> (String, usize) {
    let mut out = format!("line = {}: ", bc.line_at(offset));

    let Some(&byte) = bc.code.get(offset) else {
        out.push_str("<end of code>");
        return (out, offset + 1);
    };
    let Ok(op) = OpCode::try_from(byte) else {
        let _ = write!(out, "unknown opcode {}", byte);
        return (out, offset + 1);
    };
    out.push_str(&op.mnemonic());

    let operand = |at: usize, wide: bool| -> Option<usize> {
        if wide {
            Some(u16::from_be_bytes([*bc.code.get(at)?, *bc.code.get(at + 1)?]) as usize)
        } else {
            bc.code.get(at).map(|&b| b as usize)
        }
    };
    let width = |wide: bool| if wide { 2 } else { 1 };

    let next = match op.operand() {
        Operand::None => offset + 1,
        Operand::Constant { wide } => {
            write_constant(&mut out, heap, bc, operand(offset + 1, wide));
            offset + 1 + width(wide)
        }
        Operand::Argument { wide } => {
            match operand(offset + 1, wide) {
                Some(arg) => {
                    let _ = write!(out, " arg:[{}]", arg);
                }
                None => out.push_str(" <truncated>"),
            }
            offset + 1 + width(wide)
        }
        Operand::Jump { backward } => {
            let after = offset + 3;
            match operand(offset + 1, true) {
                Some(distance) if backward => {
                    let _ = write!(out, " -{} -> {:04}", distance, after.saturating_sub(distance));
                }
                Some(distance) => {
                    let _ = write!(out, " +{} -> {:04}", distance, after + distance);
                }
                None => out.push_str(" <truncated>"),
            }
            after
        }
        Operand::Closure { wide } => {
            let index = operand(offset + 1, wide);
            write_constant(&mut out, heap, bc, index);
            let mut next = offset + 1 + width(wide);

            let captured = index
                .and_then(|i| bc.constants.get(i))
                .and_then(|c| c.as_obj())
                .and_then(|r| heap.as_function(r))
                .map_or(0, |f| f.upvalue_count);
            for _ in 0..captured {
                let (Some(&local), Some(&index)) = (bc.code.get(next), bc.code.get(next + 1))
                else {
                    out.push_str("\n    <truncated>");
                    break;
                };
                let owner = if local != 0 { "ownedHere" } else { "ownedAbove" };
                let _ = write!(out, "\n    index -> {} [{}]", index, owner);
                next += 2;
            }
            next
        }
    };
    (out, next)
}

fn write_constant(out: &mut String, heap: &Collector, bc: &Bytecode, index: Option<usize>) {
    match index {
        Some(i) => match bc.constants.get(i) {
            Some(&value) => {
                let _ = write!(out, " [{}] '{}'", i, heap.display(value));
            }
            None => {
                let _ = write!(out, " [{}] <missing constant>", i);
            }
        },
        None => out.push_str(" <truncated>"),
    }
}

pub fn print_instruction(heap: &Collector, bc: &Bytecode, offset: usize) -> usize {
    let (text, next) = format_instruction(heap, bc, offset);
    println!("{:04} {}", offset, text);
    next
}

// =============================================================================
// Whole functions
// =============================================================================

/// Disassembles `function`, then every function in its constant pool,
/// depth first.
pub fn disassemble(heap: &Collector, function: ObjRef) -> String {
    let mut out = String::new();
    let mut seen = Vec::new();
    disassemble_into(&mut out, heap, function, &mut seen);
    out
}

fn disassemble_into(out: &mut String, heap: &Collector, function: ObjRef, seen: &mut Vec<ObjRef>) {
    if seen.contains(&function) {
        return;
    }
    seen.push(function);

    let Some(f) = heap.as_function(function) else {
        return;
    };
    let name = match f.name {
        Some(name) => heap.string_lossy(name).into_owned(),
        None => "script".to_string(),
    };
    let _ = writeln!(out, "chunk => {}", name);

    let bc = &f.bytecode;
    let mut offset = 0;
    while offset < bc.len() {
        let (text, next) = format_instruction(heap, bc, offset);
        let _ = writeln!(out, "{:04} {}", offset, text);
        offset = next;
    }

    for constant in &bc.constants {
        if let Some(nested) = constant.as_obj().filter(|&r| heap.as_function(r).is_some()) {
            out.push('\n');
            disassemble_into(out, heap, nested, seen);
        }
    }
}

pub fn print_bytecode(heap: &Collector, function: ObjRef) {
    print!("{}", disassemble(heap, function));
}

// =============================================================================
// Tables
// =============================================================================

/// One `key => value` line per entry, sorted for stable output.
pub fn format_map(heap: &Collector, table: &Table<Value>) -> String {
    let mut lines: Vec<String> = table
        .iter()
        .map(|(key, value)| format!("{} => {}", heap.display(key), heap.display(*value)))
        .collect();
    lines.sort();

    let mut out = format!("map ({} entries)\n", table.len());
    for line in lines {
        out.push_str("  ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn print_map(heap: &Collector, table: &Table<Value>) {
    print!("{}", format_map(heap, table));
}
