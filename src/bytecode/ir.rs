use serde::{Deserialize, Serialize};

use crate::bytecode::op::OpCode;
use crate::lang::table::grow_capacity;
use crate::lang::value::Value;

/// One run of consecutive bytes emitted for the same source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRun {
    pub line: u32,
    pub count: u32,
}

/// Run-length encoded byte-offset → source-line table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: Vec<LineRun>) -> Self {
        LineTable { runs }
    }

    pub fn runs(&self) -> &[LineRun] {
        &self.runs
    }

    pub fn push(&mut self, line: u32) {
        match self.runs.last_mut() {
            Some(run) if run.line == line => run.count += 1,
            _ => {
                if self.runs.len() == self.runs.capacity() {
                    self.runs.reserve_exact(grow_capacity(self.runs.capacity()) - self.runs.len());
                }
                self.runs.push(LineRun { line, count: 1 });
            }
        }
    }

    /// Source line of the byte at `offset`, or 0 past the end.
    pub fn line_at(&self, offset: usize) -> u32 {
        let mut covered = 0usize;
        for run in &self.runs {
            covered += run.count as usize;
            if covered > offset {
                return run.line;
            }
        }
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    #[error("too many constants in one function")]
    TooManyConstants,

    #[error("jump too big")]
    JumpTooBig,

    #[error("loop body too big")]
    LoopTooBig,
}

/// A function's compiled code: instruction bytes, constant pool, line table.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: LineTable,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Appends one byte and returns its offset.
    pub fn write_byte(&mut self, byte: u8, line: u32) -> usize {
        if self.code.len() == self.code.capacity() {
            self.code.reserve_exact(grow_capacity(self.code.capacity()) - self.code.len());
        }
        self.code.push(byte);
        self.lines.push(line);
        self.code.len() - 1
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) -> usize {
        self.write_byte(op.into(), line)
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        let [hi, lo] = value.to_be_bytes();
        self.write_byte(hi, line);
        self.write_byte(lo, line);
    }

    /// Emits `short` with a one-byte operand when it fits, `long` with a
    /// two-byte operand otherwise.
    pub fn write_variable(&mut self, short: OpCode, long: OpCode, argument: u16, line: u32) {
        if argument > u8::MAX as u16 {
            self.write_op(long, line);
            self.write_u16(argument, line);
        } else {
            self.write_op(short, line);
            self.write_byte(argument as u8, line);
        }
    }

    /// Appends to the constant pool and returns the new index.
    pub fn add_constant(&mut self, value: Value) -> Result<u16, BytecodeError> {
        if self.constants.len() > u16::MAX as usize {
            return Err(BytecodeError::TooManyConstants);
        }
        if self.constants.len() == self.constants.capacity() {
            self.constants
                .reserve_exact(grow_capacity(self.constants.capacity()) - self.constants.len());
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u16)
    }

    /// Adds `value` to the pool and emits the instruction addressing it.
    pub fn write_constant(
        &mut self,
        short: OpCode,
        long: OpCode,
        value: Value,
        line: u32,
    ) -> Result<u16, BytecodeError> {
        let index = self.add_constant(value)?;
        self.write_variable(short, long, index, line);
        Ok(index)
    }

    /// Emits a forward jump with a placeholder operand; returns the operand
    /// offset for [`Bytecode::patch_jump`].
    pub fn write_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.write_op(op, line);
        self.write_u16(u16::MAX, line);
        self.code.len() - 2
    }

    /// Points the jump whose operand is at `operand` to the current end.
    pub fn patch_jump(&mut self, operand: usize) -> Result<(), BytecodeError> {
        let distance = self.code.len() - (operand + 2);
        let distance = u16::try_from(distance).map_err(|_| BytecodeError::JumpTooBig)?;
        let [hi, lo] = distance.to_be_bytes();
        self.code[operand] = hi;
        self.code[operand + 1] = lo;
        Ok(())
    }

    /// Emits a backward jump to `loop_start`.
    pub fn write_loop(&mut self, loop_start: usize, line: u32) -> Result<(), BytecodeError> {
        self.write_op(OpCode::JumpBack, line);
        let distance = self.code.len() + 2 - loop_start;
        let distance = u16::try_from(distance).map_err(|_| BytecodeError::LoopTooBig)?;
        self.write_u16(distance, line);
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.line_at(offset)
    }
}
