use num_enum::{IntoPrimitive, TryFromPrimitive};

// =============================================================================
// OPCODES
// =============================================================================
//
// Operations taking an index or count come in pairs: the short form carries a
// one-byte operand, the `*Long` form a two-byte big-endian operand. Jumps
// always carry two bytes, measured from the end of the operand.

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Return,

    // constants
    Const,
    ConstLong,
    Nihl,
    True,
    False,

    // arithmetic
    Negate,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,

    // logic & comparison
    Not,
    Xor,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,

    // stack
    Pop,
    Print,
    Concat,

    // variables
    GlobalDecl,
    GlobalDeclLong,
    GlobalGet,
    GlobalGetLong,
    GlobalSet,
    GlobalSetLong,
    LocalGet,
    LocalGetLong,
    LocalSet,
    LocalSetLong,
    UpvalueGet,
    UpvalueGetLong,
    UpvalueSet,
    UpvalueSetLong,
    CloseUpvalue,

    // control flow
    JumpIfFalse,
    JumpIfTrue,
    Jump,
    JumpBack,
    Call,

    // closures
    Closure,
    ClosureLong,

    // aggregates & indexing
    Array,
    ArrayLong,
    Dict,
    DictLong,
    IndexGet,
    IndexSet,
}

/// Operand layout of an instruction, used by the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Constant-pool index, 1 or 2 bytes.
    Constant { wide: bool },
    /// Slot, count or argument, 1 or 2 bytes.
    Argument { wide: bool },
    /// Two-byte jump offset; `backward` for loops.
    Jump { backward: bool },
    /// Function constant followed by two bytes per captured upvalue.
    Closure { wide: bool },
}

impl OpCode {
    pub fn operand(self) -> Operand {
        use OpCode::*;
        match self {
            Const | GlobalDecl | GlobalGet | GlobalSet => Operand::Constant { wide: false },
            ConstLong | GlobalDeclLong | GlobalGetLong | GlobalSetLong => {
                Operand::Constant { wide: true }
            }
            LocalGet | LocalSet | UpvalueGet | UpvalueSet | Call | Array | Dict => {
                Operand::Argument { wide: false }
            }
            LocalGetLong | LocalSetLong | UpvalueGetLong | UpvalueSetLong | ArrayLong
            | DictLong => Operand::Argument { wide: true },
            JumpIfFalse | JumpIfTrue | Jump => Operand::Jump { backward: false },
            JumpBack => Operand::Jump { backward: true },
            Closure => Operand::Closure { wide: false },
            ClosureLong => Operand::Closure { wide: true },
            _ => Operand::None,
        }
    }

    /// Upper-case mnemonic, e.g. `GLOBAL_GET_LONG`.
    pub fn mnemonic(self) -> String {
        let name = format!("{:?}", self);
        let mut out = String::with_capacity(name.len() + 4);
        for (i, ch) in name.chars().enumerate() {
            if ch.is_ascii_uppercase() && i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_uppercase());
        }
        out
    }
}
