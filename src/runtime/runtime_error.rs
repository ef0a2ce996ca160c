use thiserror::Error;

/// Why a run was aborted. These never become language values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: u8, got: u8 },

    #[error("only integer allowed")]
    NonInteger,

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("undefined global variable '{0}'")]
    UndefinedGlobal(String),

    #[error("stack overflow")]
    StackOverflow,

    #[error("can only call functions")]
    NotCallable,

    #[error("operands must be numbers")]
    OperandsNotNumbers,

    #[error("operand must be a number")]
    OperandNotNumber,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("malformed bytecode: {0}")]
    Malformed(&'static str),

    #[error("output failed: {0}")]
    Output(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// Source line of the failing instruction, 0 when unknown.
    pub line: u32,
    /// Outermost frame first.
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: ")?;
        if self.line > 0 {
            write!(f, "[line {}] ", self.line)?;
        }
        write!(f, "{}", self.kind)?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        RuntimeError {
            kind,
            line: 0,
            call_stack: Vec::new(),
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// Message without the location prefix.
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}
