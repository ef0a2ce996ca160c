//! Single-pass compiler from yaspl source to bytecode.
//!
//! There is no syntax tree: the recursive-descent parser emits instructions
//! as it recognizes each production, straight into the function being
//! built. Every function under construction is a live heap object pinned on
//! the collector's safe stack, and its constant pool is traced through
//! [`Functions`] until it is installed.

use std::mem;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::{Bytecode, BytecodeError};
use crate::bytecode::op::OpCode;
use crate::frontend::lexer::{Lexer, Span, Spanned};
use crate::frontend::token::Token;
use crate::lang::object::ObjRef;
use crate::lang::value::Value;
use crate::runtime::heap::{Collector, NoRoots, RootSet};

const MAX_PARAMETERS: usize = u8::MAX as usize;
const MAX_ARGUMENTS: usize = u8::MAX as usize;
const MAX_LOCALS: usize = u16::MAX as usize;
const MAX_UPVALUES: usize = u8::MAX as usize + 1;
const MAX_ELEMENTS: usize = u16::MAX as usize;

type CompileResult<T> = Result<T, CompileError>;

/// Compiles a whole program into its top-level script function.
///
/// The returned function is not rooted; run it (or pin it) before the next
/// allocation.
pub fn compile(source: &str, heap: &mut Collector) -> Result<ObjRef, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let depth = heap.safe_depth();
    let result = Compiler::new(&mut *heap, tokens).compile_script();
    heap.truncate_safe(depth);
    result
}

#[derive(Debug)]
struct Local {
    name: String,
    /// `None` while the initializer is being compiled.
    depth: Option<usize>,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct UpvalueRef {
    index: u8,
    captures_local: bool,
}

#[derive(Debug)]
struct LoopScope {
    start: usize,
    depth: usize,
    breaks: Vec<usize>,
}

#[derive(Debug)]
struct FunctionScope {
    function: ObjRef,
    bytecode: Bytecode,
    arity: u8,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    loops: Vec<LoopScope>,
    depth: usize,
}

impl FunctionScope {
    fn new(function: ObjRef) -> Self {
        FunctionScope {
            function,
            bytecode: Bytecode::new(),
            arity: 0,
            locals: Vec::new(),
            upvalues: Vec::new(),
            loops: Vec::new(),
            depth: 0,
        }
    }
}

/// The function being compiled and the ones lexically around it.
#[derive(Debug)]
struct Functions {
    current: FunctionScope,
    enclosing: Vec<FunctionScope>,
}

impl Functions {
    fn level(&self) -> usize {
        self.enclosing.len()
    }

    fn at_mut(&mut self, level: usize) -> &mut FunctionScope {
        if level == self.enclosing.len() {
            &mut self.current
        } else {
            &mut self.enclosing[level]
        }
    }
}

impl RootSet for Functions {
    fn trace_roots(&self, out: &mut Vec<Value>) {
        for scope in self.enclosing.iter().chain(std::iter::once(&self.current)) {
            out.push(Value::Obj(scope.function));
            out.extend_from_slice(&scope.bytecode.constants);
        }
    }
}

struct Compiler<'h> {
    heap: &'h mut Collector,
    tokens: Vec<Spanned>,
    pos: usize,
    previous: usize,
    functions: Functions,
}

impl<'h> Compiler<'h> {
    fn new(heap: &'h mut Collector, mut tokens: Vec<Spanned>) -> Self {
        if tokens.last().map(|t| &t.token) != Some(&Token::Eof) {
            let span = tokens
                .last()
                .map(|t| t.span)
                .unwrap_or(Span { line: 1, col: 1 });
            tokens.push(Spanned {
                token: Token::Eof,
                span,
            });
        }

        let script = heap.new_function(None, 0, &NoRoots);
        heap.push_safe(Value::Obj(script));
        Compiler {
            heap,
            tokens,
            pos: 0,
            previous: 0,
            functions: Functions {
                current: FunctionScope::new(script),
                enclosing: Vec::new(),
            },
        }
    }

    fn compile_script(mut self) -> CompileResult<ObjRef> {
        while !self.check(&Token::Eof) {
            self.statement()?;
        }
        self.emit_return();

        let script = self.install_current();
        self.heap.pop_safe();
        Ok(script)
    }

    // =========================================================================
    // Token stream
    // =========================================================================

    fn current(&self) -> &Spanned {
        &self.tokens[self.pos]
    }

    fn check(&self, token: &Token) -> bool {
        &self.current().token == token
    }

    fn advance(&mut self) {
        self.previous = self.pos;
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> CompileResult<()> {
        if self.eat(&token) {
            return Ok(());
        }
        Err(self.unexpected(what))
    }

    fn expect_ident(&mut self, what: &str) -> CompileResult<String> {
        if let Token::Ident(name) = &self.current().token {
            let name = name.clone();
            self.advance();
            return Ok(name);
        }
        Err(self.unexpected(what))
    }

    /// Line of the most recently consumed token.
    fn line(&self) -> u32 {
        self.tokens[self.previous].span.line as u32
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        let span = self.current().span;
        CompileError::new(message, span.line, span.col)
    }

    fn unexpected(&self, what: &str) -> CompileError {
        self.error(format!("expected {}, got {}", what, self.current().token))
    }

    fn bytecode_error(&self, e: BytecodeError) -> CompileError {
        self.error(e.to_string())
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn chunk(&mut self) -> &mut Bytecode {
        &mut self.functions.current.bytecode
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_byte(byte, line);
    }

    fn emit_variable(&mut self, short: OpCode, long: OpCode, argument: u16) {
        let line = self.line();
        self.chunk().write_variable(short, long, argument, line);
    }

    fn emit_constant(&mut self, value: Value) -> CompileResult<()> {
        let line = self.line();
        let written = self
            .chunk()
            .write_constant(OpCode::Const, OpCode::ConstLong, value, line);
        written.map(|_| ()).map_err(|e| self.bytecode_error(e))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.chunk().write_jump(op, line)
    }

    fn patch_jump(&mut self, operand: usize) -> CompileResult<()> {
        let patched = self.chunk().patch_jump(operand);
        patched.map_err(|e| self.bytecode_error(e))
    }

    fn emit_loop(&mut self, start: usize) -> CompileResult<()> {
        let line = self.line();
        let written = self.chunk().write_loop(start, line);
        written.map_err(|e| self.bytecode_error(e))
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nihl);
        self.emit_op(OpCode::Return);
    }

    /// Constant-pool index of an interned identifier, reusing an existing
    /// entry for the same name.
    fn identifier_constant(&mut self, name: &str) -> CompileResult<u16> {
        let key = self.heap.intern_str(name, &self.functions);
        let existing = self
            .functions
            .current
            .bytecode
            .constants
            .iter()
            .position(|c| matches!(c, Value::Obj(r) if *r == key));
        if let Some(index) = existing {
            return Ok(index as u16);
        }
        let added = self.chunk().add_constant(Value::Obj(key));
        added.map_err(|e| self.bytecode_error(e))
    }

    /// Moves the finished bytecode into the current function object.
    fn install_current(&mut self) -> ObjRef {
        let scope = &mut self.functions.current;
        let function = scope.function;
        let bytecode = mem::take(&mut scope.bytecode);
        let arity = scope.arity;
        let upvalue_count = scope.upvalues.len();

        tracing::debug!(
            target: "yaspl::compile",
            bytes = bytecode.len(),
            constants = bytecode.constants.len(),
            upvalues = upvalue_count,
            "compiled function"
        );

        if let Some(f) = self.heap.as_function_mut(function) {
            f.arity = arity;
            f.upvalue_count = upvalue_count;
            f.bytecode = bytecode;
        }
        self.heap.track_growth(function, &self.functions);
        function
    }

    // =========================================================================
    // Scopes & variables
    // =========================================================================

    fn is_global_scope(&self) -> bool {
        self.functions.enclosing.is_empty() && self.functions.current.depth == 0
    }

    fn begin_scope(&mut self) {
        self.functions.current.depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = &mut self.functions.current;
        scope.depth -= 1;
        let depth = scope.depth;

        let mut ops = Vec::new();
        while let Some(local) = scope.locals.last() {
            if local.depth.is_some_and(|d| d <= depth) {
                break;
            }
            ops.push(if local.captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
            scope.locals.pop();
        }
        for op in ops {
            self.emit_op(op);
        }
    }

    fn declare_local(&mut self, name: String) -> CompileResult<()> {
        let scope = &self.functions.current;
        for local in scope.locals.iter().rev() {
            if local.depth.is_some_and(|d| d < scope.depth) {
                break;
            }
            if local.name == name {
                return Err(self.error(format!(
                    "variable '{}' already declared in this scope",
                    name
                )));
            }
        }
        if scope.locals.len() > MAX_LOCALS {
            return Err(self.error("too many local variables in function"));
        }
        self.functions.current.locals.push(Local {
            name,
            depth: None,
            captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let scope = &mut self.functions.current;
        let depth = scope.depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> CompileResult<Option<u16>> {
        let scope = self.functions.at_mut(level);
        let Some(slot) = scope.locals.iter().rposition(|l| l.name == name) else {
            return Ok(None);
        };
        if scope.locals[slot].depth.is_none() {
            return Err(self.error(format!(
                "cannot read local variable '{}' in its own initializer",
                name
            )));
        }
        Ok(Some(slot as u16))
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> CompileResult<Option<u16>> {
        if level == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.resolve_local(level - 1, name)? {
            let Ok(slot) = u8::try_from(slot) else {
                return Err(self.error(format!(
                    "cannot capture '{}': local slot beyond 255",
                    name
                )));
            };
            self.functions.at_mut(level - 1).locals[slot as usize].captured = true;
            return self.add_upvalue(level, slot, true).map(Some);
        }
        if let Some(index) = self.resolve_upvalue(level - 1, name)? {
            // upvalue indices never exceed a byte
            return self.add_upvalue(level, index as u8, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, captures_local: bool) -> CompileResult<u16> {
        let wanted = UpvalueRef {
            index,
            captures_local,
        };
        let scope = self.functions.at_mut(level);
        if let Some(existing) = scope.upvalues.iter().position(|u| *u == wanted) {
            return Ok(existing as u16);
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("too many closure variables in function"));
        }
        scope.upvalues.push(wanted);
        Ok((scope.upvalues.len() - 1) as u16)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) -> CompileResult<()> {
        let level = self.functions.level();
        let (get, get_long, set, set_long, argument) =
            if let Some(slot) = self.resolve_local(level, name)? {
                use OpCode::*;
                (LocalGet, LocalGetLong, LocalSet, LocalSetLong, slot)
            } else if let Some(index) = self.resolve_upvalue(level, name)? {
                use OpCode::*;
                (UpvalueGet, UpvalueGetLong, UpvalueSet, UpvalueSetLong, index)
            } else {
                let index = self.identifier_constant(name)?;
                use OpCode::*;
                (GlobalGet, GlobalGetLong, GlobalSet, GlobalSetLong, index)
            };

        if can_assign && self.eat(&Token::Assign) {
            self.assign()?;
            self.emit_variable(set, set_long, argument);
        } else {
            self.emit_variable(get, get_long, argument);
        }
        Ok(())
    }

    /// Emits pops for the locals a `break`/`continue` jumps out of, leaving
    /// the compiler's view of the scope untouched.
    fn discard_loop_locals(&mut self, depth: usize) {
        let ops: Vec<OpCode> = self
            .functions
            .current
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth.is_none_or(|d| d > depth))
            .map(|l| {
                if l.captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> CompileResult<()> {
        match self.current().token {
            Token::Print => self.print_statement(),
            Token::Let => self.let_statement(),
            Token::If => self.if_statement(),
            Token::While => self.while_statement(),
            Token::Func => self.func_statement(),
            Token::Ret => self.ret_statement(),
            Token::Break => self.break_statement(),
            Token::Continue => self.continue_statement(),
            _ => self.expression_statement(),
        }
    }

    fn end_of_statement(&mut self) -> CompileResult<()> {
        self.expect(Token::Newline, "end of line after statement")
    }

    fn print_statement(&mut self) -> CompileResult<()> {
        self.advance();
        self.expression()?;
        self.emit_op(OpCode::Print);
        self.emit_op(OpCode::Pop);
        self.end_of_statement()
    }

    fn expression_statement(&mut self) -> CompileResult<()> {
        self.expression()?;
        self.emit_op(OpCode::Pop);
        self.end_of_statement()
    }

    fn let_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let name = self.expect_ident("variable name after 'let'")?;

        if self.is_global_scope() {
            let index = self.identifier_constant(&name)?;
            self.initializer()?;
            self.emit_variable(OpCode::GlobalDecl, OpCode::GlobalDeclLong, index);
        } else {
            self.declare_local(name)?;
            self.initializer()?;
            self.mark_initialized();
        }
        self.end_of_statement()
    }

    fn initializer(&mut self) -> CompileResult<()> {
        if self.eat(&Token::Assign) {
            self.expression()
        } else {
            self.emit_op(OpCode::Nihl);
            Ok(())
        }
    }

    fn block(&mut self) -> CompileResult<()> {
        self.expect(Token::Newline, "end of line before block")?;
        self.expect(Token::Indent, "indented block")?;
        self.begin_scope();
        while !self.check(&Token::Dedent) && !self.check(&Token::Eof) {
            self.statement()?;
        }
        self.expect(Token::Dedent, "end of block")?;
        self.end_scope();
        Ok(())
    }

    fn if_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let mut exits = Vec::new();

        loop {
            self.expression()?;
            let next = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.block()?;
            exits.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next)?;
            self.emit_op(OpCode::Pop);

            if !self.eat(&Token::Elif) {
                break;
            }
        }

        if self.eat(&Token::Else) {
            self.block()?;
        }
        for exit in exits {
            self.patch_jump(exit)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let start = self.functions.current.bytecode.len();
        let depth = self.functions.current.depth;
        self.functions.current.loops.push(LoopScope {
            start,
            depth,
            breaks: Vec::new(),
        });

        self.expression()?;
        let exit = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.block()?;
        self.emit_loop(start)?;
        self.patch_jump(exit)?;
        self.emit_op(OpCode::Pop);

        if let Some(finished) = self.functions.current.loops.pop() {
            for jump in finished.breaks {
                self.patch_jump(jump)?;
            }
        }
        Ok(())
    }

    fn break_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let Some(depth) = self.functions.current.loops.last().map(|l| l.depth) else {
            return Err(self.error("'break' outside of a loop"));
        };
        self.discard_loop_locals(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(innermost) = self.functions.current.loops.last_mut() {
            innermost.breaks.push(jump);
        }
        self.end_of_statement()
    }

    fn continue_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let Some((start, depth)) = self
            .functions
            .current
            .loops
            .last()
            .map(|l| (l.start, l.depth))
        else {
            return Err(self.error("'continue' outside of a loop"));
        };
        self.discard_loop_locals(depth);
        self.emit_loop(start)?;
        self.end_of_statement()
    }

    fn ret_statement(&mut self) -> CompileResult<()> {
        self.advance();
        if self.check(&Token::Newline) {
            self.emit_op(OpCode::Nihl);
        } else {
            self.expression()?;
        }
        self.emit_op(OpCode::Return);
        self.end_of_statement()
    }

    fn func_statement(&mut self) -> CompileResult<()> {
        self.advance();
        let name = self.expect_ident("function name after 'func'")?;
        let line = self.line();

        if self.is_global_scope() {
            let index = self.identifier_constant(&name)?;
            self.function(&name)?;
            self.chunk()
                .write_variable(OpCode::GlobalDecl, OpCode::GlobalDeclLong, index, line);
        } else {
            // initialized up front so the body can call itself
            self.declare_local(name.clone())?;
            self.mark_initialized();
            self.function(&name)?;
        }
        Ok(())
    }

    /// Compiles parameters and body into a new function and emits the
    /// `CLOSURE` instruction that builds it at runtime.
    fn function(&mut self, name: &str) -> CompileResult<()> {
        let line = self.line();
        let function = self.heap.new_function(Some(name), 0, &self.functions);
        self.heap.push_safe(Value::Obj(function));
        let enclosing = mem::replace(&mut self.functions.current, FunctionScope::new(function));
        self.functions.enclosing.push(enclosing);
        self.begin_scope();

        self.expect(Token::LParen, "'(' after function name")?;
        if !self.check(&Token::RParen) {
            loop {
                if self.functions.current.arity as usize >= MAX_PARAMETERS {
                    return Err(self.error("too many parameters"));
                }
                self.functions.current.arity += 1;
                let param = self.expect_ident("parameter name")?;
                self.declare_local(param)?;
                self.mark_initialized();
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after parameters")?;
        self.block()?;
        self.emit_return();

        self.install_current();
        let Some(parent) = self.functions.enclosing.pop() else {
            return Err(self.error("function scope underflow"));
        };
        let finished = mem::replace(&mut self.functions.current, parent);

        let added = self.chunk().add_constant(Value::Obj(function));
        let index = added.map_err(|e| self.bytecode_error(e))?;
        let chunk = self.chunk();
        chunk.write_variable(OpCode::Closure, OpCode::ClosureLong, index, line);
        for upvalue in finished.upvalues {
            chunk.write_byte(upvalue.captures_local as u8, line);
            chunk.write_byte(upvalue.index, line);
        }
        self.heap.pop_safe();
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// `assign (',' assign)*`, keeping only the last value.
    fn expression(&mut self) -> CompileResult<()> {
        self.assign()?;
        while self.eat(&Token::Comma) {
            self.emit_op(OpCode::Pop);
            self.assign()?;
        }
        Ok(())
    }

    fn assign(&mut self) -> CompileResult<()> {
        self.ternary(true)?;
        if self.check(&Token::Assign) {
            return Err(self.error("invalid assignment target"));
        }
        Ok(())
    }

    fn ternary(&mut self, can_assign: bool) -> CompileResult<()> {
        self.or(can_assign)?;
        if !self.eat(&Token::Question) {
            return Ok(());
        }

        let otherwise = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.ternary(false)?;
        let end = self.emit_jump(OpCode::Jump);
        self.expect(Token::Colon, "':' in conditional expression")?;
        self.patch_jump(otherwise)?;
        self.emit_op(OpCode::Pop);
        self.ternary(false)?;
        self.patch_jump(end)
    }

    fn or(&mut self, can_assign: bool) -> CompileResult<()> {
        self.and(can_assign)?;
        loop {
            if self.eat(&Token::Or) {
                let end = self.emit_jump(OpCode::JumpIfTrue);
                self.emit_op(OpCode::Pop);
                self.and(false)?;
                self.patch_jump(end)?;
            } else if self.eat(&Token::Xor) {
                self.and(false)?;
                self.emit_op(OpCode::Xor);
            } else {
                return Ok(());
            }
        }
    }

    fn and(&mut self, can_assign: bool) -> CompileResult<()> {
        self.equality(can_assign)?;
        while self.eat(&Token::And) {
            let end = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.equality(false)?;
            self.patch_jump(end)?;
        }
        Ok(())
    }

    /// Left-associative chain of `operand (op operand)*`.
    fn binary_chain(
        &mut self,
        can_assign: bool,
        operand: fn(&mut Self, bool) -> CompileResult<()>,
        operator: fn(&Token) -> Option<OpCode>,
    ) -> CompileResult<()> {
        operand(self, can_assign)?;
        while let Some(op) = operator(&self.current().token) {
            self.advance();
            operand(self, false)?;
            self.emit_op(op);
        }
        Ok(())
    }

    fn equality(&mut self, can_assign: bool) -> CompileResult<()> {
        self.binary_chain(can_assign, Self::comparison, |t| match t {
            Token::EqEq => Some(OpCode::Equal),
            Token::BangEq => Some(OpCode::NotEqual),
            _ => None,
        })
    }

    fn comparison(&mut self, can_assign: bool) -> CompileResult<()> {
        self.binary_chain(can_assign, Self::sum, |t| match t {
            Token::Lt => Some(OpCode::Less),
            Token::LtEq => Some(OpCode::LessEqual),
            Token::Gt => Some(OpCode::Greater),
            Token::GtEq => Some(OpCode::GreaterEqual),
            _ => None,
        })
    }

    fn sum(&mut self, can_assign: bool) -> CompileResult<()> {
        self.binary_chain(can_assign, Self::product, |t| match t {
            Token::Plus => Some(OpCode::Add),
            Token::Minus => Some(OpCode::Sub),
            Token::PlusPlus => Some(OpCode::Concat),
            _ => None,
        })
    }

    fn product(&mut self, can_assign: bool) -> CompileResult<()> {
        self.binary_chain(can_assign, Self::power, |t| match t {
            Token::Star => Some(OpCode::Mul),
            Token::Slash => Some(OpCode::Div),
            Token::Percent => Some(OpCode::Mod),
            _ => None,
        })
    }

    /// Right-associative: `2 ^ 3 ^ 2` is `2 ^ 9`.
    fn power(&mut self, can_assign: bool) -> CompileResult<()> {
        self.unary(can_assign)?;
        if self.eat(&Token::Caret) {
            self.power(false)?;
            self.emit_op(OpCode::Pow);
        }
        Ok(())
    }

    fn unary(&mut self, can_assign: bool) -> CompileResult<()> {
        match self.current().token {
            Token::Minus => {
                self.advance();
                self.unary(false)?;
                self.emit_op(OpCode::Negate);
            }
            Token::Bang => {
                self.advance();
                self.unary(false)?;
                self.emit_op(OpCode::Not);
            }
            Token::Plus => {
                self.advance();
                self.unary(false)?;
            }
            _ => self.postfix(can_assign)?,
        }
        Ok(())
    }

    fn postfix(&mut self, can_assign: bool) -> CompileResult<()> {
        self.primary(can_assign)?;
        loop {
            if self.eat(&Token::LParen) {
                let argc = self.arguments()?;
                self.emit_op(OpCode::Call);
                self.emit_byte(argc);
            } else if self.eat(&Token::LBracket) {
                self.expression()?;
                self.expect(Token::RBracket, "']' after index")?;
                if can_assign && self.eat(&Token::Assign) {
                    self.assign()?;
                    self.emit_op(OpCode::IndexSet);
                    return Ok(());
                }
                self.emit_op(OpCode::IndexGet);
            } else {
                return Ok(());
            }
        }
    }

    fn arguments(&mut self) -> CompileResult<u8> {
        let mut argc = 0usize;
        if !self.check(&Token::RParen) {
            loop {
                self.assign()?;
                argc += 1;
                if argc > MAX_ARGUMENTS {
                    return Err(self.error("too many arguments"));
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after arguments")?;
        Ok(argc as u8)
    }

    fn primary(&mut self, can_assign: bool) -> CompileResult<()> {
        let token = self.current().token.clone();
        match token {
            Token::Number(n) => {
                self.advance();
                self.emit_constant(Value::Number(n))
            }
            Token::String(s) => {
                self.advance();
                let string = self.heap.intern_str(&s, &self.functions);
                self.emit_constant(Value::Obj(string))
            }
            Token::True => {
                self.advance();
                self.emit_op(OpCode::True);
                Ok(())
            }
            Token::False => {
                self.advance();
                self.emit_op(OpCode::False);
                Ok(())
            }
            Token::Nihl => {
                self.advance();
                self.emit_op(OpCode::Nihl);
                Ok(())
            }
            Token::Ident(name) => {
                self.advance();
                self.named_variable(&name, can_assign)
            }
            Token::LParen => {
                self.advance();
                self.expression()?;
                self.expect(Token::RParen, "')' after grouping expression")
            }
            Token::LBracket => {
                self.advance();
                self.array()
            }
            Token::LBrace => {
                self.advance();
                self.dict()
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn array(&mut self) -> CompileResult<()> {
        let mut count = 0usize;
        if !self.check(&Token::RBracket) {
            loop {
                self.assign()?;
                count += 1;
                if count > MAX_ELEMENTS {
                    return Err(self.error("too many elements in array literal"));
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RBracket, "']' after array elements")?;
        self.emit_variable(OpCode::Array, OpCode::ArrayLong, count as u16);
        Ok(())
    }

    fn dict(&mut self) -> CompileResult<()> {
        let mut pairs = 0usize;
        if !self.check(&Token::RBrace) {
            loop {
                self.assign()?;
                self.expect(Token::FatArrow, "'=>' after dict key")?;
                self.assign()?;
                pairs += 1;
                if pairs > MAX_ELEMENTS {
                    return Err(self.error("too many entries in dict literal"));
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RBrace, "'}' after dict entries")?;
        self.emit_variable(OpCode::Dict, OpCode::DictLong, pairs as u16);
        Ok(())
    }
}
