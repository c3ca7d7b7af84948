// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Strand programming language.
// Translates the token stream straight into a `Function` with no
// intermediate AST: recursive descent with a record of the most recently
// emitted instructions (so an identifier load can be rolled back and turned
// into an assignment or declaration once the `=` is seen), compile-time stack
// height tracking for slot allocation, upvalue resolution through the chain
// of enclosing function compilers, and backpatched jumps.

use crate::bytecode::{ClassKind, Constant, DebugInfo, Function, LocalInfo, OpCode, UpvalueDesc};
use crate::errors::{find_closest_match, CompileError};
use crate::lexer::{tokenize_with, LexOptions, SourceFile, Token, TokenKind};
use ahash::AHashMap;
use std::rc::Rc;

/// Names resolvable at runtime through `CONST_ID`
pub trait GlobalScope {
    fn is_global(&self, name: &str) -> bool;
    fn global_names(&self) -> Vec<String>;
}

/// Compiles a source file with default lexer options
pub fn compile(source: &SourceFile, globals: &dyn GlobalScope) -> Result<Rc<Function>, CompileError> {
    compile_with(source, globals, LexOptions::default())
}

pub fn compile_with(
    source: &SourceFile,
    globals: &dyn GlobalScope,
    options: LexOptions,
) -> Result<Rc<Function>, CompileError> {
    let tokens = tokenize_with(source, options)?;
    let function = Compiler::new(source, globals, tokens).compile_script()?;
    tracing::debug!(file = %source.path, bytes = function.code.len(), "compiled script");
    Ok(Rc::new(function))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
}

/// What a name is bound to; only plain variables may be reassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Variable,
    Receiver,
    Function,
    Class(ClassKind),
}

impl Binding {
    fn is_mutable(self) -> bool {
        self == Binding::Variable
    }
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    slot: u16,
    depth: usize,
    captured: bool,
    initialized: bool,
    binding: Binding,
    /// Set for capture-free `fn` declarations: calls load the constant directly
    function: Option<Rc<Function>>,
    start: u32,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Local(u16),
    Upvalue(u16),
}

#[derive(Debug, Clone)]
struct Resolved {
    access: Access,
    binding: Binding,
}

struct LoopContext {
    start: usize,
    /// Stack height that `break`/`continue` unwind to
    height: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Literal data of an emitted instruction, kept for rollback
#[derive(Debug, Clone, PartialEq)]
enum ChunkData {
    None,
    Local { slot: u16, name: String, mutable: bool },
    Upvalue { index: u16, name: String, mutable: bool },
    /// Placeholder load of an unresolved name directly followed by `=`
    Unresolved(String),
    Prop(u32),
    Index,
    /// The POP closing an expression statement
    ExprStatement,
}

#[derive(Debug, Clone)]
struct Chunk {
    offset: usize,
    height_before: usize,
    data: ChunkData,
}

/// Result of compiling an expression in statement position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprOutcome {
    /// One value was pushed
    Value,
    /// A new local was declared; its value stays in its slot
    Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhenMode {
    /// Branches are statements and leave nothing behind
    Statement,
    /// Branches are expressions; the chosen one is the value
    Expression,
    /// Branches are statements whose trailing expression is the value
    Trailing,
}

/// Per-function compilation state
struct FunctionCompiler {
    enclosing: Option<Box<FunctionCompiler>>,
    kind: FunctionKind,
    name: String,
    arity: u8,
    defaults: Vec<Constant>,
    code: Vec<u8>,
    constants: Vec<Constant>,
    string_constants: AHashMap<String, u32>,
    upvalues: Vec<(UpvalueDesc, String)>,
    debug: DebugInfo,
    locals: Vec<Local>,
    loops: Vec<LoopContext>,
    chunks: Vec<Chunk>,
    scope_depth: usize,
    /// Compile-time operand stack height relative to the frame base
    height: usize,
    /// Code at or before this offset is a jump target and may not be rolled back
    jump_barrier: usize,
    last_line: Option<u32>,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: &str) -> Self {
        // Slot 0 holds the callee (or the receiver for methods)
        let (slot_name, binding) = match kind {
            FunctionKind::Script => (String::new(), Binding::Receiver),
            FunctionKind::Function => (name.to_string(), Binding::Function),
            FunctionKind::Method => ("self".to_string(), Binding::Receiver),
        };
        Self {
            enclosing: None,
            kind,
            name: name.to_string(),
            arity: 0,
            defaults: Vec::new(),
            code: Vec::new(),
            constants: Vec::new(),
            string_constants: AHashMap::new(),
            upvalues: Vec::new(),
            debug: DebugInfo::default(),
            locals: vec![Local {
                name: slot_name,
                slot: 0,
                depth: 0,
                captured: false,
                initialized: true,
                binding,
                function: None,
                start: 0,
            }],
            loops: Vec::new(),
            chunks: Vec::new(),
            scope_depth: 0,
            height: 1,
            jump_barrier: 0,
            last_line: None,
        }
    }

    fn add_upvalue(&mut self, desc: UpvalueDesc, name: &str) -> Option<u16> {
        if let Some(index) = self.upvalues.iter().position(|(d, _)| *d == desc) {
            return u16::try_from(index).ok();
        }
        let index = u16::try_from(self.upvalues.len()).ok()?;
        self.upvalues.push((desc, name.to_string()));
        Some(index)
    }

    fn retire_local(&mut self, local: Local) {
        self.debug.locals.push(LocalInfo {
            name: local.name,
            slot: local.slot,
            start: local.start,
            end: self.code.len() as u32,
        });
    }

    fn finish(mut self) -> Function {
        let remaining: Vec<Local> = self.locals.drain(1..).collect();
        for local in remaining {
            self.retire_local(local);
        }
        let arity = self.arity;
        Function {
            name: self.name,
            arity,
            optional_params_start: arity - self.defaults.len() as u8,
            default_values: self.defaults,
            is_method: self.kind == FunctionKind::Method,
            upvalues: self.upvalues.into_iter().map(|(desc, _)| desc).collect(),
            code: self.code,
            constants: self.constants,
            debug: self.debug,
        }
    }
}

/// Finds the local a name refers to at one function level. Uninitialized
/// locals are invisible to their own function (so `let x = x` sees an outer
/// `x`) but visible to nested functions (so methods can name their class).
fn find_local(fc: &FunctionCompiler, name: &str, include_uninitialized: bool) -> Option<usize> {
    fc.locals
        .iter()
        .rposition(|l| l.name == name && (l.initialized || include_uninitialized))
}

fn resolve_in(fc: &mut FunctionCompiler, name: &str) -> Option<Resolved> {
    if let Some(index) = find_local(fc, name, false) {
        let local = &fc.locals[index];
        return Some(Resolved { access: Access::Local(local.slot), binding: local.binding });
    }
    resolve_upvalue(fc, name)
}

fn resolve_upvalue(fc: &mut FunctionCompiler, name: &str) -> Option<Resolved> {
    let enclosing = fc.enclosing.as_deref_mut()?;
    let (desc, binding) = if let Some(index) = find_local(enclosing, name, true) {
        let local = &mut enclosing.locals[index];
        local.captured = true;
        (UpvalueDesc { is_local: true, index: local.slot }, local.binding)
    } else {
        let outer = resolve_upvalue(enclosing, name)?;
        let Access::Upvalue(index) = outer.access else {
            return None;
        };
        (UpvalueDesc { is_local: false, index }, outer.binding)
    };
    let index = fc.add_upvalue(desc, name)?;
    Some(Resolved { access: Access::Upvalue(index), binding })
}

/// A capture-free function declaration visible under `name`, if that is what
/// the name resolves to
fn find_function(fc: &FunctionCompiler, name: &str, level: usize) -> Option<Rc<Function>> {
    match find_local(fc, name, level > 0) {
        Some(index) => {
            let local = &fc.locals[index];
            if local.binding == Binding::Function {
                local.function.clone()
            } else {
                None
            }
        }
        None => find_function(fc.enclosing.as_deref()?, name, level + 1),
    }
}

pub struct Compiler<'a> {
    source: &'a SourceFile,
    globals: &'a dyn GlobalScope,
    tokens: Vec<Token>,
    pos: usize,
    /// Token indices that a `// @break` marker precedes
    breakpoints: Vec<usize>,
    next_breakpoint: usize,
    current: Box<FunctionCompiler>,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a SourceFile, globals: &'a dyn GlobalScope, tokens: Vec<Token>) -> Self {
        let mut kept = Vec::with_capacity(tokens.len());
        let mut breakpoints = Vec::new();
        for token in tokens {
            if token.kind == TokenKind::Breakpoint {
                breakpoints.push(kept.len());
            } else {
                kept.push(token);
            }
        }
        if kept.last().map(|t| &t.kind) != Some(&TokenKind::Eof) {
            let (line, column) = kept.last().map(|t| (t.line, t.column + 1)).unwrap_or((1, 1));
            kept.push(Token { kind: TokenKind::Eof, line, column });
        }

        Self {
            source,
            globals,
            tokens: kept,
            pos: 0,
            breakpoints,
            next_breakpoint: 0,
            current: Box::new(FunctionCompiler::new(FunctionKind::Script, "<script>")),
        }
    }

    /// Compiles the whole token stream as the top-level script
    pub fn compile_script(mut self) -> Result<Function, CompileError> {
        while !self.is_at_end() {
            self.statement()?;
        }
        if self.take_trailing_value() {
            self.emit_op(OpCode::Return, -1)?;
        } else {
            self.emit_op(OpCode::Halt, 0)?;
        }
        Ok(self.current.finish())
    }

    // ---------------------------------------------------------------
    // Token handling
    // ---------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        token
    }

    /// The next token sits on the same line as the previous one
    fn same_line(&self) -> bool {
        self.peek().line == self.previous().line
    }

    fn check_punct(&self, c: char) -> bool {
        self.peek().is_punct(c)
    }

    fn check_op(&self, op: &str) -> bool {
        self.peek().is_operator(op)
    }

    fn check_keyword(&self, word: &str) -> bool {
        self.peek().is_keyword(word)
    }

    fn match_punct(&mut self, c: char) -> bool {
        let matched = self.check_punct(c);
        if matched {
            self.advance();
        }
        matched
    }

    fn match_op(&mut self, op: &str) -> bool {
        let matched = self.check_op(op);
        if matched {
            self.advance();
        }
        matched
    }

    fn match_keyword(&mut self, word: &str) -> bool {
        let matched = self.check_keyword(word);
        if matched {
            self.advance();
        }
        matched
    }

    fn expect_punct(&mut self, c: char, context: &str) -> Result<(), CompileError> {
        if self.match_punct(c) {
            return Ok(());
        }
        Err(self.error(format!("Expected '{}' {}, found {}", c, context, self.peek().describe())))
    }

    fn expect_op(&mut self, op: &str, context: &str) -> Result<(), CompileError> {
        if self.match_op(op) {
            return Ok(());
        }
        Err(self.error(format!("Expected '{}' {}, found {}", op, context, self.peek().describe())))
    }

    fn expect_identifier(&mut self, what: &str) -> Result<(String, Token), CompileError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok((name, token))
            }
            _ => Err(self.error(format!("Expected {}, found {}", what, token.describe()))),
        }
    }

    fn skip_separators(&mut self) {
        while self.match_punct(';') {}
    }

    /// Whether an optional operand (`return x`, `yield x`) follows on this line
    fn value_follows(&self) -> bool {
        self.same_line()
            && !matches!(
                self.peek().kind,
                TokenKind::Eof | TokenKind::Punctuation('}' | ')' | ']' | ';' | ',')
            )
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        self.error_at(self.peek(), message)
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> CompileError {
        CompileError::new(self.source.path.clone(), message.into(), token.line, token.column)
            .with_source(self.source.line(token.line).unwrap_or_default().to_string())
    }

    // ---------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------

    /// Appends one instruction, records it for rollback, and applies its
    /// stack effect to the compile-time height. Returns its offset.
    fn emit(&mut self, op: OpCode, operands: &[u8], effect: isize, data: ChunkData) -> Result<usize, CompileError> {
        let line = self.previous().line as u32;
        self.emit_on_line(op, operands, effect, data, line)
    }

    fn emit_on_line(
        &mut self,
        op: OpCode,
        operands: &[u8],
        effect: isize,
        data: ChunkData,
        line: u32,
    ) -> Result<usize, CompileError> {
        let fc = &mut self.current;
        let offset = fc.code.len();

        if fc.last_line != Some(line) {
            fc.debug.lines.push((line, offset as u32));
            fc.last_line = Some(line);
        }
        fc.code.push(op as u8);
        fc.code.extend_from_slice(operands);
        fc.chunks.push(Chunk { offset, height_before: fc.height, data });

        let height = fc.height as isize + effect;
        if height < 0 {
            return Err(self.error(format!("internal compiler error: stack height underflow at {}", op.mnemonic())));
        }
        if height > u16::MAX as isize {
            return Err(self.error("Too many values on the stack in one function"));
        }
        fc.height = height as usize;
        Ok(offset)
    }

    fn emit_op(&mut self, op: OpCode, effect: isize) -> Result<usize, CompileError> {
        self.emit(op, &[], effect, ChunkData::None)
    }

    fn emit_u16(&mut self, op: OpCode, operand: u16, effect: isize) -> Result<usize, CompileError> {
        self.emit(op, &operand.to_le_bytes(), effect, ChunkData::None)
    }

    fn emit_u32(&mut self, op: OpCode, operand: u32, effect: isize) -> Result<usize, CompileError> {
        self.emit(op, &operand.to_le_bytes(), effect, ChunkData::None)
    }

    /// Emits a jump with a zero placeholder; returns the operand position
    fn emit_jump(&mut self, op: OpCode, effect: isize) -> Result<usize, CompileError> {
        Ok(self.emit(op, &[0; 4], effect, ChunkData::None)? + 1)
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        self.emit_u32(OpCode::Jump, start as u32, 0)?;
        Ok(())
    }

    /// Points the placeholder at `operand_at` to the current end of code
    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.current.code.len();
        self.patch_jump_to(operand_at, target);
        self.mark_jump_target();
    }

    fn patch_jump_to(&mut self, operand_at: usize, target: usize) {
        self.current.code[operand_at..operand_at + 4].copy_from_slice(&(target as u32).to_le_bytes());
    }

    fn mark_jump_target(&mut self) {
        self.current.jump_barrier = self.current.code.len();
    }

    /// Removes the last emitted instruction, restoring the stack height.
    /// Refused when a jump lands right after it.
    fn rollback(&mut self) -> Option<Chunk> {
        let fc = &mut self.current;
        let chunk = fc.chunks.last()?;
        if chunk.offset < fc.jump_barrier {
            return None;
        }
        let chunk = fc.chunks.pop()?;
        fc.code.truncate(chunk.offset);
        fc.height = chunk.height_before;
        while fc.debug.lines.last().is_some_and(|&(_, offset)| offset as usize >= chunk.offset) {
            fc.debug.lines.pop();
        }
        fc.last_line = fc.debug.lines.last().map(|&(line, _)| line);
        Some(chunk)
    }

    /// Rolls back a trailing expression-statement POP so its value survives
    fn take_trailing_value(&mut self) -> bool {
        let is_expr_pop = self
            .current
            .chunks
            .last()
            .is_some_and(|c| c.data == ChunkData::ExprStatement && c.offset >= self.current.jump_barrier);
        is_expr_pop && self.rollback().is_some()
    }

    fn string_constant(&mut self, s: &str) -> Result<u32, CompileError> {
        if let Some(&index) = self.current.string_constants.get(s) {
            return Ok(index);
        }
        let index = self.add_constant(Constant::Str(Rc::from(s)))?;
        self.current.string_constants.insert(s.to_string(), index);
        Ok(index)
    }

    fn add_constant(&mut self, constant: Constant) -> Result<u32, CompileError> {
        if let Constant::Function(function) = &constant {
            let existing = self
                .current
                .constants
                .iter()
                .position(|c| matches!(c, Constant::Function(f) if Rc::ptr_eq(f, function)));
            if let Some(index) = existing {
                return Ok(index as u32);
            }
        }
        let index = u32::try_from(self.current.constants.len())
            .map_err(|_| self.error("Too many constants in one function"))?;
        self.current.constants.push(constant);
        Ok(index)
    }

    fn emit_closure(&mut self, function: Rc<Function>) -> Result<(), CompileError> {
        let index = self.add_constant(Constant::Function(function))?;
        self.emit_u32(OpCode::Closure, index, 1)?;
        Ok(())
    }

    fn emit_pending_breakpoint(&mut self) -> Result<(), CompileError> {
        let mut pending = false;
        while self.breakpoints.get(self.next_breakpoint).is_some_and(|&at| at <= self.pos) {
            pending = true;
            self.next_breakpoint += 1;
        }
        if pending {
            let line = self.peek().line as u32;
            let offset = self.emit_on_line(OpCode::Breakpoint, &[], 0, ChunkData::None, line)?;
            self.current.debug.breakpoints.push(offset as u32);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Scopes and variables
    // ---------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    /// Discards the locals of the innermost scope. With `keep_result` the
    /// value on top (the block's result) survives via POP_UNDER.
    fn end_scope(&mut self, keep_result: bool) -> Result<(), CompileError> {
        let depth = self.current.scope_depth;
        let count = self.current.locals.iter().rev().take_while(|l| l.depth >= depth).count();
        if count > 0 {
            let first = self.current.locals.len() - count;
            let lowest = self.current.locals[first].slot;
            if self.current.locals[first..].iter().any(|l| l.captured) {
                self.emit_u16(OpCode::CloseUpvalues, lowest, 0)?;
            }
            if keep_result {
                self.emit_u16(OpCode::PopUnder, count as u16, -(count as isize))?;
            } else {
                for _ in 0..count {
                    self.emit_op(OpCode::Pop, -1)?;
                }
            }
            let retired: Vec<Local> = self.current.locals.drain(first..).collect();
            for local in retired {
                self.current.retire_local(local);
            }
        }
        self.current.scope_depth -= 1;
        Ok(())
    }

    /// Declares a local whose value will be pushed next (slot = current height)
    fn declare_local(&mut self, name: &str, binding: Binding, token: &Token) -> Result<u16, CompileError> {
        let depth = self.current.scope_depth;
        if self.current.locals.iter().any(|l| l.name == name && l.depth >= depth) {
            return Err(self
                .error_at(token, format!("Variable '{}' is already declared in this scope", name))
                .with_help("use a different name, or assign without 'let' to update it".to_string()));
        }
        let slot = self.current.height;
        self.add_local(name, binding, slot, false, token)
    }

    fn add_local(
        &mut self,
        name: &str,
        binding: Binding,
        slot: usize,
        initialized: bool,
        token: &Token,
    ) -> Result<u16, CompileError> {
        let slot = u16::try_from(slot).map_err(|_| self.error_at(token, "Too many local variables in one function"))?;
        let start = self.current.code.len() as u32;
        self.current.locals.push(Local {
            name: name.to_string(),
            slot,
            depth: self.current.scope_depth,
            captured: false,
            initialized,
            binding,
            function: None,
            start,
        });
        Ok(slot)
    }

    fn mark_initialized(&mut self) {
        let start = self.current.code.len() as u32;
        if let Some(local) = self.current.locals.last_mut() {
            local.initialized = true;
            local.start = start;
        }
    }

    fn visible_names(&self) -> Vec<String> {
        let mut names = self.globals.global_names();
        let mut level: Option<&FunctionCompiler> = Some(&self.current);
        while let Some(fc) = level {
            names.extend(fc.locals.iter().filter(|l| l.initialized && !l.name.is_empty()).map(|l| l.name.clone()));
            level = fc.enclosing.as_deref();
        }
        names
    }

    /// Emits the load for an identifier
    fn named_variable(&mut self, name: &str, token: &Token) -> Result<(), CompileError> {
        if self.check_punct('(') && self.same_line() {
            if let Some(function) = find_function(&self.current, name, 0) {
                let index = self.add_constant(Constant::Function(function))?;
                self.emit_u32(OpCode::Const, index, 1)?;
                return Ok(());
            }
        }

        if let Some(resolved) = resolve_in(&mut self.current, name) {
            let mutable = resolved.binding.is_mutable();
            match resolved.access {
                Access::Local(slot) => {
                    let data = ChunkData::Local { slot, name: name.to_string(), mutable };
                    self.emit(OpCode::GetLocal, &slot.to_le_bytes(), 1, data)?;
                }
                Access::Upvalue(index) => {
                    let data = ChunkData::Upvalue { index, name: name.to_string(), mutable };
                    self.emit(OpCode::GetUpvalue, &index.to_le_bytes(), 1, data)?;
                }
            }
            return Ok(());
        }

        let index = self.string_constant(name)?;
        if self.check_op("=") {
            self.emit(OpCode::ConstId, &index.to_le_bytes(), 1, ChunkData::Unresolved(name.to_string()))?;
            return Ok(());
        }
        if self.globals.is_global(name) {
            self.emit_u32(OpCode::ConstId, index, 1)?;
            return Ok(());
        }

        let candidates = self.visible_names();
        let mut err = self.error_at(token, format!("Undefined variable '{}'", name));
        if let Some(suggestion) = find_closest_match(name, &candidates) {
            err = err.with_suggestion(suggestion.to_string());
        }
        Err(err)
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    fn statement(&mut self) -> Result<(), CompileError> {
        self.emit_pending_breakpoint()?;
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Keyword(keyword) => match keyword.as_str() {
                "let" => self.let_declaration(),
                "fn" if matches!(self.peek_at(1).kind, TokenKind::Identifier(_)) => self.fn_declaration(),
                "class" | "final" | "open" => self.class_declaration(),
                "if" if self.closes_block_with_total_form() => self.expression_statement(),
                "if" => self.if_statement(),
                "when" if self.closes_block_with_total_form() => {
                    self.when_form(WhenMode::Trailing)?;
                    self.emit(OpCode::Pop, &[], -1, ChunkData::ExprStatement)?;
                    self.match_punct(';');
                    Ok(())
                }
                "when" => self.when_form(WhenMode::Statement),
                "while" => self.while_statement(),
                "for" => self.for_statement(),
                "break" => self.break_statement(),
                "continue" => self.continue_statement(),
                "return" => self.return_statement(),
                _ => self.expression_statement(),
            },
            TokenKind::Punctuation('{') => {
                self.advance();
                self.begin_scope();
                self.block_body()?;
                self.end_scope(false)
            }
            TokenKind::Punctuation(';') => {
                self.advance();
                Ok(())
            }
            _ => self.expression_statement(),
        }
    }

    /// Statements up to and including the closing brace
    fn block_body(&mut self) -> Result<(), CompileError> {
        while !self.check_punct('}') {
            if self.is_at_end() {
                return Err(self.error("Expected '}' to close block, found end of file"));
            }
            self.statement()?;
        }
        self.advance();
        Ok(())
    }

    fn block_statement(&mut self, context: &str) -> Result<(), CompileError> {
        self.expect_punct('{', context)?;
        self.begin_scope();
        self.block_body()?;
        self.end_scope(false)
    }

    /// `{ ... }` in expression position (opening brace already consumed):
    /// the final expression statement is the value, nil otherwise
    fn block_expression(&mut self) -> Result<(), CompileError> {
        self.begin_scope();
        self.block_body()?;
        if !self.take_trailing_value() {
            self.emit_op(OpCode::ConstNil, 1)?;
        }
        self.end_scope(true)
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        if self.assignment(true)? == ExprOutcome::Value {
            self.emit(OpCode::Pop, &[], -1, ChunkData::ExprStatement)?;
        }
        self.match_punct(';');
        Ok(())
    }

    fn let_declaration(&mut self) -> Result<(), CompileError> {
        self.advance();
        let (name, token) = self.expect_identifier("variable name after 'let'")?;
        self.declare_local(&name, Binding::Variable, &token)?;
        self.expect_op("=", "after variable name")?;
        self.expression()?;
        self.mark_initialized();
        self.match_punct(';');
        Ok(())
    }

    fn fn_declaration(&mut self) -> Result<(), CompileError> {
        self.advance();
        let (name, token) = self.expect_identifier("function name")?;
        self.declare_local(&name, Binding::Function, &token)?;
        let function = Rc::new(self.function_body(FunctionKind::Function, &name)?);
        let capture_free = function.upvalues.is_empty();
        self.emit_closure(Rc::clone(&function))?;
        self.mark_initialized();
        if capture_free {
            if let Some(local) = self.current.locals.last_mut() {
                local.function = Some(function);
            }
        }
        Ok(())
    }

    /// Compiles parameters and body in a child compiler linked to the current one
    fn function_body(&mut self, kind: FunctionKind, name: &str) -> Result<Function, CompileError> {
        let child = Box::new(FunctionCompiler::new(kind, name));
        let parent = std::mem::replace(&mut self.current, child);
        self.current.enclosing = Some(parent);

        let result = self.function_body_inner();

        let Some(parent) = self.current.enclosing.take() else {
            return Err(self.error("internal compiler error: lost enclosing function"));
        };
        let child = std::mem::replace(&mut self.current, parent);
        result?;
        Ok(child.finish())
    }

    fn function_body_inner(&mut self) -> Result<(), CompileError> {
        self.begin_scope();
        self.expect_punct('(', "before parameters")?;
        if !self.check_punct(')') {
            loop {
                let (param, token) = self.expect_identifier("parameter name")?;
                self.declare_local(&param, Binding::Variable, &token)?;
                self.current.height += 1;
                self.mark_initialized();
                if self.current.arity == u8::MAX {
                    return Err(self.error_at(&token, "Too many parameters"));
                }
                self.current.arity += 1;

                if self.match_op("=") {
                    let default = self.literal_constant()?;
                    self.current.defaults.push(default);
                } else if !self.current.defaults.is_empty() {
                    return Err(self.error_at(&token, format!("Parameter '{}' must have a default value", param))
                        .with_help("required parameters must come before optional ones".to_string()));
                }

                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after parameters")?;

        if self.match_op("=") {
            self.expression()?;
            self.emit_op(OpCode::Return, -1)?;
            return Ok(());
        }

        self.expect_punct('{', "before function body")?;
        self.block_body()?;
        if !self.take_trailing_value() {
            self.emit_op(OpCode::ConstNil, 1)?;
        }
        self.emit_op(OpCode::Return, -1)?;
        Ok(())
    }

    /// A parameter default: literal values only
    fn literal_constant(&mut self) -> Result<Constant, CompileError> {
        let negative = self.match_op("-");
        let token = self.advance();
        let constant = match (&token.kind, negative) {
            (TokenKind::Int(n), false) => Constant::Int(*n),
            (TokenKind::Int(n), true) => Constant::Int(n.wrapping_neg()),
            (TokenKind::Double(d), false) => Constant::Double(*d),
            (TokenKind::Double(d), true) => Constant::Double(-d),
            (TokenKind::String(s), false) => Constant::Str(Rc::from(s.as_str())),
            (TokenKind::Keyword(k), false) if k == "true" => Constant::Int(1),
            (TokenKind::Keyword(k), false) if k == "false" => Constant::Int(0),
            (TokenKind::Keyword(k), false) if k == "nil" => Constant::Nil,
            _ => {
                return Err(self.error_at(&token, format!("Default values must be literals, found {}", token.describe())))
            }
        };
        Ok(constant)
    }

    fn class_declaration(&mut self) -> Result<(), CompileError> {
        let kind = if self.match_keyword("final") {
            ClassKind::Final
        } else if self.match_keyword("open") {
            ClassKind::Open
        } else {
            ClassKind::Regular
        };
        if !self.match_keyword("class") {
            return Err(self.error(format!("Expected 'class', found {}", self.peek().describe())));
        }
        let (name, token) = self.expect_identifier("class name")?;
        self.declare_local(&name, Binding::Class(kind), &token)?;

        let superclasses = if self.match_punct(':') { self.class_references(&name)? } else { 0 };
        let mixins = if self.match_keyword("with") { self.class_references(&name)? } else { 0 };

        self.expect_punct('{', "before class body")?;
        let mut members: Vec<String> = Vec::new();
        loop {
            self.skip_separators();
            if self.match_punct('}') {
                break;
            }
            if self.is_at_end() {
                return Err(self.error("Expected '}' to close class body, found end of file"));
            }

            let is_method = self.match_keyword("fn");
            let (member, member_token) = self.expect_identifier("member name")?;
            if members.contains(&member) {
                return Err(self.error_at(&member_token, format!("Member '{}' is already declared in class '{}'", member, name)));
            }
            let index = self.string_constant(&member)?;
            self.emit_u32(OpCode::Const, index, 1)?;
            if is_method {
                let method = self.function_body(FunctionKind::Method, &member)?;
                self.emit_closure(Rc::new(method))?;
            } else {
                self.expect_op("=", "after field name")?;
                self.expression()?;
            }
            members.push(member);
        }

        let count = u16::try_from(members.len()).map_err(|_| self.error_at(&token, "Too many class members"))?;
        let name_index = self.string_constant(&name)?;
        let mut operands = name_index.to_le_bytes().to_vec();
        operands.extend_from_slice(&[kind as u8, superclasses, mixins]);
        operands.extend_from_slice(&count.to_le_bytes());
        let consumed = superclasses as isize + mixins as isize + 2 * count as isize;
        self.emit(OpCode::Class, &operands, 1 - consumed, ChunkData::None)?;
        self.mark_initialized();
        Ok(())
    }

    /// Loads a comma-separated list of superclasses or mixins
    fn class_references(&mut self, class_name: &str) -> Result<u8, CompileError> {
        let mut count: u8 = 0;
        loop {
            let (name, token) = self.expect_identifier("class name")?;
            let known_final = match find_local(&self.current, &name, false) {
                Some(index) => self.current.locals[index].binding == Binding::Class(ClassKind::Final),
                None => resolve_upvalue(&mut self.current, &name)
                    .is_some_and(|r| r.binding == Binding::Class(ClassKind::Final)),
            };
            if known_final {
                return Err(self.error_at(&token, format!("Class '{}' cannot extend final class '{}'", class_name, name)));
            }
            self.named_variable(&name, &token)?;
            count = count.checked_add(1).ok_or_else(|| self.error_at(&token, "Too many superclasses"))?;
            if !self.match_punct(',') {
                return Ok(count);
            }
        }
    }

    /// Whether the `if`/`when` at the cursor has a branch for every path and
    /// is the last statement of its block, making its value the block's value
    fn closes_block_with_total_form(&self) -> bool {
        let end = if self.check_keyword("if") { self.total_if_end(self.pos) } else { self.total_when_end(self.pos) };
        let Some(mut at) = end else {
            return false;
        };
        while self.tokens.get(at).is_some_and(|t| t.is_punct(';')) {
            at += 1;
        }
        self.tokens.get(at).map_or(true, |t| t.is_punct('}') || t.kind == TokenKind::Eof)
    }

    /// Token index just past an `if` chain ending in a plain `else` block
    fn total_if_end(&self, at: usize) -> Option<usize> {
        let body = self.find_body(at + 1)?;
        let after = self.skip_group(body)?;
        if !self.tokens.get(after)?.is_keyword("else") {
            return None;
        }
        let next = self.tokens.get(after + 1)?;
        if next.is_keyword("if") {
            self.total_if_end(after + 1)
        } else if next.is_punct('{') {
            self.skip_group(after + 1)
        } else {
            None
        }
    }

    /// Token index just past a `when` whose body has an `else ->` arm
    fn total_when_end(&self, at: usize) -> Option<usize> {
        let body = self.find_body(at + 1)?;
        let end = self.skip_group(body)?;
        let mut depth = 0usize;
        let mut has_else = false;
        for i in body + 1..end - 1 {
            let token = &self.tokens[i];
            match token.kind {
                TokenKind::Punctuation('(' | '[' | '{') => depth += 1,
                TokenKind::Punctuation(')' | ']' | '}') => depth = depth.saturating_sub(1),
                _ if depth == 0
                    && token.is_keyword("else")
                    && self.tokens.get(i + 1).is_some_and(|t| t.is_operator("->")) =>
                {
                    has_else = true
                }
                _ => {}
            }
        }
        has_else.then_some(end)
    }

    /// Index of the first `{` outside parentheses and brackets
    fn find_body(&self, mut at: usize) -> Option<usize> {
        loop {
            match self.tokens.get(at)?.kind {
                TokenKind::Punctuation('{') => return Some(at),
                TokenKind::Punctuation('(' | '[') => at = self.skip_group(at)?,
                TokenKind::Punctuation(')' | ']' | '}') | TokenKind::Eof => return None,
                _ => at += 1,
            }
        }
    }

    /// Index just past the bracket group opening at `at`
    fn skip_group(&self, mut at: usize) -> Option<usize> {
        let mut depth = 0usize;
        loop {
            match self.tokens.get(at)?.kind {
                TokenKind::Punctuation('(' | '[' | '{') => depth += 1,
                TokenKind::Punctuation(')' | ']' | '}') => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(at + 1);
                    }
                }
                TokenKind::Eof => return None,
                _ => {}
            }
            at += 1;
        }
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        self.expression()?;
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, -1)?;
        self.block_statement("after 'if' condition")?;

        if self.match_keyword("else") {
            let end_jump = self.emit_jump(OpCode::Jump, 0)?;
            self.patch_jump(else_jump);
            if self.check_keyword("if") {
                self.if_statement()?;
            } else {
                self.block_statement("after 'else'")?;
            }
            self.patch_jump(end_jump);
        } else {
            self.patch_jump(else_jump);
        }
        Ok(())
    }

    /// `if` in expression position: both branches are required brace blocks
    fn if_expression(&mut self) -> Result<(), CompileError> {
        let if_token = self.advance();
        self.expression()?;
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, -1)?;
        self.expect_punct('{', "after 'if' condition")?;
        self.block_expression()?;

        if !self.match_keyword("else") {
            return Err(self
                .error_at(&if_token, "'if' used as an expression must have an 'else' branch")
                .with_help("add an 'else { ... }' branch".to_string()));
        }
        let end_jump = self.emit_jump(OpCode::Jump, 0)?;
        self.patch_jump(else_jump);
        // The else path starts without the then-branch value
        self.current.height -= 1;
        if self.check_keyword("if") {
            self.if_expression()?;
        } else {
            self.expect_punct('{', "after 'else'")?;
            self.block_expression()?;
        }
        self.patch_jump(end_jump);
        Ok(())
    }

    /// `when` with an optional subject
    fn when_form(&mut self, mode: WhenMode) -> Result<(), CompileError> {
        let produces_value = mode != WhenMode::Statement;
        let when_token = self.advance();
        let has_subject = !self.check_punct('{');
        if has_subject {
            self.expression()?;
        }
        self.expect_punct('{', "to open 'when' body")?;

        let base_height = self.current.height;
        let mut end_jumps = Vec::new();
        let mut has_else = false;
        loop {
            self.skip_separators();
            if self.check_punct('}') {
                break;
            }
            if self.is_at_end() {
                return Err(self.error("Expected '}' to close 'when', found end of file"));
            }
            if self.match_keyword("else") {
                self.expect_op("->", "after 'else'")?;
                self.when_branch(mode)?;
                has_else = true;
                self.skip_separators();
                break;
            }

            let mut body_jumps = Vec::new();
            loop {
                if has_subject {
                    self.emit_op(OpCode::Dup, 1)?;
                    self.expression()?;
                    self.emit_op(OpCode::Eq, -1)?;
                } else {
                    self.expression()?;
                }
                let next_condition = self.emit_jump(OpCode::JumpIfFalse, -1)?;
                body_jumps.push(self.emit_jump(OpCode::Jump, 0)?);
                self.patch_jump(next_condition);
                if !self.match_punct(',') {
                    break;
                }
            }
            let next_arm = self.emit_jump(OpCode::Jump, 0)?;
            for jump in body_jumps {
                self.patch_jump(jump);
            }
            self.expect_op("->", "after 'when' condition")?;
            self.when_branch(mode)?;
            end_jumps.push(self.emit_jump(OpCode::Jump, 0)?);
            self.patch_jump(next_arm);
            self.current.height = base_height;
        }
        self.expect_punct('}', "to close 'when'")?;

        if produces_value && !has_else {
            return Err(self
                .error_at(&when_token, "'when' used as an expression must have an 'else' branch")
                .with_help("add 'else -> value' as the last branch".to_string()));
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        if has_subject {
            if produces_value {
                self.emit_u16(OpCode::PopUnder, 1, -1)?;
            } else {
                self.emit_op(OpCode::Pop, -1)?;
            }
        }
        Ok(())
    }

    fn when_branch(&mut self, mode: WhenMode) -> Result<(), CompileError> {
        match mode {
            WhenMode::Expression => self.expression(),
            WhenMode::Statement if self.check_punct('{') => self.block_statement("to open branch"),
            WhenMode::Statement => {
                self.begin_scope();
                self.statement()?;
                self.end_scope(false)
            }
            WhenMode::Trailing if self.match_punct('{') => self.block_expression(),
            WhenMode::Trailing => {
                self.begin_scope();
                self.statement()?;
                if !self.take_trailing_value() {
                    self.emit_op(OpCode::ConstNil, 1)?;
                }
                self.end_scope(true)
            }
        }
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        let start = self.current.code.len();
        self.mark_jump_target();
        self.expression()?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, -1)?;

        let height = self.current.height;
        self.current.loops.push(LoopContext { start, height, breaks: Vec::new(), continues: Vec::new() });
        self.block_statement("after 'while' condition")?;
        self.emit_loop(start)?;
        self.patch_jump(exit_jump);
        self.close_loop()
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        let for_token = self.advance();
        let (variable, var_token) = self.expect_identifier("loop variable after 'for'")?;
        if !self.match_keyword("in") {
            return Err(self.error(format!("Expected 'in' after loop variable, found {}", self.peek().describe())));
        }

        self.begin_scope();
        let seq_slot = self.declare_local("(seq)", Binding::Variable, &for_token)?;
        self.expression()?;
        self.mark_initialized();
        self.declare_local("(idx)", Binding::Variable, &for_token)?;
        self.emit(OpCode::ConstInt, &0i64.to_le_bytes(), 1, ChunkData::None)?;
        self.mark_initialized();

        let start = self.current.code.len();
        self.mark_jump_target();
        let height = self.current.height;
        let mut operands = seq_slot.to_le_bytes().to_vec();
        operands.extend_from_slice(&[0; 4]);
        let exit_operand = self.emit(OpCode::ForIter, &operands, 1, ChunkData::None)? + 3;

        self.begin_scope();
        self.add_local(&variable, Binding::Variable, height, true, &var_token)?;
        self.current.loops.push(LoopContext { start, height, breaks: Vec::new(), continues: Vec::new() });
        self.expect_punct('{', "after 'for' sequence")?;
        self.block_body()?;
        self.end_scope(false)?;
        self.emit_loop(start)?;
        self.patch_jump(exit_operand);
        self.close_loop()?;
        self.end_scope(false)
    }

    /// Patches every break to the current offset and every continue to the loop start
    fn close_loop(&mut self) -> Result<(), CompileError> {
        let Some(ctx) = self.current.loops.pop() else {
            return Err(self.error("internal compiler error: no loop to close"));
        };
        let end = self.current.code.len();
        for jump in ctx.breaks {
            self.patch_jump_to(jump, end);
        }
        for jump in ctx.continues {
            self.patch_jump_to(jump, ctx.start);
        }
        self.mark_jump_target();
        Ok(())
    }

    /// Pops everything above the innermost loop's height, then emits a placeholder jump
    fn unwind_to_loop(&mut self, keyword: &str) -> Result<usize, CompileError> {
        let token = self.advance();
        let Some(target) = self.current.loops.last().map(|l| l.height) else {
            return Err(self.error_at(&token, format!("'{}' outside of a loop", keyword)));
        };
        let saved = self.current.height;
        let extra = saved - target;
        if extra > 0 {
            // Locals captured further down the body are not open yet on this path
            let captured = self.current.locals.iter().any(|l| l.captured && l.slot as usize >= target);
            if captured {
                self.emit_u16(OpCode::CloseUpvalues, target as u16, 0)?;
            }
            for _ in 0..extra {
                self.emit_op(OpCode::Pop, -1)?;
            }
        }
        let jump = self.emit_jump(OpCode::Jump, 0)?;
        self.current.height = saved;
        self.match_punct(';');
        Ok(jump)
    }

    fn break_statement(&mut self) -> Result<(), CompileError> {
        let jump = self.unwind_to_loop("break")?;
        if let Some(ctx) = self.current.loops.last_mut() {
            ctx.breaks.push(jump);
        }
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), CompileError> {
        let jump = self.unwind_to_loop("continue")?;
        if let Some(ctx) = self.current.loops.last_mut() {
            ctx.continues.push(jump);
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        if self.value_follows() {
            self.expression()?;
        } else {
            self.emit_op(OpCode::ConstNil, 1)?;
        }
        self.emit_op(OpCode::Return, -1)?;
        self.match_punct(';');
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn expression(&mut self) -> Result<(), CompileError> {
        self.assignment(false).map(|_| ())
    }

    /// Assignment is resolved after the fact: the target was compiled as a
    /// load, which is rolled back and replaced by the matching store
    fn assignment(&mut self, can_declare: bool) -> Result<ExprOutcome, CompileError> {
        self.elvis()?;
        if !self.check_op("=") {
            return Ok(ExprOutcome::Value);
        }
        let eq_token = self.advance();
        let Some(target) = self.rollback() else {
            return Err(self.error_at(&eq_token, "Invalid assignment target"));
        };

        match target.data {
            ChunkData::Local { slot, name, mutable } => {
                self.ensure_mutable(&name, mutable, &eq_token)?;
                self.assignment(false)?;
                self.emit_u16(OpCode::SetLocal, slot, 0)?;
            }
            ChunkData::Upvalue { index, name, mutable } => {
                self.ensure_mutable(&name, mutable, &eq_token)?;
                self.assignment(false)?;
                self.emit_u16(OpCode::SetUpvalue, index, 0)?;
            }
            ChunkData::Prop(name) => {
                self.assignment(false)?;
                self.emit_u32(OpCode::SetProp, name, -1)?;
            }
            ChunkData::Index => {
                self.assignment(false)?;
                self.emit_op(OpCode::SetIndex, -2)?;
            }
            ChunkData::Unresolved(name) => {
                if !can_declare {
                    return Err(self
                        .error_at(&eq_token, format!("Cannot declare '{}' inside an expression", name))
                        .with_help(format!("declare it first with 'let {} = ...'", name)));
                }
                let token = self.tokens[self.pos.saturating_sub(2)].clone();
                self.declare_local(&name, Binding::Variable, &token)?;
                self.assignment(false)?;
                self.mark_initialized();
                return Ok(ExprOutcome::Declared);
            }
            ChunkData::None | ChunkData::ExprStatement => {
                return Err(self.error_at(&eq_token, "Invalid assignment target"));
            }
        }
        Ok(ExprOutcome::Value)
    }

    fn ensure_mutable(&self, name: &str, mutable: bool, token: &Token) -> Result<(), CompileError> {
        if mutable {
            return Ok(());
        }
        Err(self.error_at(token, format!("Cannot assign to '{}': functions, classes and 'self' are immutable", name)))
    }

    fn elvis(&mut self) -> Result<(), CompileError> {
        self.or()?;
        while self.match_op("?:") {
            let jump = self.emit_jump(OpCode::JumpIfNotNilKeep, -1)?;
            self.or()?;
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<(), CompileError> {
        self.and()?;
        while self.match_keyword("or") || self.match_op("||") {
            let jump = self.emit_jump(OpCode::JumpIfTrueKeep, -1)?;
            self.and()?;
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn and(&mut self) -> Result<(), CompileError> {
        self.equality()?;
        while self.match_keyword("and") || self.match_op("&&") {
            let jump = self.emit_jump(OpCode::JumpIfFalseKeep, -1)?;
            self.equality()?;
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn equality(&mut self) -> Result<(), CompileError> {
        self.comparison()?;
        loop {
            let op = if self.match_op("==") {
                OpCode::Eq
            } else if self.match_op("!=") {
                OpCode::Ne
            } else {
                return Ok(());
            };
            self.comparison()?;
            self.emit_op(op, -1)?;
        }
    }

    fn comparison(&mut self) -> Result<(), CompileError> {
        self.range()?;
        loop {
            let op = if self.match_op("<") {
                OpCode::Lt
            } else if self.match_op("<=") {
                OpCode::Le
            } else if self.match_op(">") {
                OpCode::Gt
            } else if self.match_op(">=") {
                OpCode::Ge
            } else if self.match_keyword("is") {
                OpCode::Is
            } else {
                return Ok(());
            };
            self.range()?;
            self.emit_op(op, -1)?;
        }
    }

    fn range(&mut self) -> Result<(), CompileError> {
        self.term()?;
        if self.match_op("..") {
            self.term()?;
            self.emit_op(OpCode::Range, -1)?;
        }
        Ok(())
    }

    fn term(&mut self) -> Result<(), CompileError> {
        self.factor()?;
        loop {
            let op = if self.match_op("+") {
                OpCode::Add
            } else if self.check_op("-") && self.same_line() {
                self.advance();
                OpCode::Sub
            } else {
                return Ok(());
            };
            self.factor()?;
            self.emit_op(op, -1)?;
        }
    }

    fn factor(&mut self) -> Result<(), CompileError> {
        self.unary()?;
        loop {
            let op = if self.match_op("*") {
                OpCode::Mul
            } else if self.match_op("/") {
                OpCode::Div
            } else if self.match_op("%") {
                OpCode::Mod
            } else {
                return Ok(());
            };
            self.unary()?;
            self.emit_op(op, -1)?;
        }
    }

    fn unary(&mut self) -> Result<(), CompileError> {
        if self.match_op("-") {
            self.unary()?;
            self.emit_op(OpCode::Neg, 0)?;
        } else if self.match_op("!") || self.match_keyword("not") {
            self.unary()?;
            self.emit_op(OpCode::Not, 0)?;
        } else {
            self.call()?;
        }
        Ok(())
    }

    fn call(&mut self) -> Result<(), CompileError> {
        self.primary()?;
        loop {
            if self.check_punct('(') && self.same_line() {
                self.advance();
                let argc = self.arguments()?;
                self.emit(OpCode::Call, &[argc], -(argc as isize), ChunkData::None)?;
            } else if self.match_punct('.') {
                let (name, _) = self.expect_identifier("property name after '.'")?;
                let index = self.string_constant(&name)?;
                if self.check_punct('(') && self.same_line() {
                    self.advance();
                    let argc = self.arguments()?;
                    let mut operands = index.to_le_bytes().to_vec();
                    operands.push(argc);
                    self.emit(OpCode::Invoke, &operands, -(argc as isize), ChunkData::None)?;
                } else {
                    self.emit(OpCode::GetProp, &index.to_le_bytes(), 0, ChunkData::Prop(index))?;
                }
            } else if self.check_punct('[') && self.same_line() {
                self.advance();
                self.expression()?;
                self.expect_punct(']', "after index")?;
                self.emit(OpCode::GetIndex, &[], -1, ChunkData::Index)?;
            } else {
                return Ok(());
            }
        }
    }

    /// Arguments up to the closing parenthesis; returns the count
    fn arguments(&mut self) -> Result<u8, CompileError> {
        let mut argc: u8 = 0;
        if !self.check_punct(')') {
            loop {
                self.expression()?;
                argc = argc.checked_add(1).ok_or_else(|| self.error("Too many arguments"))?;
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after arguments")?;
        Ok(argc)
    }

    fn primary(&mut self) -> Result<(), CompileError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Int(n) => {
                self.advance();
                self.emit(OpCode::ConstInt, &n.to_le_bytes(), 1, ChunkData::None)?;
            }
            TokenKind::Double(d) => {
                self.advance();
                self.emit(OpCode::ConstDouble, &d.to_le_bytes(), 1, ChunkData::None)?;
            }
            TokenKind::String(s) => {
                self.advance();
                let index = self.string_constant(s)?;
                self.emit_u32(OpCode::Const, index, 1)?;
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.named_variable(name, &token)?;
            }
            TokenKind::Punctuation('(') => {
                self.advance();
                self.expression()?;
                self.expect_punct(')', "after expression")?;
            }
            TokenKind::Punctuation('[') => {
                self.advance();
                self.collection_literal()?;
            }
            TokenKind::Punctuation('{') => {
                self.advance();
                self.block_expression()?;
            }
            TokenKind::Keyword(keyword) => match keyword.as_str() {
                "true" | "false" => {
                    self.advance();
                    let value: i64 = if keyword == "true" { 1 } else { 0 };
                    self.emit(OpCode::ConstInt, &value.to_le_bytes(), 1, ChunkData::None)?;
                }
                "nil" => {
                    self.advance();
                    self.emit_op(OpCode::ConstNil, 1)?;
                }
                "self" => {
                    self.advance();
                    match resolve_in(&mut self.current, "self") {
                        Some(_) => self.named_variable("self", &token)?,
                        None => return Err(self.error_at(&token, "'self' can only be used inside a method")),
                    }
                }
                "fn" => {
                    self.advance();
                    let lambda = self.function_body(FunctionKind::Function, "<lambda>")?;
                    self.emit_closure(Rc::new(lambda))?;
                }
                "if" => self.if_expression()?,
                "when" => self.when_form(WhenMode::Expression)?,
                "yield" => {
                    self.advance();
                    if self.value_follows() {
                        self.expression()?;
                    } else {
                        self.emit_op(OpCode::ConstNil, 1)?;
                    }
                    self.emit_op(OpCode::Yield, 0)?;
                }
                _ => return Err(self.error_at(&token, format!("Expected expression, found {}", token.describe()))),
            },
            _ => return Err(self.error_at(&token, format!("Expected expression, found {}", token.describe()))),
        }
        Ok(())
    }

    /// `[a, b]`, `[]`, `["k": v]` or `[:]` (opening bracket consumed)
    fn collection_literal(&mut self) -> Result<(), CompileError> {
        if self.match_punct(']') {
            self.emit_u16(OpCode::List, 0, 1)?;
            return Ok(());
        }
        if self.check_punct(':') && self.peek_at(1).is_punct(']') {
            self.advance();
            self.advance();
            self.emit_u16(OpCode::Map, 0, 1)?;
            return Ok(());
        }

        self.expression()?;
        let is_map = self.match_punct(':');
        if is_map {
            self.expression()?;
        }
        let mut count: u16 = 1;
        while self.match_punct(',') {
            if self.check_punct(']') {
                break;
            }
            self.expression()?;
            if is_map {
                self.expect_punct(':', "between map key and value")?;
                self.expression()?;
            }
            count = count.checked_add(1).ok_or_else(|| self.error("Too many elements in literal"))?;
        }
        self.expect_punct(']', "to close literal")?;

        if is_map {
            self.emit_u16(OpCode::Map, count, 1 - 2 * count as isize)?;
        } else {
            self.emit_u16(OpCode::List, count, 1 - count as isize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::runtime::RuntimeContext;

    fn compile_code(code: &str) -> Result<Rc<Function>, CompileError> {
        let ctx = RuntimeContext::new();
        compile(&SourceFile::new("test.sd", code), &ctx)
    }

    fn ops(function: &Function) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < function.code.len() {
            let op = OpCode::from_byte(function.code[offset]).expect("valid opcode");
            ops.push(op);
            offset += op.size();
        }
        ops
    }

    #[test]
    fn test_last_expression_becomes_return() {
        let function = compile_code("1 + 2").unwrap();
        assert_eq!(ops(&function), vec![OpCode::ConstInt, OpCode::ConstInt, OpCode::Add, OpCode::Return]);
    }

    #[test]
    fn test_script_without_result_halts() {
        let function = compile_code("x = 1").unwrap();
        assert_eq!(ops(&function), vec![OpCode::ConstInt, OpCode::Halt]);
    }

    #[test]
    fn test_statement_block_pops_each_local() {
        let function = compile_code("{ let a = 1\n let b = 2 }").unwrap();
        assert_eq!(
            ops(&function),
            vec![OpCode::ConstInt, OpCode::ConstInt, OpCode::Pop, OpCode::Pop, OpCode::Halt]
        );
    }

    #[test]
    fn test_expression_block_uses_pop_under() {
        let function = compile_code("let r = { let a = 1\n let b = 2\n a + b }\nr").unwrap();
        let ops = ops(&function);
        assert!(ops.contains(&OpCode::PopUnder));
        assert!(!ops.contains(&OpCode::Pop));
        let listing = disassemble(&function);
        assert!(
            listing.lines().any(|l| l.contains("POP_UNDER") && l.ends_with(" 2")),
            "{}",
            listing
        );
    }

    #[test]
    fn test_if_expression_requires_else() {
        let err = compile_code("let x = if 1 { 2 }").unwrap_err();
        assert!(err.message.contains("must have an 'else' branch"), "{}", err.message);
        assert!(compile_code("let x = if 1 { 2 } else { 3 }\nx").is_ok());
    }

    #[test]
    fn test_when_expression_requires_else() {
        let err = compile_code("let x = when 1 { 1 -> 2 }").unwrap_err();
        assert!(err.message.contains("'when' used as an expression"));
    }

    #[test]
    fn test_redeclaration_is_error_but_shadowing_is_not() {
        let err = compile_code("let a = 1\nlet a = 2").unwrap_err();
        assert!(err.message.contains("already declared"));
        assert_eq!(err.line, 2);
        assert!(compile_code("let a = 1\n{ let a = 2 }").is_ok());
        assert!(compile_code("fn f(x, x) = x").is_err());
    }

    #[test]
    fn test_undefined_variable_suggests_name() {
        let err = compile_code("let count = 1\nprint(cuont)").unwrap_err();
        assert!(err.message.contains("Undefined variable 'cuont'"));
        assert_eq!(err.suggestion.as_deref(), Some("count"));
    }

    #[test]
    fn test_functions_and_classes_are_immutable() {
        assert!(compile_code("fn f() = 1\nf = 2").is_err());
        assert!(compile_code("class A {}\nA = 2").is_err());
    }

    #[test]
    fn test_break_closes_upvalues_only_when_captured() {
        let plain = compile_code("while true {\n let x = 1\n break\n}").unwrap();
        assert!(!ops(&plain).contains(&OpCode::CloseUpvalues));

        let code = "let fs = []\nwhile true {\n let x = 1\n fs.add(fn() = x)\n if x { break }\n}";
        let captured = compile_code(code).unwrap();
        let closes = ops(&captured).iter().filter(|op| **op == OpCode::CloseUpvalues).count();
        // One for the break, one for the end of the body
        assert_eq!(closes, 2);
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        let err = compile_code("break").unwrap_err();
        assert!(err.message.contains("outside of a loop"));
    }

    #[test]
    fn test_extending_final_class_is_error() {
        let err = compile_code("final class A {}\nclass B : A {}").unwrap_err();
        assert!(err.message.contains("cannot extend final class 'A'"));
        assert!(compile_code("open class A {}\nclass B : A {}").is_ok());
    }

    #[test]
    fn test_capture_free_call_uses_constant() {
        let function = compile_code("fn sq(x) = x * x\nfn g() = sq(3)\ng()").unwrap();
        let Some(Constant::Function(g)) = function.constants.iter().find(|c| matches!(c, Constant::Function(f) if f.name == "g")) else {
            panic!("g not compiled");
        };
        assert!(g.upvalues.is_empty(), "sq should not be captured");
        assert!(ops(g).contains(&OpCode::Const));
    }

    #[test]
    fn test_closure_captures_enclosing_local() {
        let function = compile_code("fn outer() { let n = 1\n fn inner() = n\n inner }").unwrap();
        let Some(Constant::Function(outer)) = function.constants.first() else { panic!("outer missing") };
        let Some(Constant::Function(inner)) = outer.constants.iter().find(|c| matches!(c, Constant::Function(_))) else {
            panic!("inner missing");
        };
        assert_eq!(inner.upvalues, vec![UpvalueDesc { is_local: true, index: 1 }]);
    }

    #[test]
    fn test_breakpoints_recorded() {
        let function = compile_code("let a = 1\n// @break\nlet b = 2\nb").unwrap();
        assert_eq!(function.debug.breakpoints.len(), 1);
        let offset = function.debug.breakpoints[0] as usize;
        assert_eq!(function.code[offset], OpCode::Breakpoint as u8);
        assert_eq!(function.debug.line_for(offset), Some(3));

        let ctx = RuntimeContext::new();
        let release = compile_with(
            &SourceFile::new("t.sd", "let a = 1\n// @break\na"),
            &ctx,
            LexOptions { breakpoints: false },
        )
        .unwrap();
        assert!(release.debug.breakpoints.is_empty());
    }

    #[test]
    fn test_optional_parameters() {
        let function = compile_code("fn f(a, b = 2, c = \"x\") = a").unwrap();
        let Some(Constant::Function(f)) = function.constants.first() else { panic!("f missing") };
        assert_eq!(f.arity, 3);
        assert_eq!(f.optional_params_start, 1);
        assert_eq!(f.default_values, vec![Constant::Int(2), Constant::Str(Rc::from("x"))]);
        assert!(compile_code("fn f(a = 1, b) = a").is_err());
    }

    #[test]
    fn test_declaration_only_at_statement_level() {
        assert!(compile_code("print(y = 2)").is_err());
    }
}
