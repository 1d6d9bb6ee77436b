//! Single-pass bytecode compiler
//!
//! A Pratt parser drives bytecode emission directly; there is no AST.
//! - Expressions leave exactly one value on the stack
//! - Locals live in stack slots addressed relative to the call frame
//! - Globals go through interned-name constants
//! - Nested functions compile on a stack of frames; resolving a name that
//!   belongs to an enclosing frame threads an upvalue chain outward
//!
//! Errors put the parser into panic mode; it synchronizes at the next
//! statement boundary and keeps reporting without emitting runnable code.

mod expr;
mod stmt;

use std::rc::Rc;

use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::{Diagnostic, ErrorContext, CODE_LIMIT, CODE_SCAN, CODE_SYNTAX};
use crate::heap::{GcRoots, Heap};
use crate::object::{Function, Obj, ObjHandle};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Locals are addressed by a one-byte slot operand
const MAX_LOCALS: usize = 256;
/// Upvalues are addressed by a one-byte index operand
const MAX_UPVALUES: usize = 256;
/// Scope depth marking a declared-but-uninitialized local
const UNINITIALIZED: i32 = -1;

/// Compile a program to its top-level function.
///
/// The returned function has arity 0 and no name; the VM wraps it in a
/// closure and calls it. On error, every diagnostic found before giving up
/// is returned.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjHandle, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let function = compiler.finish();
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

/// Whether a frame compiles the top-level script or a `fun` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// A local variable slot
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or `UNINITIALIZED` while the initializer compiles
    depth: i32,
    /// Set when an inner function captures this local
    captured: bool,
}

/// One `(is_local, index)` capture in a function's upvalue list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompiledUpvalue {
    index: u8,
    is_local: bool,
}

/// Syntactic construct a statement is nested inside; `break`/`continue`
/// validate against these and unwind the locals they cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextKind {
    Block,
    If,
    While,
    For,
    Switch,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    kind: ContextKind,
    /// Local count when the construct was entered; the unwinder pops back
    /// down to this
    locals_at_entry: usize,
}

/// Per-function compilation state
struct FrameState<'src> {
    kind: FunctionKind,
    /// Interned function name; `None` for the script frame
    name: Option<ObjHandle>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<CompiledUpvalue>,
    contexts: Vec<Context>,
}

impl<'src> FrameState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjHandle>) -> Self {
        // Slot zero holds the closure itself at runtime; reserve it with an
        // unnameable local.
        let locals = vec![Local {
            name: "",
            depth: 0,
            captured: false,
        }];
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            scope_depth: 0,
            upvalues: Vec::new(),
            contexts: Vec::new(),
        }
    }
}

/// Compiler state: scanner, one token of lookahead, and a stack of
/// function frames (innermost last)
pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    /// Shared copy of the source text; interned source-slice strings keep
    /// it alive past compilation
    source: Rc<str>,
    heap: &'h mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    frames: Vec<FrameState<'src>>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        Self {
            scanner: Scanner::new(source),
            source: Rc::from(source),
            heap,
            previous: Token::synthetic(),
            current: Token::synthetic(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            frames: vec![FrameState::new(FunctionKind::Script, None)],
        }
    }

    /// Close the script frame and allocate its function
    fn finish(&mut self) -> ObjHandle {
        let (function, _) = self.end_function();
        function
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at(self.current, CODE_SCAN, &message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // === Error reporting ===

    fn error_at(&mut self, token: Token<'src>, code: &str, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let context = match token.kind {
            TokenKind::Eof => ErrorContext::Eof,
            TokenKind::Error => ErrorContext::Bare,
            _ => ErrorContext::Lexeme(token.lexeme.to_string()),
        };
        self.diagnostics
            .push(Diagnostic::new(code, message, token.line, context));
    }

    /// Report at the previous token
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, CODE_SYNTAX, message);
    }

    /// Report at the current token
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, CODE_SYNTAX, message);
    }

    /// Report a resource-limit error at the previous token
    fn error_limit(&mut self, message: &str) {
        self.error_at(self.previous, CODE_LIMIT, message);
    }

    /// Leave panic mode by skipping to the next statement boundary
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emission ===

    fn current_frame(&self) -> &FrameState<'src> {
        self.frames.last().expect("no active compiler frame")
    }

    fn current_frame_mut(&mut self) -> &mut FrameState<'src> {
        self.frames.last_mut().expect("no active compiler frame")
    }

    fn current_offset(&self) -> usize {
        self.current_frame().chunk.current_offset()
    }

    /// Every emitted byte carries the previous token's source line
    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_frame_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: Opcode, second: Opcode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        self.emit_ops(Opcode::Nil, Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_frame_mut().chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error_limit("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(Opcode::Constant);
        self.emit_byte(index);
    }

    /// Emit a forward jump with a placeholder operand; returns the operand
    /// offset for `patch_jump`
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_offset() - 2
    }

    /// Resolve a forward jump to land at the current offset
    fn patch_jump(&mut self, offset: usize) {
        // The delta is measured from after the two operand bytes.
        let jump = self.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error_limit("Too much code to jump over.");
        }
        self.current_frame_mut()
            .chunk
            .patch_u16(offset, jump as u16);
    }

    /// Emit a back-edge to `loop_start`
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        let offset = self.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error_limit("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit a back-edge with a placeholder target (for `continue`, patched
    /// once the loop knows where its increment lives)
    fn emit_loop_placeholder(&mut self) -> usize {
        self.emit_op(Opcode::Loop);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_offset() - 2
    }

    /// Resolve a placeholder back-edge to `loop_start`
    fn patch_loop(&mut self, offset: usize, loop_start: usize) {
        let jump = offset + 2 - loop_start;
        if jump > u16::MAX as usize {
            self.error_limit("Loop body too large.");
        }
        self.current_frame_mut().chunk.patch_u16(offset, jump as u16);
    }

    // === Interning (GC-aware) ===

    /// Intern the source text under `token`'s span
    fn intern_token(&mut self, token: Token<'src>) -> ObjHandle {
        self.intern_range(token.span.start, token.span.end)
    }

    /// Intern a range of the source text, rooting every constant pool and
    /// function name currently under construction
    fn intern_range(&mut self, start: usize, end: usize) -> ObjHandle {
        let (pools, handles) = frame_roots(&self.frames);
        let roots = GcRoots {
            constants: &pools,
            handles: &handles,
            ..GcRoots::default()
        };
        self.heap.intern_slice(&self.source, start, end, &roots)
    }

    /// Intern an identifier and add it to the constant pool
    fn identifier_constant(&mut self, token: Token<'src>) -> u8 {
        let handle = self.intern_token(token);
        self.make_constant(Value::Obj(handle))
    }

    // === Scopes and locals ===

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame_index = self.frames.len() - 1;
        self.frames[frame_index].scope_depth -= 1;

        loop {
            let frame = &self.frames[frame_index];
            let Some(local) = frame.locals.last() else {
                break;
            };
            if local.depth <= frame.scope_depth {
                break;
            }
            if local.captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.frames[frame_index].locals.pop();
        }
    }

    /// Declare a local in the current scope; no-op at global scope
    fn declare_variable(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }

        let name = self.previous;
        let frame = self.current_frame();
        let mut duplicate = false;
        for local in frame.locals.iter().rev() {
            if local.depth != UNINITIALIZED && local.depth < frame.scope_depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.lexeme);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_frame().locals.len() == MAX_LOCALS {
            self.error_limit("Too many local variables in function.");
            return;
        }
        self.current_frame_mut().locals.push(Local {
            name,
            depth: UNINITIALIZED,
            captured: false,
        });
    }

    /// Parse a variable name; returns its global-name constant index, or 0
    /// for locals
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    /// Make the latest local visible; `var x = x;` errors because `x` keeps
    /// the sentinel depth until its initializer has compiled
    fn mark_initialized(&mut self) {
        let frame = self.current_frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(Opcode::DefineGlobal);
        self.emit_byte(global);
    }

    /// Resolve `name` in the locals of frame `frame_index`, walking newest
    /// to oldest so shadowing wins
    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let slot = self.frames[frame_index]
            .locals
            .iter()
            .rposition(|local| local.name == name)?;
        if self.frames[frame_index].locals[slot].depth == UNINITIALIZED {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Resolve `name` in an enclosing frame, recording the capture chain.
    /// Each nesting level gets its own `(is_local, index)` upvalue entry:
    /// `is_local` when the variable is a direct local of the immediately
    /// enclosing function, otherwise an index into that function's own
    /// upvalue list.
    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(frame_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.frames[frame_index]
            .upvalues
            .iter()
            .position(|upvalue| upvalue.index == index && upvalue.is_local == is_local);
        if let Some(position) = existing {
            return position as u8;
        }

        if self.frames[frame_index].upvalues.len() == MAX_UPVALUES {
            self.error_limit("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_index]
            .upvalues
            .push(CompiledUpvalue { index, is_local });
        (self.frames[frame_index].upvalues.len() - 1) as u8
    }

    // === Function frames ===

    /// Close the innermost frame: emit the implicit return, allocate the
    /// finished function, and hand back its upvalue list for the caller's
    /// `Closure` operands.
    fn end_function(&mut self) -> (ObjHandle, Vec<CompiledUpvalue>) {
        self.emit_return();
        let frame = self.frames.pop().expect("compiler frame underflow");
        let FrameState {
            name,
            arity,
            chunk,
            upvalues,
            ..
        } = frame;

        let function = Function {
            arity,
            upvalue_count: upvalues.len(),
            chunk,
            name,
        };

        // The enclosing frames' pools are roots; the function's own chunk
        // and name ride through the allocation as the pending object.
        let (pools, handles) = frame_roots(&self.frames);
        let roots = GcRoots {
            constants: &pools,
            handles: &handles,
            ..GcRoots::default()
        };
        let handle = self.heap.alloc(Obj::Function(function), &roots);
        (handle, upvalues)
    }
}

/// Collect GC roots held by the compiler itself: every constant pool and
/// function name of the frames still being built
fn frame_roots<'a, 'src>(
    frames: &'a [FrameState<'src>],
) -> (Vec<&'a [Value]>, Vec<ObjHandle>) {
    let pools = frames
        .iter()
        .map(|frame| frame.chunk.constants.as_slice())
        .collect();
    let handles = frames.iter().filter_map(|frame| frame.name).collect();
    (pools, handles)
}
