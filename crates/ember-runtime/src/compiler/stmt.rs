//! Statement parsing and control-flow emission
//!
//! `break` and `continue` emit unresolved jumps and bubble them upward as
//! interruptor descriptors returned from `statement`; the enclosing loop or
//! `switch` patches the ones it owns and forwards the rest. Before its jump
//! is emitted, an interruptor pops every local belonging to the block
//! scopes between it and its target construct, plus the subject of any
//! `switch` a `continue` escapes.

use super::{Compiler, Context, ContextKind, FrameState, FunctionKind};
use crate::bytecode::Opcode;
use crate::token::TokenKind;
use crate::value::Value;

/// Which keyword produced an interruptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InterruptorKind {
    Break,
    Continue,
}

/// A pending control-flow edge: a `Jump` (break) or placeholder `Loop`
/// (continue) whose operand at `offset` awaits its owning construct
#[derive(Debug, Clone, Copy)]
pub(super) struct Interruptor {
    pub(super) kind: InterruptorKind,
    pub(super) offset: usize,
}

impl<'src, 'h> Compiler<'src, 'h> {
    /// Parse one declaration or statement
    pub(super) fn declaration(&mut self) -> Vec<Interruptor> {
        let interruptors = if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
            Vec::new()
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
            Vec::new()
        } else {
            self.statement()
        };

        if self.panic_mode {
            self.synchronize();
        }
        interruptors
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself recursively, so its name is usable
        // before the body finishes compiling.
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    /// Compile a `fun` body in its own frame and emit the closure
    fn function(&mut self) {
        let name = self.intern_token(self.previous);
        self.frames
            .push(FrameState::new(FunctionKind::Function, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_frame().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_frame_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        // Interruptors cannot cross a function boundary; validation already
        // rejected any that would.
        self.block();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(Opcode::Closure);
        self.emit_byte(constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    /// Parse one statement, returning the interruptors it emitted
    fn statement(&mut self) -> Vec<Interruptor> {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
            Vec::new()
        } else if self.match_token(TokenKind::For) {
            self.push_context(ContextKind::For);
            self.for_statement();
            self.pop_context();
            Vec::new()
        } else if self.match_token(TokenKind::If) {
            self.push_context(ContextKind::If);
            let interruptors = self.if_statement();
            self.pop_context();
            interruptors
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
            Vec::new()
        } else if self.match_token(TokenKind::While) {
            self.push_context(ContextKind::While);
            self.while_statement();
            self.pop_context();
            Vec::new()
        } else if self.match_token(TokenKind::Switch) {
            self.push_context(ContextKind::Switch);
            let interruptors = self.switch_statement();
            self.pop_context();
            interruptors
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.push_context(ContextKind::Block);
            let interruptors = self.block();
            self.pop_context();
            self.end_scope();
            interruptors
        } else if self.match_token(TokenKind::Break) {
            self.interruptor_statement(InterruptorKind::Break)
        } else if self.match_token(TokenKind::Continue) {
            self.interruptor_statement(InterruptorKind::Continue)
        } else {
            self.expression_statement();
            Vec::new()
        }
    }

    /// Parse declarations until the closing brace; interruptors are not
    /// captured by a bare block, so they forward upstream
    fn block(&mut self) -> Vec<Interruptor> {
        let mut interruptors = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            interruptors.extend(self.declaration());
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
        interruptors
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    fn if_statement(&mut self) -> Vec<Interruptor> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        let mut interruptors = self.statement();

        let else_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            interruptors.extend(self.statement());
        }
        self.patch_jump(else_jump);

        // Branches don't capture interruptors; forward them upstream.
        interruptors
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);

        let interruptors = self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);

        // Breaks land after the condition pop; continues re-test the
        // condition.
        for interruptor in interruptors {
            match interruptor.kind {
                InterruptorKind::Break => self.patch_jump(interruptor.offset),
                InterruptorKind::Continue => self.patch_loop(interruptor.offset, loop_start),
            }
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment compiles before the body but runs after it:
            // jump over it on entry, and make it the back-edge target.
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.current_offset();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let interruptors = self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop);
        }

        for interruptor in interruptors {
            match interruptor.kind {
                InterruptorKind::Break => self.patch_jump(interruptor.offset),
                InterruptorKind::Continue => self.patch_loop(interruptor.offset, loop_start),
            }
        }

        self.end_scope();
    }

    /// `switch` keeps its subject on the stack across all case tests.
    /// A matching case runs its statement and then falls to the *test* of
    /// the next case; `default` has no test, so it always runs when
    /// reached. Breaks jump to the subject pop at the end; continues belong
    /// to an enclosing loop and are forwarded.
    fn switch_statement(&mut self) -> Vec<Interruptor> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'switch' condition.");

        let mut interruptors = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                interruptors.extend(self.switch_case(false));
            } else if self.match_token(TokenKind::Default) {
                interruptors.extend(self.switch_case(true));
            } else {
                self.error_at_current("Expect 'case' or 'default' in 'switch' body.");
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after 'switch' statement.");

        let mut forwarded = Vec::new();
        for interruptor in interruptors {
            match interruptor.kind {
                InterruptorKind::Break => self.patch_jump(interruptor.offset),
                InterruptorKind::Continue => forwarded.push(interruptor),
            }
        }

        // The subject.
        self.emit_op(Opcode::Pop);

        forwarded
    }

    fn switch_case(&mut self, is_default: bool) -> Vec<Interruptor> {
        if !is_default {
            self.expression();
        }
        self.consume(TokenKind::Colon, "Expect ':' after switch case expression.");

        if is_default {
            return self.statement();
        }

        self.emit_op(Opcode::SwitchCaseEqual);
        let next_case = self.emit_jump(Opcode::JumpIfFalse);
        // Matched: drop the comparison result and the case value.
        self.emit_op(Opcode::Pop);
        self.emit_op(Opcode::Pop);

        let interruptors = self.statement();

        let skip = self.emit_jump(Opcode::Jump);
        self.patch_jump(next_case);
        // Unmatched: same two pops on the other path.
        self.emit_op(Opcode::Pop);
        self.emit_op(Opcode::Pop);
        self.patch_jump(skip);

        interruptors
    }

    /// Compile `break;` or `continue;`: validate placement, unwind locals,
    /// and emit the pending edge
    fn interruptor_statement(&mut self, kind: InterruptorKind) -> Vec<Interruptor> {
        let message = match kind {
            InterruptorKind::Break => "Expect ';' after 'break'.",
            InterruptorKind::Continue => "Expect ';' after 'continue'.",
        };
        self.consume(TokenKind::Semicolon, message);

        if !self.validate_interruptor(kind) {
            return Vec::new();
        }
        self.unwind_for_interruptor(kind);

        let offset = match kind {
            InterruptorKind::Break => self.emit_jump(Opcode::Jump),
            InterruptorKind::Continue => self.emit_loop_placeholder(),
        };
        vec![Interruptor { kind, offset }]
    }

    /// `break` needs an enclosing loop or `switch`; `continue` needs an
    /// enclosing loop
    fn validate_interruptor(&mut self, kind: InterruptorKind) -> bool {
        for context in self.current_frame().contexts.iter().rev() {
            match context.kind {
                ContextKind::While | ContextKind::For => return true,
                ContextKind::Switch if kind == InterruptorKind::Break => return true,
                _ => {}
            }
        }

        match kind {
            InterruptorKind::Break => {
                self.error("Can't use 'break' outside of a loop or 'switch' statement.");
            }
            InterruptorKind::Continue => {
                self.error("Can't use 'continue' outside of a loop.");
            }
        }
        false
    }

    /// Emit the pops that bring the stack back to the target construct's
    /// state: block locals declared since each crossed scope, and the
    /// subject of each `switch` a `continue` escapes
    fn unwind_for_interruptor(&mut self, kind: InterruptorKind) {
        let contexts: Vec<Context> = self.current_frame().contexts.clone();
        let mut live_locals = self.current_frame().locals.len();

        for context in contexts.iter().rev() {
            match context.kind {
                ContextKind::Block => {
                    for _ in context.locals_at_entry..live_locals {
                        self.emit_op(Opcode::Pop);
                    }
                    live_locals = context.locals_at_entry;
                }
                ContextKind::If => {}
                ContextKind::Switch => {
                    if kind == InterruptorKind::Continue {
                        // The subject stays under the case locals.
                        self.emit_op(Opcode::Pop);
                    } else {
                        return;
                    }
                }
                ContextKind::While | ContextKind::For => return,
            }
        }
    }

    fn push_context(&mut self, kind: ContextKind) {
        let locals_at_entry = self.current_frame().locals.len();
        self.current_frame_mut().contexts.push(Context {
            kind,
            locals_at_entry,
        });
    }

    fn pop_context(&mut self) {
        self.current_frame_mut().contexts.pop();
    }
}
