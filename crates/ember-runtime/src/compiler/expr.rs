//! Expression parsing
//!
//! Pratt precedence climbing over a per-token rule table. Each token kind
//! maps to an optional prefix handler, an optional infix handler, and the
//! precedence its infix form binds at.

use super::Compiler;
use crate::bytecode::Opcode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Binding strength, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `?`
    Question,
    /// `:`
    Colon,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` unary `-`
    Unary,
    /// `()`
    Call,
    Primary,
}

impl Precedence {
    /// The next-tighter level; used for left-associative infix operands
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Question,
            Question => Colon,
            Colon => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// The rule table, expressed as a total match over token kinds
fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;

    fn make<'src, 'h>(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'h> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        LeftParen => make(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Minus => make(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => make(None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => make(None, Some(Compiler::binary), Precedence::Factor),
        Question => make(None, Some(Compiler::ternary), Precedence::Question),
        Bang => make(Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => make(None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            make(None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => make(Some(Compiler::variable), None, Precedence::None),
        String => make(Some(Compiler::string), None, Precedence::None),
        Number => make(Some(Compiler::number), None, Precedence::None),
        And => make(None, Some(Compiler::and_), Precedence::And),
        Or => make(None, Some(Compiler::or_), Precedence::Or),
        False | Nil | True => make(Some(Compiler::literal), None, Precedence::None),
        _ => make(None, None, Precedence::None),
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    /// Parse any expression
    pub(super) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Core Pratt loop: one prefix handler, then infix handlers while the
    /// lookahead binds at least as tightly as `precedence`.
    ///
    /// `can_assign` rides along so that only targets parsed directly at
    /// assignment precedence accept an `=`; anything tighter that still
    /// sees a trailing `=` is an invalid target.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    // === Prefix handlers ===

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        // Trim the surrounding quotes; the bytes stay borrowed from the
        // source text.
        let span = self.previous.span;
        let handle = self.intern_range(span.start + 1, span.end - 1);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            _ => unreachable!("literal handler on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        // Compile the operand first; the operator applies to its result.
        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            _ => unreachable!("unary handler on non-unary token"),
        }
    }

    // === Infix handlers ===

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(Opcode::Equal, Opcode::Not),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => self.emit_ops(Opcode::Greater, Opcode::Not),
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            _ => unreachable!("binary handler on non-binary token"),
        }
    }

    /// `and` short-circuits by leaving the falsey left operand in place
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);

        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    /// `or` short-circuits by jumping over the right operand when the left
    /// is truthy
    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `c ? a : b` — the condition is already on the stack
    fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Colon);

        self.consume(TokenKind::Colon, "Expect ':' after then branch of '?:' expression.");

        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        // Parse the else branch at '?' precedence so chains nest to the right.
        self.parse_precedence(Precedence::Question);

        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argument_count = self.argument_list();
        self.emit_op(Opcode::Call);
        self.emit_byte(argument_count);
    }

    // === Shared pieces ===

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_index = self.frames.len() - 1;

        let (get_op, set_op, argument) =
            if let Some(slot) = self.resolve_local(frame_index, name.lexeme) {
                (Opcode::GetLocal, Opcode::SetLocal, slot)
            } else if let Some(upvalue) = self.resolve_upvalue(frame_index, name.lexeme) {
                (Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue)
            } else {
                let constant = self.identifier_constant(name);
                (Opcode::GetGlobal, Opcode::SetGlobal, constant)
            };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(argument);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }
}
