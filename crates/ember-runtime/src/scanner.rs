//! Lexical analysis
//!
//! The scanner hands out tokens on demand; the parser holds the single token
//! of lookahead. Lexemes are slices of the source text, so the scanner
//! allocates nothing.

use crate::span::Span;
use crate::token::{Token, TokenKind};

/// Scanner state for tokenizing source code
pub struct Scanner<'src> {
    /// Original source text
    source: &'src str,
    /// Start of the token being scanned
    start: usize,
    /// Current byte position
    current: usize,
    /// Current line number (1-indexed)
    line: u32,
}

impl<'src> Scanner<'src> {
    /// Create a new scanner over the given source text
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan the next token
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b':' => self.make_token(TokenKind::Colon),
            b'?' => self.make_token(TokenKind::Question),
            b'!' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            b'"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    /// Scan a string literal. No escape sequences; newlines are allowed and
    /// counted.
    fn string(&mut self) -> Token<'src> {
        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        // The closing quote.
        self.advance();
        self.make_token(TokenKind::String)
    }

    /// Scan a number literal: digits with an optional decimal part
    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            // Consume the '.'.
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scan an identifier or keyword
    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }
        self.make_token(keyword_or_identifier(&self.source[self.start..self.current]))
    }

    /// Skip whitespace and `//` line comments
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while !self.is_at_end() && self.peek() != b'\n' {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    // === Character navigation ===

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source.as_bytes()[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    // === Token creation ===

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            span: Span::new(self.start, self.current),
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            span: Span::new(self.start, self.current),
            line: self.line,
        }
    }
}

/// Resolve an identifier lexeme to a keyword kind, or `Identifier`
fn keyword_or_identifier(lexeme: &str) -> TokenKind {
    match lexeme {
        "and" => TokenKind::And,
        "break" => TokenKind::Break,
        "case" => TokenKind::Case,
        "class" => TokenKind::Class,
        "continue" => TokenKind::Continue,
        "default" => TokenKind::Default,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "fun" => TokenKind::Fun,
        "if" => TokenKind::If,
        "nil" => TokenKind::Nil,
        "or" => TokenKind::Or,
        "print" => TokenKind::Print,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "switch" => TokenKind::Switch,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => TokenKind::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan_kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            scan_kinds("( ) { } , . - + ; / * : ?"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Colon,
                TokenKind::Question,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            scan_kinds("! != = == < <= > >="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            scan_kinds("var x = while_ fun break continue switch case default"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Identifier,
                TokenKind::Fun,
                TokenKind::Break,
                TokenKind::Continue,
                TokenKind::Switch,
                TokenKind::Case,
                TokenKind::Default,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let mut scanner = Scanner::new("12 3.5 7.");
        assert_eq!(scanner.scan_token().lexeme, "12");
        assert_eq!(scanner.scan_token().lexeme, "3.5");
        // A trailing dot is not part of the number.
        assert_eq!(scanner.scan_token().lexeme, "7");
        assert_eq!(scanner.scan_token().kind, TokenKind::Dot);
    }

    #[test]
    fn test_string_literal_spans_quotes() {
        let mut scanner = Scanner::new("\"hello\"");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"hello\"");
        assert_eq!(token.span, Span::new(0, 7));
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn test_line_counting_and_comments() {
        let mut scanner = Scanner::new("a // comment\nb\n\"x\ny\"\nc");
        assert_eq!(scanner.scan_token().line, 1); // a
        let b = scanner.scan_token();
        assert_eq!((b.lexeme, b.line), ("b", 2));
        // String literals count their internal newlines.
        let s = scanner.scan_token();
        assert_eq!((s.kind, s.line), (TokenKind::String, 4));
        assert_eq!(scanner.scan_token().line, 5); // c
    }

    #[test]
    fn test_unexpected_character() {
        let mut scanner = Scanner::new("@");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unexpected character.");
    }
}
