//! Compile-time diagnostics
//!
//! Every error the scanner and compiler report flows through one value
//! type, so the CLI, the REPL, and the tests all see the same formatting:
//!
//! ```text
//! [line 3] Error at 'x': Already a variable with this name in this scope.
//! ```

use serde::{Deserialize, Serialize};

/// Error code for lexical errors
pub const CODE_SCAN: &str = "EM1001";
/// Error code for syntax errors
pub const CODE_SYNTAX: &str = "EM2001";
/// Error code for resource limits (locals, constants, jump distances)
pub const CODE_LIMIT: &str = "EM2002";

/// Where in the token stream an error was reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    /// At a concrete token; holds its lexeme
    Lexeme(String),
    /// At end of input
    Eof,
    /// At a lexical error, where the message already describes the input
    Bare,
}

/// A compile-time error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error code (e.g. "EM2001")
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Source line (1-indexed)
    pub line: u32,
    /// Token context for the `Error at '…'` fragment
    pub context: ErrorContext,
}

impl Diagnostic {
    /// Create a new diagnostic
    pub fn new(
        code: &str,
        message: impl Into<String>,
        line: u32,
        context: ErrorContext,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            line,
            context,
        }
    }

    /// Format as the single-line human-readable report
    pub fn to_human_string(&self) -> String {
        match &self.context {
            ErrorContext::Lexeme(lexeme) => {
                format!("[line {}] Error at '{}': {}", self.line, lexeme, self.message)
            }
            ErrorContext::Eof => format!("[line {}] Error at end: {}", self.line, self.message),
            ErrorContext::Bare => format!("[line {}] Error: {}", self.line, self.message),
        }
    }

    /// Format as a JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_human_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_human_format_at_token() {
        let diag = Diagnostic::new(
            CODE_SYNTAX,
            "Expect ';' after expression.",
            7,
            ErrorContext::Lexeme("}".to_string()),
        );
        assert_eq!(
            diag.to_human_string(),
            "[line 7] Error at '}': Expect ';' after expression."
        );
    }

    #[test]
    fn test_human_format_at_end() {
        let diag = Diagnostic::new(CODE_SYNTAX, "Expect expression.", 2, ErrorContext::Eof);
        assert_eq!(diag.to_human_string(), "[line 2] Error at end: Expect expression.");
    }

    #[test]
    fn test_human_format_bare() {
        let diag = Diagnostic::new(CODE_SCAN, "Unexpected character.", 1, ErrorContext::Bare);
        assert_eq!(diag.to_human_string(), "[line 1] Error: Unexpected character.");
    }

    #[test]
    fn test_json_round_trip() {
        let diag = Diagnostic::new(CODE_LIMIT, "Too many constants in one chunk.", 4, ErrorContext::Eof);
        let json = diag.to_json_string().unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diag);
    }
}
