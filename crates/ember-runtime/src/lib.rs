//! Ember runtime — core language implementation
//!
//! A small dynamically-typed scripting language:
//! - Single-pass Pratt compiler from source to stack bytecode
//! - Interned, garbage-collected heap strings and first-class functions
//!   with closures
//! - A bytecode VM with call frames, upvalues, and a globals table
//! - Precise mark-sweep collection over an object arena

/// Ember runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod heap;
pub mod object;
pub mod scanner;
pub mod span;
pub mod table;
pub mod token;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use bytecode::{disassemble, Chunk, Opcode};
pub use compiler::compile;
pub use diagnostic::{Diagnostic, ErrorContext};
pub use heap::{GcRoots, Heap};
pub use object::{Obj, ObjHandle};
pub use scanner::Scanner;
pub use span::Span;
pub use table::Table;
pub use token::{Token, TokenKind};
pub use value::Value;
pub use vm::{
    stdout_writer, InterpretError, OutputWriter, RuntimeError, TraceFrame, Vm,
};

/// Compile and run `source` in a fresh VM, printing to stdout
pub fn interpret(source: &str) -> Result<(), InterpretError> {
    Vm::new().interpret(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_interpret() {
        assert!(interpret("var x = 1 + 2;").is_ok());
        assert!(matches!(
            interpret("var x = ;"),
            Err(InterpretError::Compile(_))
        ));
        assert!(matches!(
            interpret("1 + nil;"),
            Err(InterpretError::Runtime(_))
        ));
    }
}
