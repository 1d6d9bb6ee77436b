//! Interactive REPL
//!
//! One VM lives for the whole session, so globals and function definitions
//! carry across lines. Errors report and the loop continues.

use anyhow::Result;
use ember_runtime::{InterpretError, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub fn run() -> Result<i32> {
    println!("ember {}", ember_runtime::VERSION);

    let mut editor = DefaultEditor::new()?;
    let history_path = dirs::config_dir().map(|dir| dir.join("ember").join("history.txt"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);

                match vm.interpret(&line) {
                    Ok(()) => {}
                    Err(InterpretError::Compile(diagnostics)) => {
                        for diagnostic in diagnostics {
                            eprintln!("{}", diagnostic);
                        }
                    }
                    Err(InterpretError::Runtime(error)) => eprintln!("{}", error),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        }
    }

    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.save_history(path);
    }

    Ok(0)
}
