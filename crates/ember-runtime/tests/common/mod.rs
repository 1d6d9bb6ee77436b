//! Shared test helpers: run programs with captured `print` output

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ember_runtime::{InterpretError, OutputWriter, RuntimeError, Vm};

/// Run `source` in a fresh VM, returning captured output and the result
pub fn eval(source: &str) -> (String, Result<(), InterpretError>) {
    let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let writer: OutputWriter = buffer.clone();
    let mut vm = Vm::with_output(writer);
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    (output, result)
}

/// Run `source`, expecting success; returns captured output
pub fn eval_ok(source: &str) -> String {
    let (output, result) = eval(source);
    if let Err(error) = result {
        panic!("program failed: {:?}\noutput so far: {}", error, output);
    }
    output
}

/// Run `source`, expecting a runtime error
pub fn eval_runtime_error(source: &str) -> RuntimeError {
    let (output, result) = eval(source);
    match result {
        Err(InterpretError::Runtime(error)) => error,
        other => panic!(
            "expected runtime error, got {:?}\noutput: {}",
            other, output
        ),
    }
}

/// Run `source`, expecting compile errors
pub fn eval_compile_error(source: &str) -> Vec<ember_runtime::Diagnostic> {
    let (_, result) = eval(source);
    match result {
        Err(InterpretError::Compile(diagnostics)) => diagnostics,
        other => panic!("expected compile error, got {:?}", other),
    }
}
