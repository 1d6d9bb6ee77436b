//! Stack-based virtual machine
//!
//! Executes compiled chunks with a value stack and call frames.
//! - Arithmetic is checked; `Add` is overloaded for interned string
//!   concatenation
//! - Locals live in frame-relative stack slots, globals in a hash table
//!   keyed by interned name
//! - Closures reach enclosing variables through upvalues: open ones point
//!   at live stack slots, closed ones own their value
//! - A runtime error resets the stacks and reports `[line N]` plus a
//!   stack trace; globals and interned strings survive for the next
//!   `interpret` call

mod frame;

pub use frame::CallFrame;

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::bytecode::Opcode;
use crate::compiler::compile;
use crate::diagnostic::Diagnostic;
use crate::heap::{GcRoots, Heap};
use crate::object::{Closure, Native, NativeFn, Obj, ObjHandle, Upvalue, UpvalueState};
use crate::table::Table;
use crate::value::Value;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;
/// Maximum value-stack depth
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Destination for `print`; swappable so embedders and tests capture output
pub type OutputWriter = Arc<Mutex<dyn Write + Send>>;

/// An `OutputWriter` over stdout
pub fn stdout_writer() -> OutputWriter {
    Arc::new(Mutex::new(std::io::stdout()))
}

/// One line of a runtime stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Source line of the active instruction in this frame
    pub line: u32,
    /// Function name, or `<script>` for the top level
    pub function: String,
}

/// A runtime error: message, source line, and the active call stack
/// (innermost frame first)
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)?;
        for frame in &self.trace {
            write!(f, "\n[line {}] in {}", frame.line, frame.function)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Outcome of `Vm::interpret`
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The program did not compile; diagnostics in source order
    #[error("compile error")]
    Compile(Vec<Diagnostic>),
    /// The program compiled but failed at runtime
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Virtual machine state
pub struct Vm {
    heap: Heap,
    /// Value stack
    stack: Vec<Value>,
    /// Call frames, innermost last
    frames: Vec<CallFrame>,
    /// Global variables, keyed by interned name
    globals: Table,
    /// Upvalues still pointing into the stack, sorted by slot descending
    open_upvalues: Vec<ObjHandle>,
    /// Destination for `print`
    output: OutputWriter,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM with the standard natives, printing to stdout
    pub fn new() -> Self {
        Self::with_output(stdout_writer())
    }

    /// Create a VM that prints to `output`
    pub fn with_output(output: OutputWriter) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            output,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    /// Redirect `print` output
    pub fn set_output_writer(&mut self, output: OutputWriter) {
        self.output = output;
    }

    /// Compile and run `source`. Globals and interned strings persist
    /// across calls, so a REPL can feed lines one at a time.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        // Anchor the script function while its closure allocates.
        self.push(Value::Obj(function))?;
        let closure = {
            let roots = GcRoots {
                stack: &self.stack,
                frames: &self.frames,
                open_upvalues: &self.open_upvalues,
                globals: Some(&self.globals),
                ..GcRoots::default()
            };
            self.heap.alloc(
                Obj::Closure(Closure {
                    function,
                    upvalues: Vec::new(),
                }),
                &roots,
            )
        };
        self.pop();
        self.push(Value::Obj(closure))?;
        self.call(closure, 0)?;

        self.run().map_err(InterpretError::Runtime)
    }

    /// Compile `source` and render its top-level chunk without running it
    pub fn disassemble(&mut self, source: &str) -> Result<String, Vec<Diagnostic>> {
        let function = compile(source, &mut self.heap)?;
        let chunk = &self.heap.function(function).chunk;
        Ok(crate::bytecode::disassemble(&self.heap, chunk, "<script>"))
    }

    /// The heap (read-only); useful for inspecting values from tests and
    /// embedding code
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Look up a global by name
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.find_interned(name)?;
        self.globals.get(&self.heap, Value::Obj(handle))
    }

    /// Push a value; exposed for native functions
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop a value; exposed for native functions
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // === Dispatch ===

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = match Opcode::try_from(byte) {
                Ok(op) => op,
                Err(invalid) => return Err(self.runtime_error(invalid.to_string())),
            };

            match op {
                Opcode::Constant => {
                    let index = self.read_byte() as usize;
                    let value = self.current_chunk().constants[index];
                    self.push(value)?;
                }
                Opcode::ConstantLong => {
                    let index = self.read_byte() as usize
                        | (self.read_byte() as usize) << 8
                        | (self.read_byte() as usize) << 16;
                    let value = self.current_chunk().constants[index];
                    self.push(value)?;
                }
                Opcode::Nil => self.push(Value::Nil)?,
                Opcode::True => self.push(Value::Bool(true))?,
                Opcode::False => self.push(Value::Bool(false))?,
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_constant();
                    match self.globals.get(&self.heap, name) {
                        Some(value) => self.push(value)?,
                        None => {
                            let message = self.undefined_variable(name);
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_constant();
                    let value = self.peek(0);
                    self.globals.set(&self.heap, name, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_constant();
                    let value = self.peek(0);
                    if self.globals.set(&self.heap, name, value) {
                        // Assignment may not create globals; undo and fail.
                        self.globals.delete(&self.heap, name);
                        let message = self.undefined_variable(name);
                        return Err(self.runtime_error(message));
                    }
                }
                Opcode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                Opcode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                Opcode::Greater => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a > b))?;
                }
                Opcode::Less => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a < b))?;
                }
                Opcode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b))?;
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a), Obj::String(_))
                            && matches!(self.heap.get(b), Obj::String(_)) =>
                    {
                        self.concatenate(a, b)?;
                    }
                    _ => {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        )
                    }
                },
                Opcode::Subtract => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a - b))?;
                }
                Opcode::Multiply => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a * b))?;
                }
                Opcode::Divide => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a / b))?;
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n))?;
                }

                Opcode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let mut writer = self.output.lock().expect("output writer poisoned");
                    let _ = writeln!(writer, "{}", text);
                }

                Opcode::Jump => {
                    let delta = self.read_u16() as usize;
                    self.frame_mut().ip += delta;
                }
                Opcode::JumpIfFalse => {
                    let delta = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += delta;
                    }
                }
                Opcode::Loop => {
                    let delta = self.read_u16() as usize;
                    self.frame_mut().ip -= delta;
                }

                Opcode::Call => {
                    let argument_count = self.read_byte();
                    let callee = self.peek(argument_count as usize);
                    self.call_value(callee, argument_count)?;
                }
                Opcode::Closure => {
                    let index = self.read_byte() as usize;
                    let function = self.current_chunk().constants[index]
                        .as_obj()
                        .expect("closure constant must be a function");
                    let upvalue_count = self.heap.function(function).upvalue_count;

                    let closure = {
                        let roots = GcRoots {
                            stack: &self.stack,
                            frames: &self.frames,
                            open_upvalues: &self.open_upvalues,
                            globals: Some(&self.globals),
                            ..GcRoots::default()
                        };
                        self.heap.alloc(
                            Obj::Closure(Closure {
                                function,
                                upvalues: Vec::with_capacity(upvalue_count),
                            }),
                            &roots,
                        )
                    };
                    // Anchor the closure before capturing: each capture may
                    // allocate an upvalue and collect.
                    self.push(Value::Obj(closure))?;

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.current_upvalue(index)
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(closure) => closure.upvalues.push(upvalue),
                            _ => unreachable!("closure handle changed kind"),
                        }
                    }
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::SwitchCaseEqual => {
                    let result = Value::Bool(self.peek(1) == self.peek(0));
                    self.push(result)?;
                }

                Opcode::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result)?;
                }
            }
        }
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, argument_count: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(handle) = callee {
            match self.heap.get(handle) {
                Obj::Closure(_) => return self.call(handle, argument_count),
                Obj::Native(native) => {
                    let (function, arity) = (native.function, native.arity);
                    if argument_count != arity {
                        let message = format!(
                            "Expected {} arguments but got {}.",
                            arity, argument_count
                        );
                        return Err(self.runtime_error(message));
                    }
                    let arguments_start = self.stack.len() - argument_count as usize;
                    let result = function(&self.stack[arguments_start..]);
                    match result {
                        Ok(value) => {
                            // Drop the call window, callee included.
                            self.stack.truncate(arguments_start - 1);
                            return self.push(value);
                        }
                        Err(message) => return Err(self.runtime_error(message)),
                    }
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions."))
    }

    fn call(&mut self, closure: ObjHandle, argument_count: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.get(closure) {
            Obj::Closure(closure) => closure.function,
            _ => unreachable!("call target must be a closure"),
        };
        let arity = self.heap.function(function).arity;

        if argument_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, argument_count);
            return Err(self.runtime_error(message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argument_count as usize - 1,
        });
        Ok(())
    }

    // === Upvalues ===

    /// Reuse the open upvalue for `slot` if one exists, else allocate it.
    /// The open list stays sorted by slot, largest first.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut insert_at = self.open_upvalues.len();
        for (position, &handle) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(handle).state {
                UpvalueState::Open(open_slot) if open_slot == slot => return handle,
                UpvalueState::Open(open_slot) if open_slot < slot => {
                    insert_at = position;
                    break;
                }
                _ => {}
            }
        }

        let upvalue = {
            let roots = GcRoots {
                stack: &self.stack,
                frames: &self.frames,
                open_upvalues: &self.open_upvalues,
                globals: Some(&self.globals),
                ..GcRoots::default()
            };
            self.heap.alloc(
                Obj::Upvalue(Upvalue {
                    state: UpvalueState::Open(slot),
                }),
                &roots,
            )
        };
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from_slot`, hoisting the
    /// stack value into the cell
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(handle).state {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(handle).state = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn current_upvalue(&self, index: usize) -> ObjHandle {
        match self.heap.get(self.frame().closure) {
            Obj::Closure(closure) => closure.upvalues[index],
            _ => unreachable!("active frame is not a closure"),
        }
    }

    // === Instruction reading ===

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn current_chunk(&self) -> &crate::bytecode::Chunk {
        match self.heap.get(self.frame().closure) {
            Obj::Closure(closure) => &self.heap.function(closure.function).chunk,
            _ => unreachable!("active frame is not a closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_chunk().code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        high << 8 | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    // === String operations ===

    fn concatenate(&mut self, a: ObjHandle, b: ObjHandle) -> Result<(), RuntimeError> {
        let mut text =
            String::with_capacity(self.heap.string(a).len() + self.heap.string(b).len());
        text.push_str(self.heap.string(a).as_str());
        text.push_str(self.heap.string(b).as_str());

        // The operands stay on the stack while the result allocates.
        let result = {
            let roots = GcRoots {
                stack: &self.stack,
                frames: &self.frames,
                open_upvalues: &self.open_upvalues,
                globals: Some(&self.globals),
                ..GcRoots::default()
            };
            self.heap.intern_owned(text, &roots)
        };
        self.pop();
        self.pop();
        self.push(Value::Obj(result))
    }

    // === Natives ===

    /// Register a native under `name`. The name and the native object are
    /// parked on the stack while the other allocates.
    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_handle = {
            let roots = GcRoots {
                stack: &self.stack,
                globals: Some(&self.globals),
                ..GcRoots::default()
            };
            self.heap.intern_owned(name.to_string(), &roots)
        };
        self.stack.push(Value::Obj(name_handle));

        let native_handle = {
            let roots = GcRoots {
                stack: &self.stack,
                globals: Some(&self.globals),
                ..GcRoots::default()
            };
            self.heap.alloc(
                Obj::Native(Native {
                    name,
                    arity,
                    function,
                }),
                &roots,
            )
        };
        self.stack.push(Value::Obj(native_handle));

        self.globals
            .set(&self.heap, self.stack[self.stack.len() - 2], self.stack[self.stack.len() - 1]);
        self.stack.pop();
        self.stack.pop();
    }

    // === Errors ===

    fn pop_number_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        Ok((a, b))
    }

    fn undefined_variable(&self, name: Value) -> String {
        let text = match name.as_obj() {
            Some(handle) => self.heap.string(handle).as_str().to_string(),
            None => "?".to_string(),
        };
        format!("Undefined variable '{}'.", text)
    }

    /// Build a runtime error from the current frame state, then reset the
    /// stacks. Globals and interned strings are preserved.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let line = self
            .frames
            .last()
            .and_then(|frame| self.line_at(frame))
            .unwrap_or(0);

        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = match self.heap.get(frame.closure) {
                Obj::Closure(closure) => closure.function,
                _ => continue,
            };
            let name = match self.heap.function(function).name {
                Some(name) => self.heap.string(name).as_str().to_string(),
                None => "<script>".to_string(),
            };
            trace.push(TraceFrame {
                line: self.line_at(frame).unwrap_or(0),
                function: name,
            });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError {
            message: message.into(),
            line,
            trace,
        }
    }

    /// Source line of the instruction a frame last executed
    fn line_at(&self, frame: &CallFrame) -> Option<u32> {
        let function = match self.heap.get(frame.closure) {
            Obj::Closure(closure) => closure.function,
            _ => return None,
        };
        let chunk = &self.heap.function(function).chunk;
        chunk.line_of(frame.ip.saturating_sub(1))
    }
}

/// `clock()`: seconds since the Unix epoch, as a number
fn native_clock(_args: &[Value]) -> Result<Value, String> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| Value::Number(elapsed.as_secs_f64()))
        .map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval(source: &str) -> (String, Result<(), InterpretError>) {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let writer: OutputWriter = buffer.clone();
        let mut vm = Vm::with_output(writer);
        let result = vm.interpret(source);
        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        (output, result)
    }

    fn eval_ok(source: &str) -> String {
        let (output, result) = eval(source);
        result.expect("program failed");
        output
    }

    fn eval_runtime_error(source: &str) -> RuntimeError {
        let (_, result) = eval(source);
        match result {
            Err(InterpretError::Runtime(error)) => error,
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_ok("print 1 + 2 * 3;"), "7\n");
        assert_eq!(eval_ok("print (1 + 2) * 3;"), "9\n");
        assert_eq!(eval_ok("print 10 - 4 / 2;"), "8\n");
        assert_eq!(eval_ok("print -3 + 1;"), "-2\n");
        assert_eq!(eval_ok("print 2.5 * 2;"), "5\n");
    }

    #[test]
    fn test_comparison_and_equality() {
        assert_eq!(eval_ok("print 1 < 2;"), "true\n");
        assert_eq!(eval_ok("print 2 <= 1;"), "false\n");
        assert_eq!(eval_ok("print \"a\" == \"a\";"), "true\n");
        assert_eq!(eval_ok("print \"a\" == \"b\";"), "false\n");
        assert_eq!(eval_ok("print nil == nil;"), "true\n");
        assert_eq!(eval_ok("print nil == false;"), "false\n");
        assert_eq!(eval_ok("print !nil;"), "true\n");
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval_ok("print \"foo\" + \"bar\";"), "foobar\n");
        assert_eq!(
            eval_ok("var s = \"a\"; s = s + \"b\" + \"c\"; print s;"),
            "abc\n"
        );
    }

    #[test]
    fn test_globals() {
        assert_eq!(eval_ok("var a = 1; a = a + 1; print a;"), "2\n");
    }

    #[test]
    fn test_globals_persist_across_interpret_calls() {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let writer: OutputWriter = buffer.clone();
        let mut vm = Vm::with_output(writer);
        vm.interpret("var counter = 41;").unwrap();
        vm.interpret("counter = counter + 1; print counter;").unwrap();
        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(output, "42\n");
    }

    #[test]
    fn test_globals_survive_a_runtime_error() {
        let mut vm = Vm::new();
        vm.interpret("var kept = 7;").unwrap();
        assert!(vm.interpret("kept + nil;").is_err());
        assert_eq!(vm.get_global("kept"), Some(Value::Number(7.0)));
    }

    #[test]
    fn test_negate_type_error() {
        let error = eval_runtime_error("print -\"text\";");
        assert_eq!(error.message, "Operand must be a number.");
        assert_eq!(error.line, 1);
    }

    #[test]
    fn test_add_type_error() {
        let error = eval_runtime_error("print 1 + \"text\";");
        assert_eq!(error.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn test_undefined_variable_get() {
        let error = eval_runtime_error("print missing;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn test_undefined_variable_set() {
        let error = eval_runtime_error("missing = 1;");
        assert_eq!(error.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn test_call_non_callable() {
        let error = eval_runtime_error("var x = 3; x();");
        assert_eq!(error.message, "Can only call functions.");
    }

    #[test]
    fn test_arity_mismatch() {
        let error = eval_runtime_error("fun f(a, b) { return a; } f(1);");
        assert_eq!(error.message, "Expected 2 arguments but got 1.");
    }

    #[test]
    fn test_stack_overflow_on_runaway_recursion() {
        let error = eval_runtime_error("fun loop() { loop(); } loop();");
        assert_eq!(error.message, "Stack overflow.");
        assert_eq!(error.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn test_stack_trace_shape() {
        let error = eval_runtime_error("fun inner() { return 1 + nil; }\nfun outer() { inner(); }\nouter();");
        assert_eq!(error.line, 1);
        assert_eq!(error.trace.len(), 3);
        assert_eq!(error.trace[0].function, "inner");
        assert_eq!(error.trace[1].function, "outer");
        assert_eq!(error.trace[2].function, "<script>");
        let rendered = error.to_string();
        assert!(rendered.starts_with("[line 1] Operands must be two numbers or two strings."));
        assert!(rendered.contains("in inner"));
        assert!(rendered.contains("in <script>"));
    }

    #[test]
    fn test_clock_native() {
        assert_eq!(eval_ok("print clock() > 0;"), "true\n");
    }

    #[test]
    fn test_native_arity_checked() {
        let error = eval_runtime_error("clock(1);");
        assert_eq!(error.message, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn test_print_value_formats() {
        assert_eq!(eval_ok("print nil;"), "nil\n");
        assert_eq!(eval_ok("print true;"), "true\n");
        assert_eq!(eval_ok("fun f() {} print f;"), "<fn f>\n");
        assert_eq!(eval_ok("print clock;"), "<native fn>\n");
    }
}
