//! Bytecode disassembler
//!
//! Renders a chunk in a human-readable form: offset, source line (`|` when
//! unchanged), mnemonic, and decoded operands. Constants print their value,
//! jumps print their resolved target offset.

use super::{Chunk, Opcode};
use crate::heap::Heap;
use crate::value::Value;
use std::fmt::Write;

/// Disassemble a whole chunk under a `== name ==` header
pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "== {} ==", name).unwrap();

    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        output.push_str(&line);
        output.push('\n');
        offset = next;
    }

    output
}

/// Disassemble the instruction at `offset`.
///
/// Returns the rendered line and the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);

    let line = chunk.line_of(offset);
    let same_as_previous = offset > 0 && line == chunk.line_of(offset - 1);
    if same_as_previous {
        text.push_str("   | ");
    } else {
        write!(text, "{:4} ", line.unwrap_or(0)).unwrap();
    }

    let byte = chunk.code[offset];
    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(_) => {
            write!(text, "<invalid opcode {:#04x}>", byte).unwrap();
            return (text, offset + 1);
        }
    };

    match opcode {
        // No operands.
        Opcode::Nil
        | Opcode::True
        | Opcode::False
        | Opcode::Pop
        | Opcode::Equal
        | Opcode::Greater
        | Opcode::Less
        | Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Not
        | Opcode::Negate
        | Opcode::Print
        | Opcode::CloseUpvalue
        | Opcode::SwitchCaseEqual
        | Opcode::Return => {
            write!(text, "{:?}", opcode).unwrap();
            (text, offset + 1)
        }

        // One-byte constant index.
        Opcode::Constant | Opcode::GetGlobal | Opcode::DefineGlobal | Opcode::SetGlobal => {
            let index = read_u8(chunk, offset + 1) as usize;
            write!(
                text,
                "{:<16} {:4} '{}'",
                format!("{:?}", opcode),
                index,
                constant_text(heap, chunk, index)
            )
            .unwrap();
            (text, offset + 2)
        }

        // 24-bit little-endian constant index.
        Opcode::ConstantLong => {
            let index = read_u8(chunk, offset + 1) as usize
                | (read_u8(chunk, offset + 2) as usize) << 8
                | (read_u8(chunk, offset + 3) as usize) << 16;
            write!(
                text,
                "{:<16} {:4} '{}'",
                "ConstantLong",
                index,
                constant_text(heap, chunk, index)
            )
            .unwrap();
            (text, offset + 4)
        }

        // One-byte slot / upvalue / argument-count operand.
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call => {
            let operand = read_u8(chunk, offset + 1);
            write!(text, "{:<16} {:4}", format!("{:?}", opcode), operand).unwrap();
            (text, offset + 2)
        }

        // 16-bit big-endian jump deltas, relative to the post-operand IP.
        Opcode::Jump | Opcode::JumpIfFalse => {
            let delta = read_u16(chunk, offset + 1) as usize;
            let target = offset + 3 + delta;
            write!(
                text,
                "{:<16} {:4} (-> {:04})",
                format!("{:?}", opcode),
                delta,
                target
            )
            .unwrap();
            (text, offset + 3)
        }
        Opcode::Loop => {
            let delta = read_u16(chunk, offset + 1) as usize;
            let target = (offset + 3).saturating_sub(delta);
            write!(text, "{:<16} {:4} (-> {:04})", "Loop", delta, target).unwrap();
            (text, offset + 3)
        }

        // Function constant plus one (is_local, index) pair per upvalue.
        Opcode::Closure => {
            let index = read_u8(chunk, offset + 1) as usize;
            write!(
                text,
                "{:<16} {:4} {}",
                "Closure",
                index,
                constant_text(heap, chunk, index)
            )
            .unwrap();

            let upvalue_count = chunk
                .constants
                .get(index)
                .and_then(|value| value.as_obj())
                .map(|handle| heap.function(handle).upvalue_count)
                .unwrap_or(0);

            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = read_u8(chunk, next) != 0;
                let slot = read_u8(chunk, next + 1);
                write!(
                    text,
                    "\n{:04}    |   {} {}",
                    next,
                    if is_local { "local" } else { "upvalue" },
                    slot
                )
                .unwrap();
                next += 2;
            }
            (text, next)
        }
    }
}

fn read_u8(chunk: &Chunk, offset: usize) -> u8 {
    chunk.code.get(offset).copied().unwrap_or(0)
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    (read_u8(chunk, offset) as u16) << 8 | read_u8(chunk, offset + 1) as u16
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(value) => heap.format_value(*value),
        None => "<out of range>".to_string(),
    }
}
