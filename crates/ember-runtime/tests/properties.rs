//! Property-based invariants: interning, the hash table, the line map,
//! and jump arithmetic

mod common;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use ember_runtime::{compile, Chunk, GcRoots, Heap, Obj, ObjHandle, Opcode, Table, Value};
use proptest::prelude::*;

/// Decode a chunk instruction by instruction, collecting every boundary
/// offset and every jump target
fn walk_chunk(heap: &Heap, chunk: &Chunk) -> (HashSet<usize>, Vec<usize>) {
    let mut boundaries = HashSet::new();
    let mut targets = Vec::new();
    let mut offset = 0;

    while offset < chunk.code.len() {
        boundaries.insert(offset);
        let op = Opcode::try_from(chunk.code[offset]).expect("undecodable opcode");
        offset = match op {
            Opcode::Constant
            | Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::GetGlobal
            | Opcode::DefineGlobal
            | Opcode::SetGlobal
            | Opcode::GetUpvalue
            | Opcode::SetUpvalue
            | Opcode::Call => offset + 2,
            Opcode::ConstantLong => offset + 4,
            Opcode::Jump | Opcode::JumpIfFalse => {
                let delta =
                    ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
                targets.push(offset + 3 + delta);
                offset + 3
            }
            Opcode::Loop => {
                let delta =
                    ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
                targets.push(offset + 3 - delta);
                offset + 3
            }
            Opcode::Closure => {
                let index = chunk.code[offset + 1] as usize;
                let function = chunk.constants[index]
                    .as_obj()
                    .expect("closure constant must be a function");
                let upvalue_count = heap.function(function).upvalue_count;
                offset + 2 + 2 * upvalue_count
            }
            _ => offset + 1,
        };
    }

    (boundaries, targets)
}

/// Every jump in this chunk and in every nested function lands on an
/// instruction boundary
fn check_jump_targets(heap: &Heap, function: ObjHandle) {
    let chunk = &heap.function(function).chunk;
    let (boundaries, targets) = walk_chunk(heap, chunk);
    for target in targets {
        assert!(
            boundaries.contains(&target) || target == chunk.code.len(),
            "jump target {} is not an instruction boundary",
            target
        );
    }
    for constant in &chunk.constants {
        if let Some(handle) = constant.as_obj() {
            if matches!(heap.get(handle), Obj::Function(_)) {
                check_jump_targets(heap, handle);
            }
        }
    }
}

proptest! {
    /// Control-flow soup: loops, continue, break, and switch in one
    /// program. Whatever gets emitted, the jumps must be well-formed and
    /// the program must run to completion.
    #[test]
    fn prop_jump_targets_land_on_instruction_boundaries(
        limit in 1u32..8,
        skip in 0u32..8,
        stop in 0u32..8,
    ) {
        let source = format!(
            "var total = 0;
             for (var i = 0; i < {limit}; i = i + 1) {{
                 if (i == {skip}) {{ continue; }}
                 switch (i) {{
                     case {stop}: {{ var unused = i; break; }}
                     default: total = total + i;
                 }}
                 if (total > 30) break;
             }}
             print total;"
        );

        let mut heap = Heap::new();
        let function = compile(&source, &mut heap).expect("compile failed");
        check_jump_targets(&heap, function);

        // And the emitted code actually executes.
        common::eval_ok(&source);
    }

    /// Identical bytes intern to the identical object, across both
    /// construction paths; distinct bytes never collide.
    #[test]
    fn prop_interning_is_canonical(a in "[a-z]{0,12}", b in "[a-z]{0,12}") {
        let mut heap = Heap::new();
        let roots = GcRoots::default();
        let handle_a = heap.intern_owned(a.clone(), &roots);
        let handle_b = heap.intern_owned(b.clone(), &roots);
        prop_assert_eq!(handle_a == handle_b, a == b);

        // The borrowed-from-source representation dedupes against owned.
        let source: Rc<str> = Rc::from(format!("({})", a));
        let handle_slice = heap.intern_slice(&source, 1, 1 + a.len(), &roots);
        prop_assert_eq!(handle_slice, handle_a);
    }

    /// The open-addressed table agrees with a model map under arbitrary
    /// set/delete interleavings.
    #[test]
    fn prop_table_matches_model(
        ops in prop::collection::vec((any::<bool>(), 0u8..32, any::<u8>()), 0..200)
    ) {
        let heap = Heap::new();
        let mut table = Table::new();
        let mut model: HashMap<u8, u8> = HashMap::new();

        for (is_set, key, value) in ops {
            let table_key = Value::Number(key as f64);
            if is_set {
                table.set(&heap, table_key, Value::Number(value as f64));
                model.insert(key, value);
            } else {
                table.delete(&heap, table_key);
                model.remove(&key);
            }
        }

        for key in 0u8..32 {
            let expected = model.get(&key).map(|&v| Value::Number(v as f64));
            prop_assert_eq!(table.get(&heap, Value::Number(key as f64)), expected);
        }
    }

    /// `line_of` reproduces the exact line every byte was written with,
    /// and coalescing never produces more runs than line changes.
    #[test]
    fn prop_line_map_is_lossless(
        entries in prop::collection::vec((any::<u8>(), 0u32..3), 1..200)
    ) {
        let mut chunk = Chunk::new();
        let mut line = 1u32;
        let mut expected = Vec::new();

        for (byte, line_delta) in entries {
            line += line_delta;
            chunk.write(byte, line);
            expected.push(line);
        }

        for (offset, &line) in expected.iter().enumerate() {
            prop_assert_eq!(chunk.line_of(offset), Some(line));
        }
        prop_assert_eq!(chunk.line_of(expected.len()), None);

        let changes = expected.windows(2).filter(|pair| pair[0] != pair[1]).count();
        prop_assert_eq!(chunk.line_run_count(), changes + 1);
    }

    /// Arbitrary input never panics the front end: it compiles or reports
    /// diagnostics.
    #[test]
    fn prop_compile_never_panics(source in ".{0,60}") {
        let mut heap = Heap::new();
        let _ = compile(&source, &mut heap);
    }
}
