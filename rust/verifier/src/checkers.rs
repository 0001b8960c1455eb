//! Frame-layout checks: the guard table and local slot operands.

use std::collections::HashSet;

use sable_bytecode::{Chunk, Instruction, Opcode, Operand};

use crate::r#static::{Violation, ViolationKind};

/// Guards must cover a non-empty range inside the code, recover on an
/// instruction boundary and store the payload in an existing local.
pub fn check_guards(chunk: &Chunk, boundaries: &HashSet<usize>, violations: &mut Vec<Violation>) {
    let length = chunk.code.len();
    for (index, guard) in chunk.guards.iter().enumerate() {
        if guard.start >= guard.end || guard.end as usize > length {
            violations.push(Violation::new(
                ViolationKind::GuardRange,
                index,
                guard.end as i64,
                length as i64,
                format!(
                    "guard {} covers ({}, {}] in code of length {}",
                    index, guard.start, guard.end, length
                ),
            ));
        }
        if !boundaries.contains(&(guard.recovery as usize)) {
            violations.push(Violation::new(
                ViolationKind::GuardRecovery,
                index,
                guard.recovery as i64,
                -1,
                format!(
                    "guard {} recovers at {}, which is not an instruction boundary",
                    index, guard.recovery
                ),
            ));
        }
        if let Some(slot) = guard.slot.filter(|slot| *slot >= chunk.locals_count) {
            violations.push(Violation::new(
                ViolationKind::GuardSlot,
                index,
                slot as i64,
                chunk.locals_count as i64,
                format!(
                    "guard {} stores into slot {} but the frame has {} local(s)",
                    index, slot, chunk.locals_count
                ),
            ));
        }
    }
}

pub fn check_local_slots(
    chunk: &Chunk,
    instructions: &[(usize, Instruction)],
    violations: &mut Vec<Violation>,
) {
    for (offset, instruction) in instructions {
        if !matches!(instruction.opcode, Opcode::GetLocal | Opcode::SetLocal) {
            continue;
        }
        let Some(slot) = instruction.operands.first().and_then(Operand::as_imm8) else {
            continue;
        };
        if slot >= chunk.locals_count {
            violations.push(Violation::new(
                ViolationKind::LocalSlot,
                *offset,
                slot as i64,
                chunk.locals_count as i64,
                format!(
                    "{} {} at {} exceeds the frame's {} local(s)",
                    instruction.opcode, slot, offset, chunk.locals_count
                ),
            ));
        }
    }
}
