//! Static verification passes over decoded bytecode.
//!
//! Every pass works on the instruction list produced by the disassembler, so
//! the opcode table is the only description of stack effects and operand
//! shapes.  Passes never stop at the first problem: each violation is
//! recorded and the caller decides what to do with the report.  The module
//! cache refuses any chunk whose report is not clean.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use sable_bytecode::{
    disassemble, Chunk, Constant, ConstantRole, DecodeError, Instruction, Opcode, Operand,
    MAX_CHUNK_NESTING,
};
use serde::Serialize;
use thiserror::Error;

use crate::checkers;

/// Classification of a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A jump lands inside an instruction or outside the code.
    MisalignedJump,
    StackUnderflow,
    /// `DUP_AT` reaches below the bottom of the stack.
    DupOutOfRange,
    /// Two paths reach the same offset with different stack depths.
    StackMismatch,
    ConstantKind,
    /// `MAKE_FUNCTION`'s capture count disagrees with the body's header.
    BoundArity,
    GuardRange,
    GuardRecovery,
    GuardSlot,
    LocalSlot,
}

/// Detailed violation captured during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Byte offset of the offending instruction, or the guard index for
    /// guard-table violations.
    pub subject: usize,
    pub observed: i64,
    pub expected: i64,
    pub message: String,
}

impl Violation {
    pub(crate) fn new(
        kind: ViolationKind,
        subject: usize,
        observed: i64,
        expected: i64,
        message: String,
    ) -> Self {
        Self {
            kind,
            subject,
            observed,
            expected,
            message,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.kind, self.subject, self.message)
    }
}

/// Aggregate result for a single chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub violations: Vec<Violation>,
    /// Deepest operand stack reached by the simulation.
    pub max_stack: usize,
    /// Simulated depth after the last instruction.
    pub final_stack: usize,
}

impl VerificationReport {
    /// Returns true when no violations were recorded.
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Compact summary suitable for logs and JSON output.
    pub fn summary(&self) -> VerificationSummary {
        let first = self.violations.first();
        VerificationSummary {
            ok: first.is_none(),
            violation_count: self.violations.len(),
            first_violation_kind: first.map(|violation| violation.kind),
            first_violation_subject: first.map_or(0, |violation| violation.subject),
            max_stack: self.max_stack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    pub ok: bool,
    pub violation_count: usize,
    pub first_violation_kind: Option<ViolationKind>,
    pub first_violation_subject: usize,
    pub max_stack: usize,
}

impl fmt::Display for VerificationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first_violation_kind {
            None => write!(f, "ok (max stack {})", self.max_stack),
            Some(kind) => write!(
                f,
                "{} violation(s), first {:?} at {}",
                self.violation_count, kind, self.first_violation_subject
            ),
        }
    }
}

/// Report for one chunk of a nested chunk tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub name: String,
    /// Nesting depth; the root chunk is 0.
    pub depth: usize,
    pub report: VerificationReport,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("chunk {chunk} could not be decoded: {source}")]
    Decode {
        chunk: String,
        #[source]
        source: DecodeError,
    },
    #[error("chunk {chunk} failed verification: {summary}")]
    Rejected {
        chunk: String,
        summary: VerificationSummary,
        violations: Vec<Violation>,
    },
    #[error("chunk {chunk} nests deeper than {limit} levels")]
    TooDeep { chunk: String, limit: usize },
}

/// Run every pass over `chunk`.  Nested chunks are not visited.
pub fn verify(chunk: &Chunk) -> Result<VerificationReport, DecodeError> {
    let instructions = disassemble(chunk)?;
    let boundaries = instruction_boundaries(chunk, &instructions);

    let mut report = VerificationReport::default();
    check_jump_targets(&instructions, &boundaries, &mut report.violations);
    simulate_stack(chunk, &instructions, &mut report);
    check_constants(&instructions, &mut report.violations);
    checkers::check_guards(chunk, &boundaries, &mut report.violations);
    checkers::check_local_slots(chunk, &instructions, &mut report.violations);
    Ok(report)
}

/// Verify `chunk` and, depth first, every chunk reachable through its pool.
pub fn verify_tree(chunk: &Chunk) -> Result<Vec<ChunkReport>, VerifyError> {
    let mut reports = Vec::new();
    walk_tree(chunk, 0, &mut reports)?;
    Ok(reports)
}

fn walk_tree(
    chunk: &Chunk,
    depth: usize,
    reports: &mut Vec<ChunkReport>,
) -> Result<(), VerifyError> {
    if depth > MAX_CHUNK_NESTING {
        return Err(VerifyError::TooDeep {
            chunk: chunk.name().to_string(),
            limit: MAX_CHUNK_NESTING,
        });
    }
    let report = verify(chunk).map_err(|source| VerifyError::Decode {
        chunk: chunk.name().to_string(),
        source,
    })?;
    reports.push(ChunkReport {
        name: chunk.name().to_string(),
        depth,
        report,
    });
    for constant in &chunk.constants {
        if let Constant::Chunk(nested) = constant {
            walk_tree(nested, depth + 1, reports)?;
        }
    }
    Ok(())
}

/// Verify a chunk tree and return a copy with every `max_stack` restored
/// from the simulation.  Any violation rejects the whole tree.
pub fn seal(chunk: &Chunk) -> Result<Chunk, VerifyError> {
    seal_within(chunk, 0)
}

fn seal_within(chunk: &Chunk, depth: usize) -> Result<Chunk, VerifyError> {
    if depth > MAX_CHUNK_NESTING {
        return Err(VerifyError::TooDeep {
            chunk: chunk.name().to_string(),
            limit: MAX_CHUNK_NESTING,
        });
    }
    let report = verify(chunk).map_err(|source| VerifyError::Decode {
        chunk: chunk.name().to_string(),
        source,
    })?;
    if !report.ok() {
        return Err(VerifyError::Rejected {
            chunk: chunk.name().to_string(),
            summary: report.summary(),
            violations: report.violations,
        });
    }

    let mut sealed = chunk.clone();
    sealed.max_stack = u16::try_from(report.max_stack).unwrap_or(u16::MAX);
    for constant in &mut sealed.constants {
        if let Constant::Chunk(nested) = constant {
            let nested = seal_within(nested, depth + 1)?;
            *constant = Constant::Chunk(Rc::new(nested));
        }
    }
    Ok(sealed)
}

/// Instruction start offsets plus the end of the code.
fn instruction_boundaries(chunk: &Chunk, instructions: &[(usize, Instruction)]) -> HashSet<usize> {
    let mut boundaries: HashSet<usize> = instructions.iter().map(|(offset, _)| *offset).collect();
    boundaries.insert(chunk.code.len());
    boundaries
}

fn jump_target(offset: usize, instruction: &Instruction) -> Option<i64> {
    instruction
        .jump_offset()
        .map(|relative| offset as i64 + instruction.size() as i64 + relative as i64)
}

fn check_jump_targets(
    instructions: &[(usize, Instruction)],
    boundaries: &HashSet<usize>,
    violations: &mut Vec<Violation>,
) {
    for (offset, instruction) in instructions {
        let Some(target) = jump_target(*offset, instruction) else {
            continue;
        };
        let aligned = usize::try_from(target)
            .map(|target| boundaries.contains(&target))
            .unwrap_or(false);
        if !aligned {
            violations.push(Violation::new(
                ViolationKind::MisalignedJump,
                *offset,
                target,
                -1,
                format!(
                    "{} at {} targets {}, which is not an instruction boundary",
                    instruction.opcode, offset, target
                ),
            ));
        }
    }
}

/// Linear stack simulation.
///
/// A forward jump target takes the depth recorded at the jump site, the same
/// rule the assembler applies when a label is bound, so the final depth here
/// matches the assembler's tracked depth for any sequence it accepted.
/// Guard recovery offsets are entered with an empty operand stack.
fn simulate_stack(
    chunk: &Chunk,
    instructions: &[(usize, Instruction)],
    report: &mut VerificationReport,
) {
    let code_length = chunk.code.len();
    let mut depth = 0usize;
    let mut entry_depths: HashMap<usize, usize> = HashMap::new();
    let mut pending: HashMap<usize, usize> = chunk
        .guards
        .iter()
        .map(|guard| (guard.recovery as usize, 0))
        .collect();
    let mut falls_through = true;

    for (offset, instruction) in instructions {
        if let Some(recorded) = pending.remove(offset) {
            if falls_through && recorded != depth {
                report.violations.push(mismatch(*offset, depth, recorded));
            }
            depth = recorded;
        }
        entry_depths.insert(*offset, depth);

        if instruction.opcode == Opcode::DupAt {
            let index = instruction.operands.first().and_then(Operand::as_imm8);
            if let Some(index) = index.filter(|index| *index as usize >= depth) {
                report.violations.push(Violation::new(
                    ViolationKind::DupOutOfRange,
                    *offset,
                    index as i64,
                    depth as i64 - 1,
                    format!("DUP_AT {index} at {offset} reaches below a stack of depth {depth}"),
                ));
            }
        }

        let pops = instruction.pops();
        if pops > depth {
            report.violations.push(Violation::new(
                ViolationKind::StackUnderflow,
                *offset,
                depth as i64 - pops as i64,
                0,
                format!(
                    "{} at {} pops {} value(s) from a stack of depth {}",
                    instruction.opcode, offset, pops, depth
                ),
            ));
            depth = 0;
        } else {
            depth -= pops;
        }
        depth += instruction.pushes();
        report.max_stack = report.max_stack.max(depth);

        if let Some(target) = jump_target(*offset, instruction) {
            if let Ok(target) = usize::try_from(target) {
                if target > *offset {
                    match pending.entry(target) {
                        Entry::Occupied(recorded) if *recorded.get() != depth => {
                            report
                                .violations
                                .push(mismatch(target, depth, *recorded.get()));
                        }
                        Entry::Occupied(_) => {}
                        Entry::Vacant(slot) => {
                            slot.insert(depth);
                        }
                    }
                } else if let Some(&recorded) = entry_depths.get(&target) {
                    if recorded != depth {
                        report.violations.push(mismatch(target, depth, recorded));
                    }
                }
            }
        }

        falls_through = !matches!(
            instruction.opcode,
            Opcode::Jump | Opcode::Return | Opcode::Throw
        );
    }

    if let Some(recorded) = pending.remove(&code_length) {
        if falls_through && recorded != depth {
            report.violations.push(mismatch(code_length, depth, recorded));
        }
        depth = recorded;
    }
    report.final_stack = depth;
}

fn mismatch(target: usize, observed: usize, expected: usize) -> Violation {
    Violation::new(
        ViolationKind::StackMismatch,
        target,
        observed as i64,
        expected as i64,
        format!("offset {target} is reached with stack depths {observed} and {expected}"),
    )
}

fn role_name(role: ConstantRole) -> &'static str {
    match role {
        ConstantRole::Any => "any",
        ConstantRole::Symbol => "string",
        ConstantRole::Body => "chunk",
    }
}

fn check_constants(instructions: &[(usize, Instruction)], violations: &mut Vec<Violation>) {
    for (offset, instruction) in instructions {
        let operation = instruction.operation();
        for (index, operand) in instruction.operands.iter().enumerate() {
            let Operand::Constant(constant) = operand else {
                continue;
            };
            let role = operation.constant_role(index);
            let fits = match role {
                ConstantRole::Any => true,
                ConstantRole::Symbol => matches!(constant, Constant::String(_)),
                ConstantRole::Body => matches!(constant, Constant::Chunk(_)),
            };
            if !fits {
                violations.push(Violation::new(
                    ViolationKind::ConstantKind,
                    *offset,
                    index as i64,
                    -1,
                    format!(
                        "{} at {} expects a {} constant, found {}",
                        instruction.opcode,
                        offset,
                        role_name(role),
                        constant.kind()
                    ),
                ));
            }
        }

        if instruction.opcode == Opcode::MakeFunction {
            let body = instruction.operands.first().and_then(Operand::as_constant);
            let captured = instruction.operands.get(1).and_then(Operand::as_imm8);
            if let (Some(Constant::Chunk(body)), Some(captured)) = (body, captured) {
                if body.bound_arg_count != captured {
                    violations.push(Violation::new(
                        ViolationKind::BoundArity,
                        *offset,
                        captured as i64,
                        body.bound_arg_count as i64,
                        format!(
                            "MAKE_FUNCTION at {} captures {} value(s) but {} declares {}",
                            offset,
                            captured,
                            body.name(),
                            body.bound_arg_count
                        ),
                    ));
                }
            }
        }
    }
}
