use std::collections::BTreeMap;

use crate::bytecode::{ConstPool, Constant, FunctionInfo, Instruction, Opcode};
use crate::UmkaResult;

use super::OptimizePass;

/// How far behind a conditional jump the pre-pass looks for contributing
/// `LOAD`s before giving up.
const BRANCH_SCAN_WINDOW: usize = 20;

/// Minimum number of tracked local slots, regardless of metadata.
const MIN_TRACKED_LOCALS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Known {
    Int(i64),
    Double(f64),
}

impl Known {
    fn constant(self) -> Constant {
        match self {
            Known::Int(v) => Constant::Int(v),
            Known::Double(v) => Constant::Double(v),
        }
    }
}

/// Rewrites `LOAD`s of locals whose last store was a known constant into
/// `PUSH_CONST`, interning the constant when it is not already pooled.
///
/// The rewrite is suppressed for locals that feed a branch condition or are
/// stored to again before the next barrier. Barriers (`JMP*`, `CALL`,
/// `CALL_METHOD`, `RETURN`) invalidate all tracked knowledge.
pub struct ConstantPropagation;

impl OptimizePass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "constant-propagation"
    }

    fn run(
        &self,
        code: &mut Vec<Instruction>,
        pool: &ConstPool,
        _functions: &BTreeMap<u64, FunctionInfo>,
        meta: &FunctionInfo,
    ) -> UmkaResult<()> {
        let locals_size = meta.local_count.max(MIN_TRACKED_LOCALS);
        let used_in_jump = locals_feeding_branches(code, locals_size);

        let mut stack: Vec<Option<Known>> = Vec::new();
        let mut locals: Vec<Option<Known>> = vec![None; locals_size];

        for ip in 0..code.len() {
            let instruction = code[ip];
            match instruction.opcode {
                Opcode::PushConst => {
                    stack.push(read_const(pool, instruction.operand));
                }
                Opcode::Load => {
                    let slot = usize::try_from(instruction.operand).ok();
                    let known = slot
                        .filter(|&slot| slot < locals.len())
                        .and_then(|slot| locals[slot]);
                    if let (Some(slot), Some(value)) = (slot, known) {
                        if !used_in_jump[slot] && !written_later(code, slot, ip) {
                            let index = pool.intern(value.constant());
                            code[ip] = Instruction::new(Opcode::PushConst, index);
                        }
                    }
                    stack.push(known);
                }
                Opcode::Store => {
                    let value = stack.pop().flatten();
                    if let Some(slot) = usize::try_from(instruction.operand)
                        .ok()
                        .filter(|&slot| slot < locals.len())
                    {
                        locals[slot] = value;
                    }
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::Eq
                | Opcode::Neq
                | Opcode::Gt
                | Opcode::Lt
                | Opcode::Gte
                | Opcode::Lte
                | Opcode::And
                | Opcode::Or
                | Opcode::Opcot => {
                    stack.pop();
                    stack.pop();
                    stack.push(None);
                }
                Opcode::Not
                | Opcode::ToString
                | Opcode::ToInt
                | Opcode::ToDouble
                | Opcode::GetField => {
                    stack.pop();
                    stack.push(None);
                }
                Opcode::Pop => {
                    stack.pop();
                }
                Opcode::SetField => {
                    stack.pop();
                    stack.pop();
                }
                Opcode::BuildArr => {
                    if (0..=1000).contains(&instruction.operand) {
                        for _ in 0..instruction.operand {
                            stack.pop();
                        }
                    } else {
                        stack.clear();
                    }
                    stack.push(None);
                }
                Opcode::CallMethod => {
                    stack.pop();
                    reset(&mut stack, &mut locals);
                }
                Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                    stack.pop();
                    reset(&mut stack, &mut locals);
                }
                Opcode::Jmp | Opcode::Call | Opcode::Return => {
                    reset(&mut stack, &mut locals);
                }
            }
        }
        Ok(())
    }
}

fn reset(stack: &mut Vec<Option<Known>>, locals: &mut [Option<Known>]) {
    stack.clear();
    for local in locals.iter_mut() {
        *local = None;
    }
}

fn is_barrier(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Jmp
            | Opcode::JmpIfFalse
            | Opcode::JmpIfTrue
            | Opcode::Call
            | Opcode::CallMethod
            | Opcode::Return
    )
}

/// Pre-pass: a bounded backward scan from each conditional jump marks the
/// locals whose `LOAD`s contribute to the branch condition. The scan stops
/// at barriers and at `STORE` (the stored value came from an expression that
/// no longer involves the load chain).
fn locals_feeding_branches(code: &[Instruction], locals_size: usize) -> Vec<bool> {
    let mut used = vec![false; locals_size];
    for (ip, instruction) in code.iter().enumerate() {
        if !matches!(instruction.opcode, Opcode::JmpIfFalse | Opcode::JmpIfTrue) {
            continue;
        }
        for back in (0..ip).rev().take(BRANCH_SCAN_WINDOW) {
            let previous = code[back];
            if is_barrier(previous.opcode) || previous.opcode == Opcode::Store {
                break;
            }
            if previous.opcode == Opcode::Load {
                if let Ok(slot) = usize::try_from(previous.operand) {
                    if slot < used.len() {
                        used[slot] = true;
                    }
                }
            }
        }
    }
    used
}

/// True when `slot` is stored to after `from_ip` before the next barrier;
/// past a barrier the control flow is no longer guaranteed.
fn written_later(code: &[Instruction], slot: usize, from_ip: usize) -> bool {
    for instruction in &code[from_ip + 1..] {
        if instruction.opcode == Opcode::Store
            && usize::try_from(instruction.operand) == Ok(slot)
        {
            return true;
        }
        if is_barrier(instruction.opcode) {
            break;
        }
    }
    false
}

fn read_const(pool: &ConstPool, index: i64) -> Option<Known> {
    match pool.get(index)? {
        Constant::Int(v) => Some(Known::Int(v)),
        Constant::Double(v) => Some(Known::Double(v)),
        _ => None,
    }
}
