use std::collections::{BTreeMap, HashSet};

use crate::bytecode::{ConstPool, Constant, FunctionInfo, Instruction, Opcode};
use crate::vm::builtins;
use crate::UmkaResult;

use super::OptimizePass;

/// Dead-code elimination in three steps: reachability from index 0, reverse
/// liveness driven by a stack-demand counter, then compaction with branch
/// retargeting.
///
/// Method call sites have statically unknown arity (the callee depends on
/// the receiver's class), so functions containing `CALL_METHOD` are left
/// untouched.
pub struct DeadCodeElimination;

impl OptimizePass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run(
        &self,
        code: &mut Vec<Instruction>,
        pool: &ConstPool,
        functions: &BTreeMap<u64, FunctionInfo>,
        _meta: &FunctionInfo,
    ) -> UmkaResult<()> {
        if code.is_empty()
            || code
                .iter()
                .any(|instruction| instruction.opcode == Opcode::CallMethod)
        {
            return Ok(());
        }

        let n = code.len();
        let reachable = reachability(code, pool);
        let jump_targets = reachable_jump_targets(code, &reachable);

        // Liveness by stack demand: walking backwards, `demand` counts how
        // many stack-top values are still needed by kept instructions.
        let mut needed = vec![false; n];
        for &target in &jump_targets {
            if reachable[target] {
                needed[target] = true;
            }
        }

        let mut demand: i64 = 0;
        for index in (0..n).rev() {
            if !reachable[index] {
                continue;
            }
            let instruction = code[index];
            let keep =
                has_side_effect(instruction.opcode) || needed[index] || demand > 0;
            if keep {
                needed[index] = true;
                demand -= produced(instruction.opcode);
                if demand < 0 {
                    demand = 0;
                }
                demand += consumed(instruction, functions);
            }
        }

        // Compaction plus jump retargeting over the old-to-new map.
        let mut new_code = Vec::with_capacity(n);
        let mut old_to_new: Vec<Option<usize>> = vec![None; n];
        for index in 0..n {
            if reachable[index] && needed[index] {
                old_to_new[index] = Some(new_code.len());
                new_code.push(code[index]);
            }
        }

        for old_index in 0..n {
            let Some(new_index) = old_to_new[old_index] else {
                continue;
            };
            if !code[old_index].opcode.is_branch() {
                continue;
            }
            let old_target = old_index as i64 + 1 + code[old_index].operand;
            if old_target < 0 || old_target >= n as i64 {
                continue;
            }
            if let Some(new_target) = old_to_new[old_target as usize] {
                new_code[new_index].operand = new_target as i64 - (new_index as i64 + 1);
            }
        }

        *code = new_code;
        Ok(())
    }
}

/// DFS from index 0 following fall-through and both arms of conditional
/// branches. When a conditional's predecessor is a `PUSH_CONST` with a known
/// truth value only the taken arm is followed; `JMP` follows its target
/// only.
fn reachability(code: &[Instruction], pool: &ConstPool) -> Vec<bool> {
    let n = code.len();
    let mut reachable = vec![false; n];
    let mut worklist = vec![0usize];

    while let Some(index) = worklist.pop() {
        if index >= n || reachable[index] {
            continue;
        }
        reachable[index] = true;
        let instruction = code[index];
        let target = index as i64 + 1 + instruction.operand;
        match instruction.opcode {
            Opcode::Jmp => {
                if (0..n as i64).contains(&target) {
                    worklist.push(target as usize);
                }
            }
            Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                let condition = known_truthiness(code, pool, index);
                match condition {
                    Some(value) => {
                        let take_target = (instruction.opcode == Opcode::JmpIfFalse) != value;
                        if take_target {
                            if (0..n as i64).contains(&target) {
                                worklist.push(target as usize);
                            }
                        } else {
                            worklist.push(index + 1);
                        }
                    }
                    None => {
                        worklist.push(index + 1);
                        if (0..n as i64).contains(&target) {
                            worklist.push(target as usize);
                        }
                    }
                }
            }
            Opcode::Return => {}
            _ => worklist.push(index + 1),
        }
    }
    reachable
}

/// Truthiness of the condition when the branch's predecessor is a
/// `PUSH_CONST` of a numeric constant.
fn known_truthiness(code: &[Instruction], pool: &ConstPool, branch: usize) -> Option<bool> {
    if branch == 0 {
        return None;
    }
    let previous = code[branch - 1];
    if previous.opcode != Opcode::PushConst {
        return None;
    }
    match pool.get(previous.operand)? {
        Constant::Int(v) => Some(v != 0),
        Constant::Double(v) => Some(v != 0.0),
        _ => None,
    }
}

fn reachable_jump_targets(code: &[Instruction], reachable: &[bool]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for (index, instruction) in code.iter().enumerate() {
        if !reachable[index] || !instruction.opcode.is_branch() {
            continue;
        }
        let target = index as i64 + 1 + instruction.operand;
        if (0..code.len() as i64).contains(&target) {
            targets.insert(target as usize);
        }
    }
    targets
}

/// Effects that must survive even with zero demand. Branches count: dropping
/// one would merge its arms into straight-line code.
fn has_side_effect(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Store
            | Opcode::Return
            | Opcode::Call
            | Opcode::Pop
            | Opcode::SetField
            | Opcode::Opcot
            | Opcode::Jmp
            | Opcode::JmpIfFalse
            | Opcode::JmpIfTrue
    )
}

fn consumed(instruction: Instruction, functions: &BTreeMap<u64, FunctionInfo>) -> i64 {
    match instruction.opcode {
        Opcode::PushConst | Opcode::Load | Opcode::Jmp => 0,
        Opcode::Pop | Opcode::Store | Opcode::Return => 1,
        Opcode::JmpIfFalse | Opcode::JmpIfTrue => 1,
        Opcode::Not | Opcode::ToString | Opcode::ToInt | Opcode::ToDouble | Opcode::GetField => 1,
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
        | Opcode::Opcot => 2,
        Opcode::SetField => 2,
        Opcode::BuildArr => instruction.operand.max(0),
        Opcode::Call => call_arity(instruction.operand, functions),
        Opcode::CallMethod => 1,
    }
}

fn produced(opcode: Opcode) -> i64 {
    match opcode {
        Opcode::PushConst
        | Opcode::Load
        | Opcode::Add
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
        | Opcode::Not
        | Opcode::ToString
        | Opcode::ToInt
        | Opcode::ToDouble
        | Opcode::GetField
        | Opcode::Opcot
        | Opcode::BuildArr
        | Opcode::Call
        | Opcode::CallMethod => 1,
        Opcode::Store
        | Opcode::Pop
        | Opcode::Return
        | Opcode::SetField
        | Opcode::Jmp
        | Opcode::JmpIfFalse
        | Opcode::JmpIfTrue => 0,
    }
}

/// `CALL` consumes its callee's declared argument count: the function table
/// for user ids, the builtin arity table for reserved ids.
fn call_arity(operand: i64, functions: &BTreeMap<u64, FunctionInfo>) -> i64 {
    if builtins::is_builtin(operand) {
        return builtins::arity(operand).unwrap_or(0) as i64;
    }
    u64::try_from(operand)
        .ok()
        .and_then(|id| functions.get(&id))
        .map(|info| info.arg_count as i64)
        .unwrap_or(0)
}
