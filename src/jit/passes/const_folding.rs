use std::collections::{BTreeMap, HashSet};

use crate::bytecode::{ConstPool, Constant, FunctionInfo, Instruction, Opcode};
use crate::UmkaResult;

use super::OptimizePass;

/// Result of folding a binary operator over known operands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Folded {
    Int(i64),
    Bool(bool),
}

impl Folded {
    fn as_int(self) -> i64 {
        match self {
            Folded::Int(v) => v,
            Folded::Bool(v) => i64::from(v),
        }
    }

    fn truthy(self) -> bool {
        self.as_int() != 0
    }
}

/// One accumulated abstract stack slot: the known value plus the instruction
/// sequence that reproduces it at runtime.
///
/// Integer results collapse to a single `PUSH_CONST`; boolean results (from
/// comparisons and logic) keep their original producing sequence, because
/// the constant pool has no boolean type and materializing them as integers
/// would change rendering. They still participate in further folding.
struct Slot {
    value: Folded,
    replay: Vec<Instruction>,
}

/// Folds chains of known integer constants through arithmetic, comparison
/// and logical operators, replacing each chain with a single `PUSH_CONST`.
///
/// The accumulated constant stack is flushed before any non-foldable
/// opcode. Branch targets are additional flush barriers and are copied
/// verbatim; after the pass, surviving branch offsets are remapped over the
/// old-to-new index map so control flow is preserved.
pub struct ConstFolding;

impl OptimizePass for ConstFolding {
    fn name(&self) -> &'static str {
        "const-folding"
    }

    fn run(
        &self,
        code: &mut Vec<Instruction>,
        pool: &ConstPool,
        _functions: &BTreeMap<u64, FunctionInfo>,
        _meta: &FunctionInfo,
    ) -> UmkaResult<()> {
        let n = code.len();
        let targets = branch_targets(code);

        let mut out: Vec<Instruction> = Vec::with_capacity(n);
        let mut old_to_new: Vec<Option<usize>> = vec![None; n];
        // (new index, old index) of every copied branch, for retargeting.
        let mut branches: Vec<(usize, usize)> = Vec::new();
        let mut stack: Vec<Slot> = Vec::new();

        let flush = |out: &mut Vec<Instruction>, stack: &mut Vec<Slot>| {
            for slot in stack.drain(..) {
                out.extend(slot.replay);
            }
        };

        for ip in 0..n {
            let instruction = code[ip];

            if targets.contains(&ip) {
                flush(&mut out, &mut stack);
                copy(&mut out, &mut old_to_new, &mut branches, ip, instruction);
                continue;
            }

            if instruction.opcode == Opcode::PushConst {
                if let Some(Constant::Int(value)) = pool.get(instruction.operand) {
                    stack.push(Slot {
                        value: Folded::Int(value),
                        replay: vec![instruction],
                    });
                    continue;
                }
                // Non-integer constants flow through untouched.
                flush(&mut out, &mut stack);
                copy(&mut out, &mut old_to_new, &mut branches, ip, instruction);
                continue;
            }

            if is_foldable(instruction.opcode) && stack.len() >= 2 {
                let left = stack.pop().expect("stack len checked");
                let right = stack.pop().expect("stack len checked");
                match eval(instruction.opcode, left.value, right.value) {
                    Some(folded @ Folded::Int(value)) => {
                        let index = pool.intern(Constant::Int(value));
                        stack.push(Slot {
                            value: folded,
                            replay: vec![Instruction::new(Opcode::PushConst, index)],
                        });
                        continue;
                    }
                    Some(folded @ Folded::Bool(_)) => {
                        let mut replay = right.replay;
                        replay.extend(left.replay);
                        replay.push(instruction);
                        stack.push(Slot {
                            value: folded,
                            replay,
                        });
                        continue;
                    }
                    None => {
                        // Division by zero is left for the interpreter to
                        // report at the original site.
                        stack.push(right);
                        stack.push(left);
                    }
                }
            }

            // Conditional jumps only test truthiness, so a known boolean on
            // top may materialize as an integer without changing behavior.
            if matches!(instruction.opcode, Opcode::JmpIfFalse | Opcode::JmpIfTrue) {
                if let Some(slot) = stack.last_mut() {
                    if matches!(slot.value, Folded::Bool(_)) {
                        let index = pool.intern(Constant::Int(slot.value.as_int()));
                        slot.replay = vec![Instruction::new(Opcode::PushConst, index)];
                    }
                }
            }

            flush(&mut out, &mut stack);
            copy(&mut out, &mut old_to_new, &mut branches, ip, instruction);
        }
        flush(&mut out, &mut stack);

        retarget(&mut out, &old_to_new, &branches, code);
        *code = out;
        Ok(())
    }
}

fn copy(
    out: &mut Vec<Instruction>,
    old_to_new: &mut [Option<usize>],
    branches: &mut Vec<(usize, usize)>,
    old_index: usize,
    instruction: Instruction,
) {
    let new_index = out.len();
    old_to_new[old_index] = Some(new_index);
    if instruction.opcode.is_branch() {
        branches.push((new_index, old_index));
    }
    out.push(instruction);
}

fn branch_targets(code: &[Instruction]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for (ip, instruction) in code.iter().enumerate() {
        if instruction.opcode.is_branch() {
            let target = ip as i64 + 1 + instruction.operand;
            if (0..code.len() as i64).contains(&target) {
                targets.insert(target as usize);
            }
        }
    }
    targets
}

fn retarget(
    out: &mut [Instruction],
    old_to_new: &[Option<usize>],
    branches: &[(usize, usize)],
    old_code: &[Instruction],
) {
    for &(new_index, old_index) in branches {
        let old_target = old_index as i64 + 1 + old_code[old_index].operand;
        if old_target < 0 || old_target >= old_to_new.len() as i64 {
            continue;
        }
        if let Some(new_target) = old_to_new[old_target as usize] {
            out[new_index].operand = new_target as i64 - (new_index as i64 + 1);
        }
    }
}

fn is_foldable(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::Lte
            | Opcode::Gte
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::And
            | Opcode::Or
    )
}

/// Mirrors the interpreter: `left` is the first-popped (stack-top) operand.
fn eval(opcode: Opcode, left: Folded, right: Folded) -> Option<Folded> {
    let a = left.as_int();
    let b = right.as_int();
    let folded = match opcode {
        Opcode::Add => Folded::Int(a.wrapping_add(b)),
        Opcode::Sub => Folded::Int(a.wrapping_sub(b)),
        Opcode::Mul => Folded::Int(a.wrapping_mul(b)),
        Opcode::Div => {
            if b == 0 {
                return None;
            }
            Folded::Int(a.wrapping_div(b))
        }
        Opcode::Rem => {
            if b == 0 {
                return None;
            }
            Folded::Int(a.wrapping_rem(b))
        }
        Opcode::Lt => Folded::Bool(a < b),
        Opcode::Gt => Folded::Bool(a > b),
        Opcode::Lte => Folded::Bool(a <= b),
        Opcode::Gte => Folded::Bool(a >= b),
        Opcode::Eq => Folded::Bool(a == b),
        Opcode::Neq => Folded::Bool(a != b),
        Opcode::And => Folded::Bool(left.truthy() && right.truthy()),
        Opcode::Or => Folded::Bool(left.truthy() || right.truthy()),
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pass(code: &mut Vec<Instruction>, pool: &ConstPool) {
        let meta = FunctionInfo::default();
        ConstFolding
            .run(code, pool, &BTreeMap::new(), &meta)
            .expect("pass");
    }

    fn int_at(pool: &ConstPool, index: i64) -> i64 {
        match pool.get(index) {
            Some(Constant::Int(v)) => v,
            other => panic!("expected int constant, got {other:?}"),
        }
    }

    #[test]
    fn nested_arithmetic_folds_to_one_push() {
        let pool = ConstPool::new();
        let c2 = pool.intern(Constant::Int(2));
        let c3 = pool.intern(Constant::Int(3));
        let c4 = pool.intern(Constant::Int(4));
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c3),
            Instruction::new(Opcode::PushConst, c4),
            Instruction::bare(Opcode::Mul),
            Instruction::bare(Opcode::Add),
            Instruction::new(Opcode::Store, 0),
        ];
        run_pass(&mut code, &pool);

        assert_eq!(code.len(), 2);
        assert_eq!(code[0].opcode, Opcode::PushConst);
        assert_eq!(int_at(&pool, code[0].operand), 14);
        assert_eq!(code[1], Instruction::new(Opcode::Store, 0));
    }

    #[test]
    fn multiplying_two_folded_sums() {
        let pool = ConstPool::new();
        let ints: Vec<i64> = (1..=4).map(|v| pool.intern(Constant::Int(v))).collect();
        let mut code = vec![
            Instruction::new(Opcode::PushConst, ints[0]),
            Instruction::new(Opcode::PushConst, ints[1]),
            Instruction::bare(Opcode::Add),
            Instruction::new(Opcode::PushConst, ints[2]),
            Instruction::new(Opcode::PushConst, ints[3]),
            Instruction::bare(Opcode::Add),
            Instruction::bare(Opcode::Mul),
            Instruction::new(Opcode::Store, 0),
        ];
        run_pass(&mut code, &pool);

        assert_eq!(code.len(), 2);
        assert_eq!(int_at(&pool, code[0].operand), 21);
    }

    #[test]
    fn cannot_fold_load_and_const() {
        let pool = ConstPool::new();
        let c1 = pool.intern(Constant::Int(1));
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c1),
            Instruction::new(Opcode::Load, 0),
            Instruction::bare(Opcode::Add),
        ];
        run_pass(&mut code, &pool);

        assert_eq!(
            code,
            vec![
                Instruction::new(Opcode::PushConst, c1),
                Instruction::new(Opcode::Load, 0),
                Instruction::bare(Opcode::Add),
            ]
        );
    }

    #[test]
    fn cannot_fold_across_store() {
        let pool = ConstPool::new();
        let c2 = pool.intern(Constant::Int(2));
        let c3 = pool.intern(Constant::Int(3));
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c3),
            Instruction::new(Opcode::Store, 0),
            Instruction::bare(Opcode::Add),
        ];
        run_pass(&mut code, &pool);

        assert_eq!(code.len(), 4);
        assert_eq!(code[2], Instruction::new(Opcode::Store, 0));
        assert_eq!(code[3], Instruction::bare(Opcode::Add));
    }

    #[test]
    fn cannot_fold_across_call() {
        let pool = ConstPool::new();
        let c2 = pool.intern(Constant::Int(2));
        let c3 = pool.intern(Constant::Int(3));
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c3),
            Instruction::new(Opcode::Call, 10),
            Instruction::bare(Opcode::Add),
        ];
        run_pass(&mut code, &pool);

        assert_eq!(code.len(), 4);
        assert_eq!(code[2], Instruction::new(Opcode::Call, 10));
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let pool = ConstPool::new();
        let c1 = pool.intern(Constant::Int(1));
        let c0 = pool.intern(Constant::Int(0));
        // PUSH 0; PUSH 1; DIV computes 1 / 0 and must keep failing at run
        // time.
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c0),
            Instruction::new(Opcode::PushConst, c1),
            Instruction::bare(Opcode::Div),
        ];
        run_pass(&mut code, &pool);
        assert_eq!(code.len(), 3);
        assert_eq!(code[2], Instruction::bare(Opcode::Div));
    }

    #[test]
    fn comparison_results_keep_their_producing_sequence() {
        let pool = ConstPool::new();
        let c1 = pool.intern(Constant::Int(1));
        let c2 = pool.intern(Constant::Int(2));
        // to_string(1 < 2) must still render "true", so EQ-family results
        // are not materialized as integer constants.
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c1),
            Instruction::bare(Opcode::Lt),
            Instruction::bare(Opcode::ToString),
        ];
        run_pass(&mut code, &pool);
        assert_eq!(code[2], Instruction::bare(Opcode::Lt));
        assert_eq!(code[3], Instruction::bare(Opcode::ToString));
    }

    #[test]
    fn known_condition_feeding_a_branch_materializes_as_int() {
        let pool = ConstPool::new();
        let c1 = pool.intern(Constant::Int(1));
        let c2 = pool.intern(Constant::Int(2));
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c1),
            Instruction::bare(Opcode::Lt),
            Instruction::new(Opcode::JmpIfFalse, 1),
            Instruction::bare(Opcode::Return),
            Instruction::bare(Opcode::Return),
        ];
        run_pass(&mut code, &pool);
        // 1 < 2 is true → single PUSH_CONST 1 before the branch.
        assert_eq!(code.len(), 4);
        assert_eq!(code[0].opcode, Opcode::PushConst);
        assert_eq!(int_at(&pool, code[0].operand), 1);
        assert_eq!(code[1].opcode, Opcode::JmpIfFalse);
    }

    #[test]
    fn branch_offsets_survive_compaction() {
        let pool = ConstPool::new();
        let c2 = pool.intern(Constant::Int(2));
        let c3 = pool.intern(Constant::Int(3));
        // Fold 2+3 before an unconditional jump over a POP to RETURN.
        let mut code = vec![
            Instruction::new(Opcode::PushConst, c2),
            Instruction::new(Opcode::PushConst, c3),
            Instruction::bare(Opcode::Add),
            Instruction::new(Opcode::Jmp, 1),
            Instruction::bare(Opcode::Pop),
            Instruction::bare(Opcode::Return),
        ];
        run_pass(&mut code, &pool);

        // PUSH 5; JMP; POP; RETURN — the jump still lands on RETURN.
        assert_eq!(code.len(), 4);
        assert_eq!(int_at(&pool, code[0].operand), 5);
        let site = 1;
        assert_eq!(code[site].opcode, Opcode::Jmp);
        let target = site as i64 + 1 + code[site].operand;
        assert_eq!(code[target as usize].opcode, Opcode::Return);
    }
}
