use std::collections::HashMap;

use crate::{ErrorKind, UmkaError, UmkaResult};

use super::instruction::Instruction;
use super::opcode::Opcode;
use super::program::{ConstPool, Constant};

/// Per-function bytecode emitter with symbolic labels and deferred jump
/// patching.
///
/// Jumps are emitted with a zero operand and a pending fixup; [`resolve`]
/// patches each site with `target_index - (site_index + 1)`, a relative
/// offset in instructions that the interpreter adds to the post-fetch
/// instruction pointer.
///
/// [`resolve`]: FunctionBuilder::resolve
pub struct FunctionBuilder {
    code: Vec<Instruction>,
    labels: HashMap<String, usize>,
    pending: Vec<PendingJump>,
    locals: HashMap<String, i64>,
    next_local: i64,
    label_counter: usize,
    pool: ConstPool,
}

struct PendingJump {
    site: usize,
    label: String,
}

impl FunctionBuilder {
    pub fn new(pool: ConstPool) -> Self {
        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            pending: Vec::new(),
            locals: HashMap::new(),
            next_local: 0,
            label_counter: 0,
            pool,
        }
    }

    /// Current instruction index, usable as a label target.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn fresh_label(&mut self) -> String {
        let label = format!("L{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    pub fn place_label(&mut self, label: &str) {
        self.labels.insert(label.to_string(), self.code.len());
    }

    pub fn emit(&mut self, opcode: Opcode) {
        self.code.push(Instruction::bare(opcode));
    }

    pub fn emit_with(&mut self, opcode: Opcode, operand: i64) {
        self.code.push(Instruction::new(opcode, operand));
    }

    /// Emits a jump with a zero operand and queues a fixup for `label`.
    pub fn emit_jump(&mut self, opcode: Opcode, label: &str) {
        let site = self.code.len();
        self.code.push(Instruction::bare(opcode));
        self.pending.push(PendingJump {
            site,
            label: label.to_string(),
        });
    }

    /// Interns `constant` in the shared pool, returning its index.
    pub fn add_const(&mut self, constant: Constant) -> i64 {
        self.pool.intern(constant)
    }

    pub fn emit_push_const(&mut self, constant: Constant) {
        let index = self.add_const(constant);
        self.emit_with(Opcode::PushConst, index);
    }

    /// Slot of `name`, allocating the next free local on first sight.
    pub fn local_slot(&mut self, name: &str) -> i64 {
        if let Some(&slot) = self.locals.get(name) {
            return slot;
        }
        let slot = self.next_local;
        self.locals.insert(name.to_string(), slot);
        self.next_local += 1;
        slot
    }

    pub fn lookup_local(&self, name: &str) -> Option<i64> {
        self.locals.get(name).copied()
    }

    pub fn local_count(&self) -> usize {
        self.next_local as usize
    }

    pub fn last_opcode(&self) -> Option<Opcode> {
        self.code.last().map(|instruction| instruction.opcode)
    }

    /// Patches all pending jumps. Unresolved labels are a compile error.
    pub fn resolve(mut self) -> UmkaResult<Vec<Instruction>> {
        for jump in &self.pending {
            let target = *self.labels.get(&jump.label).ok_or_else(|| {
                UmkaError::new(
                    ErrorKind::Parse,
                    format!("unresolved label '{}'", jump.label),
                )
            })?;
            self.code[jump.site].operand = target as i64 - (jump.site as i64 + 1);
        }
        Ok(self.code)
    }
}
