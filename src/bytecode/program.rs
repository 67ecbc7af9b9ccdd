use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::instruction::Instruction;

/// A typed literal stored in the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Double(f64),
    Str(String),
    Unit,
}

impl Constant {
    /// Interning equality: by type and bit pattern (doubles compare by bits,
    /// so e.g. two NaN payloads dedup onto the same slot).
    pub fn same(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Double(a), Constant::Double(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Unit, Constant::Unit) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Double(v) => write!(f, "{v}"),
            Constant::Str(v) => write!(f, "{v:?}"),
            Constant::Unit => f.write_str("unit"),
        }
    }
}

/// Shared, append-only constant pool.
///
/// The pool is written by lowering before execution starts and appended to by
/// the JIT worker while the interpreter runs. The interpreter only reads
/// indices it was handed at emission time, so a monotonically growing vector
/// behind a read-write lock is sufficient synchronization.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    entries: Arc<RwLock<Vec<Constant>>>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(entries: Vec<Constant>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub fn get(&self, index: i64) -> Option<Constant> {
        if index < 0 {
            return None;
        }
        self.entries.read().get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the index of a byte-equal constant, appending it when absent.
    /// Linear search; acceptable at lowering and optimization time.
    pub fn intern(&self, constant: Constant) -> i64 {
        let mut entries = self.entries.write();
        if let Some(index) = entries.iter().position(|c| c.same(&constant)) {
            return index as i64;
        }
        entries.push(constant);
        (entries.len() - 1) as i64
    }

    pub fn snapshot(&self) -> Vec<Constant> {
        self.entries.read().clone()
    }
}

/// Function metadata resolved at load time. `main` has id 0; user functions
/// and methods are dense from 0. Code offsets are instruction indices into
/// the shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionInfo {
    pub id: u64,
    pub code_begin: usize,
    pub code_end: usize,
    pub arg_count: usize,
    pub local_count: usize,
}

/// An immutable loaded program: instruction stream, constant pool, function
/// table and the virtual dispatch tables.
#[derive(Debug, Clone)]
pub struct Program {
    pub code: Arc<Vec<Instruction>>,
    pub pool: ConstPool,
    pub functions: Arc<BTreeMap<u64, FunctionInfo>>,
    /// Raw `(class_id, method_id, function_id)` triples, in file order.
    pub vmethod_table: Arc<Vec<(i64, i64, i64)>>,
    /// Raw `(class_id, field_id, field_index)` triples, in file order.
    pub vfield_table: Arc<Vec<(i64, i64, i64)>>,
    /// `(class_id, method_id)` → function id.
    pub vmethods: Arc<HashMap<(i64, i64), u64>>,
    /// `(class_id, field_id)` → field index within the object array.
    pub vfields: Arc<HashMap<(i64, i64), i64>>,
}

impl Program {
    pub fn new(
        code: Vec<Instruction>,
        pool: ConstPool,
        functions: BTreeMap<u64, FunctionInfo>,
        vmethod_table: Vec<(i64, i64, i64)>,
        vfield_table: Vec<(i64, i64, i64)>,
    ) -> Self {
        let vmethods = vmethod_table
            .iter()
            .map(|&(class_id, method_id, function_id)| {
                ((class_id, method_id), function_id as u64)
            })
            .collect();
        let vfields = vfield_table
            .iter()
            .map(|&(class_id, field_id, field_index)| ((class_id, field_id), field_index))
            .collect();
        Self {
            code: Arc::new(code),
            pool,
            functions: Arc::new(functions),
            vmethod_table: Arc::new(vmethod_table),
            vfield_table: Arc::new(vfield_table),
            vmethods: Arc::new(vmethods),
            vfields: Arc::new(vfields),
        }
    }

    pub fn function(&self, id: u64) -> Option<&FunctionInfo> {
        self.functions.get(&id)
    }

    /// Human-readable listing of the loaded program.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let constants = self.pool.snapshot();
        writeln!(out, "; constants: {}", constants.len()).unwrap();
        for (index, constant) in constants.iter().enumerate() {
            writeln!(out, ";   [{index}] {constant}").unwrap();
        }
        for info in self.functions.values() {
            writeln!(
                out,
                "fn #{} (args={}, locals={}):",
                info.id, info.arg_count, info.local_count
            )
            .unwrap();
            for index in info.code_begin..info.code_end.min(self.code.len()) {
                writeln!(out, "  {:4}  {}", index, self.code[index]).unwrap();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups_by_type_and_bits() {
        let pool = ConstPool::new();
        let a = pool.intern(Constant::Int(1));
        let b = pool.intern(Constant::Int(1));
        let c = pool.intern(Constant::Double(1.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn interning_distinguishes_bool_free_literals() {
        let pool = ConstPool::new();
        pool.intern(Constant::Str("a".into()));
        pool.intern(Constant::Unit);
        pool.intern(Constant::Str("a".into()));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dispatch_maps_are_built_from_triples() {
        let program = Program::new(
            Vec::new(),
            ConstPool::new(),
            BTreeMap::new(),
            vec![(0, 0, 1), (1, 0, 2)],
            vec![(0, 0, 1)],
        );
        assert_eq!(program.vmethods.get(&(1, 0)), Some(&2));
        assert_eq!(program.vfields.get(&(0, 0)), Some(&1));
    }
}
