//! Optimization passes over a copied instruction range.
//!
//! Each pass operates on `(code, shared constant pool, function table,
//! meta)`. Passes may append new constants but must not remove or reorder
//! existing ones. Branch offsets are relative to the post-fetch instruction
//! pointer throughout.

pub mod const_folding;
pub mod constant_propagation;
pub mod dce;

use std::collections::BTreeMap;

use crate::bytecode::{ConstPool, FunctionInfo, Instruction};
use crate::UmkaResult;

pub use const_folding::ConstFolding;
pub use constant_propagation::ConstantPropagation;
pub use dce::DeadCodeElimination;

pub trait OptimizePass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        code: &mut Vec<Instruction>,
        pool: &ConstPool,
        functions: &BTreeMap<u64, FunctionInfo>,
        meta: &FunctionInfo,
    ) -> UmkaResult<()>;
}

/// The ordered pipeline used by the worker: propagation uncovers constants,
/// folding collapses them, a second propagation picks up newly constant
/// locals, and elimination drops what is no longer demanded.
pub fn default_pipeline() -> Vec<Box<dyn OptimizePass>> {
    vec![
        Box::new(ConstantPropagation),
        Box::new(ConstFolding),
        Box::new(ConstantPropagation),
        Box::new(DeadCodeElimination),
    ]
}
