//! Background bytecode-to-bytecode optimizer: the worker manager, the pass
//! runner and the optimization passes.

pub mod manager;
pub mod passes;
pub mod runner;

use crate::bytecode::Instruction;

pub use manager::JitManager;
pub use runner::JitRunner;

/// Lifecycle of one function inside the manager.
///
/// `request_jit` moves `None → Queued`; the worker moves `Queued → Running →
/// Ready`. Only `Ready` makes the optimized body visible to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitState {
    None,
    Queued,
    Running,
    Ready,
}

/// An optimized function body, produced once by the worker and read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct JittedFunction {
    pub code: Vec<Instruction>,
    pub arg_count: usize,
    pub local_count: usize,
}
