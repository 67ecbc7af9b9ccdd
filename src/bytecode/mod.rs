//! Instruction set, per-function builder and the binary program format.

pub mod builder;
pub mod format;
pub mod instruction;
pub mod opcode;
pub mod program;

pub use builder::FunctionBuilder;
pub use instruction::Instruction;
pub use opcode::Opcode;
pub use program::{ConstPool, Constant, FunctionInfo, Program};
