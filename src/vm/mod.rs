//! The stack machine: dispatch loop, built-in functions, value operations
//! and the execution profiler.

pub mod builtins;
pub mod machine;
pub mod ops;
pub mod profiler;

pub use machine::{Machine, RuntimeOptions, StepHook};
pub use profiler::{Profiler, ProfileSnapshot};
