//! The garbage-collected heap: entity storage and the mark-and-sweep
//! collector.

pub mod gc;
pub mod heap;

pub use gc::GarbageCollector;
pub use heap::{Entity, EntityRef, Heap};
