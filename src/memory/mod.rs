//! 记忆层：按 (scope, phase) 读写的阶段记忆

pub mod phase;

pub use phase::{InMemoryPhaseMemory, MemoryEntry, NoopMemory, PhaseMemory};
