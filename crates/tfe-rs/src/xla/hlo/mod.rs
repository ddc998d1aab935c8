//! High-level optimizer IR: modules of computations of instructions.

mod builder;
mod computation;
mod instruction;
mod module;

pub use builder::HloComputationBuilder;
pub use computation::HloComputation;
pub use instruction::{HloInstruction, HloOpcode, InstructionId};
pub use module::{ComputationLayout, HloModule, HloModuleConfig};
