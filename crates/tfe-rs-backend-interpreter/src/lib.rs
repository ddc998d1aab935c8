//! Reference interpreter backend for the XLA compile-and-run pipeline.

pub mod compiler;
pub mod evaluator;
pub mod executable;

use std::sync::Arc;

pub use compiler::InterpreterCompiler;
pub use evaluator::{HloEvaluator, TensorData};
pub use executable::InterpreterExecutable;

/// Platform name the interpreter compiler is registered under.
pub const PLATFORM_NAME: &str = "interpreter";

/// Register the interpreter compiler with the global compiler registry.
///
/// This runs automatically when the library is loaded; calling it again is harmless.
pub fn register_interpreter_compiler() {
    tfe_rs::xla::register_compiler(PLATFORM_NAME, || Arc::new(InterpreterCompiler::new()));
}

#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_INTERPRETER_COMPILER: extern "C" fn() = {
    extern "C" fn register() {
        register_interpreter_compiler();
    }
    register
};
