//! Execution core: runtime data areas, collector, interpreter and the native
//! compiler collaborator.

pub mod call_stack;
pub mod data_area;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod jit;
pub mod method_area;
pub mod optimizer;

pub use data_area::RuntimeDataArea;
pub use error::{RuntimeError, VmError};
pub use interpreter::{Interpreter, Outcome, VmConfig};
