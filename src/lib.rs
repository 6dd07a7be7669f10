//! A stack bytecode virtual machine for `.ball` programs, with a generational
//! mark-sweep heap and an optional native compiler for hot functions.

pub mod bytecode;
pub mod error;
pub mod lang;
pub mod runtime;
pub mod vm;

pub use error::Error;
pub use runtime::interpreter::{Outcome, VmConfig};
pub use vm::VirtualMachine;
