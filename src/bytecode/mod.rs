//! Bytecode: instruction and constant encodings, the `.ball` loader and
//! verifier, program images and the disassembler.

pub mod constant;
pub mod disasm;
pub mod image;
pub mod load_error;
pub mod loader;
pub mod op;
pub mod reader;
pub mod verify;

#[cfg(test)]
pub mod test_support;

pub use constant::{Constant, ConstantTag};
pub use load_error::LoadError;
pub use loader::{LoadSummary, Loader};
pub use op::{Instruction, Opcode};
