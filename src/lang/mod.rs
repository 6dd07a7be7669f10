//! # Ball value model
//!
//! Tagged runtime values and the type-descriptor grammar used by constants,
//! function signatures, array element types and record fields.
//!
//! ## Documentation conventions
//!
//! - Stack effects are written as `( before -- after )`.
//! - Descriptors are written as they appear in the constant pool, e.g. `[I;`.

pub mod descriptor;
pub mod value;

pub use descriptor::TypeDescriptor;
pub use value::{HeapRef, Value};
