use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

use crate::lang::value::Value;
use crate::runtime::error::VmError;

/// Wire tag of a constant pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConstantTag {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x03,
    I32 = 0x04,
    I16 = 0x05,
    I8 = 0x06,
    U64 = 0x07,
    I64 = 0x08,
    U128 = 0x09,
    I128 = 0x0A,
    String = 0x0B,
    Bool = 0x0C,
    Class = 0x0D,
}

impl ConstantTag {
    pub fn from_u8(byte: u8) -> Option<ConstantTag> {
        Some(match byte {
            0x01 => ConstantTag::U8,
            0x02 => ConstantTag::U16,
            0x03 => ConstantTag::U32,
            0x04 => ConstantTag::I32,
            0x05 => ConstantTag::I16,
            0x06 => ConstantTag::I8,
            0x07 => ConstantTag::U64,
            0x08 => ConstantTag::I64,
            0x09 => ConstantTag::U128,
            0x0A => ConstantTag::I128,
            0x0B => ConstantTag::String,
            0x0C => ConstantTag::Bool,
            0x0D => ConstantTag::Class,
            _ => return None,
        })
    }

    /// Payload width for fixed-size tags; `None` for length-prefixed ones.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ConstantTag::U8 | ConstantTag::I8 | ConstantTag::Bool => Some(1),
            ConstantTag::U16 | ConstantTag::I16 => Some(2),
            ConstantTag::U32 | ConstantTag::I32 => Some(4),
            ConstantTag::U64 | ConstantTag::I64 => Some(8),
            ConstantTag::U128 | ConstantTag::I128 => Some(16),
            ConstantTag::String | ConstantTag::Class => None,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            ConstantTag::String | ConstantTag::Class | ConstantTag::Bool
        )
    }
}

impl fmt::Display for ConstantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A constant pool entry: tag plus the big-endian payload exactly as stored
/// in the file. Decoded into a [`Value`] on each reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constant {
    pub tag: ConstantTag,
    pub bytes: Vec<u8>,
}

macro_rules! int_constructors {
    ($($name:ident: $ty:ty => $tag:ident),* $(,)?) => {
        $(
            pub fn $name(n: $ty) -> Constant {
                Constant {
                    tag: ConstantTag::$tag,
                    bytes: n.to_be_bytes().to_vec(),
                }
            }
        )*
    };
}

impl Constant {
    int_constructors! {
        u8: u8 => U8,
        u16: u16 => U16,
        u32: u32 => U32,
        u64: u64 => U64,
        u128: u128 => U128,
        i8: i8 => I8,
        i16: i16 => I16,
        i32: i32 => I32,
        i64: i64 => I64,
        i128: i128 => I128,
    }

    pub fn bool(b: bool) -> Constant {
        Constant {
            tag: ConstantTag::Bool,
            bytes: vec![b as u8],
        }
    }

    pub fn string(s: &str) -> Constant {
        Constant {
            tag: ConstantTag::String,
            bytes: s.as_bytes().to_vec(),
        }
    }

    pub fn class(name: &str) -> Constant {
        Constant {
            tag: ConstantTag::Class,
            bytes: name.as_bytes().to_vec(),
        }
    }

    /// Text of a string or class-name constant.
    pub fn as_text(&self) -> Option<&str> {
        match self.tag {
            ConstantTag::String | ConstantTag::Class => std::str::from_utf8(&self.bytes).ok(),
            _ => None,
        }
    }

    /// Decode into a runtime value. `index` is only used for error context.
    pub fn to_value(&self, index: u32) -> Result<Value, VmError> {
        if let Some(width) = self.tag.fixed_width() {
            if self.bytes.len() != width {
                return Err(VmError::MalformedConstant {
                    index,
                    reason: format!(
                        "{} payload is {} bytes, expected {}",
                        self.tag,
                        self.bytes.len(),
                        width
                    ),
                });
            }
        }

        let b = &self.bytes;
        Ok(match self.tag {
            ConstantTag::U8 => Value::U8(b[0]),
            ConstantTag::I8 => Value::I8(b[0] as i8),
            ConstantTag::Bool => Value::Bool(b[0] != 0),
            ConstantTag::U16 => Value::U16(u16::from_be_bytes([b[0], b[1]])),
            ConstantTag::I16 => Value::I16(i16::from_be_bytes([b[0], b[1]])),
            ConstantTag::U32 => Value::U32(u32::from_be_bytes(array(b))),
            ConstantTag::I32 => Value::I32(i32::from_be_bytes(array(b))),
            ConstantTag::U64 => Value::U64(u64::from_be_bytes(array(b))),
            ConstantTag::I64 => Value::I64(i64::from_be_bytes(array(b))),
            ConstantTag::U128 => Value::U128(u128::from_be_bytes(array(b))),
            ConstantTag::I128 => Value::I128(i128::from_be_bytes(array(b))),
            ConstantTag::String => {
                let text = self.as_text().ok_or_else(|| VmError::MalformedConstant {
                    index,
                    reason: "string is not valid UTF-8".to_string(),
                })?;
                Value::Str(Rc::from(text))
            }
            ConstantTag::Class => {
                return Err(VmError::UnsupportedConstant {
                    index,
                    tag: self.tag.to_string(),
                });
            }
        })
    }
}

// Callers have already checked the length against the tag's width.
fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            ConstantTag::String => write!(f, "{:?}", self.as_text().unwrap_or("<invalid utf-8>")),
            ConstantTag::Class => write!(f, "class {}", self.as_text().unwrap_or("<invalid utf-8>")),
            _ => match self.to_value(0) {
                Ok(value) => write!(f, "{} {}", self.tag, value),
                Err(_) => write!(f, "{} <malformed>", self.tag),
            },
        }
    }
}
