use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::lang::value::{HeapRef, Value};
use crate::runtime::error::VmError;

// =============================================================================
// TYPE DESCRIPTORS
// =============================================================================
//
//   I<n>; U<n>;   integers, n in {8, 16, 32, 64, 128}; bare I; / U; are 32-bit
//   B;            bool
//   String;       string
//   [<desc>       array of <desc>
//   void;         no value (return types only)
//   <Name>;       record of class <Name>

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDescriptor {
    Int { signed: bool, bits: u8 },
    Bool,
    String,
    Array(Box<TypeDescriptor>),
    Class(String),
    Void,
}

const INT_WIDTHS: [u8; 5] = [8, 16, 32, 64, 128];

/// Deepest array nesting a descriptor may spell out.
pub const MAX_ARRAY_DEPTH: usize = 255;

impl TypeDescriptor {
    /// Parse a single descriptor; the whole input must be consumed.
    pub fn parse(text: &str) -> Result<TypeDescriptor, VmError> {
        let (desc, rest) = parse_one(text).ok_or_else(|| malformed(text))?;
        if !rest.is_empty() {
            return Err(malformed(text));
        }
        Ok(desc)
    }

    /// Parse a parameter list, a plain concatenation of descriptors.
    /// The empty string is the empty list.
    pub fn parse_list(text: &str) -> Result<Vec<TypeDescriptor>, VmError> {
        let mut out = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            let (desc, tail) = parse_one(rest).ok_or_else(|| malformed(text))?;
            if desc == TypeDescriptor::Void {
                return Err(malformed(text));
            }
            out.push(desc);
            rest = tail;
        }

        Ok(out)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Void)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, TypeDescriptor::Array(_) | TypeDescriptor::Class(_))
    }

    /// Element type of an array descriptor.
    pub fn element(&self) -> Option<&TypeDescriptor> {
        match self {
            TypeDescriptor::Array(inner) => Some(inner),
            _ => None,
        }
    }

    /// Whether `value` carries the tag this descriptor describes.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (TypeDescriptor::Int { signed: false, bits: 8 }, Value::U8(_))
            | (TypeDescriptor::Int { signed: false, bits: 16 }, Value::U16(_))
            | (TypeDescriptor::Int { signed: false, bits: 32 }, Value::U32(_))
            | (TypeDescriptor::Int { signed: false, bits: 64 }, Value::U64(_))
            | (TypeDescriptor::Int { signed: false, bits: 128 }, Value::U128(_))
            | (TypeDescriptor::Int { signed: true, bits: 8 }, Value::I8(_))
            | (TypeDescriptor::Int { signed: true, bits: 16 }, Value::I16(_))
            | (TypeDescriptor::Int { signed: true, bits: 32 }, Value::I32(_))
            | (TypeDescriptor::Int { signed: true, bits: 64 }, Value::I64(_))
            | (TypeDescriptor::Int { signed: true, bits: 128 }, Value::I128(_))
            | (TypeDescriptor::Bool, Value::Bool(_))
            | (TypeDescriptor::String, Value::Str(_))
            | (TypeDescriptor::Array(_), Value::Ref(_))
            | (TypeDescriptor::Class(_), Value::Ref(_)) => true,
            _ => false,
        }
    }

    /// Initial value of a slot of this type; `None` for `void;`.
    pub fn default_value(&self) -> Option<Value> {
        match self {
            TypeDescriptor::Int { .. } => self.wrap_int(0),
            TypeDescriptor::Bool => Some(Value::Bool(false)),
            TypeDescriptor::String => Some(Value::Str(Rc::from(""))),
            TypeDescriptor::Array(_) | TypeDescriptor::Class(_) => Some(Value::Ref(HeapRef::NULL)),
            TypeDescriptor::Void => None,
        }
    }

    /// Truncate `raw` to this integer type, two's complement.
    pub fn wrap_int(&self, raw: i128) -> Option<Value> {
        let TypeDescriptor::Int { signed, bits } = *self else {
            return None;
        };
        Some(match (signed, bits) {
            (false, 8) => Value::U8(raw as u8),
            (false, 16) => Value::U16(raw as u16),
            (false, 32) => Value::U32(raw as u32),
            (false, 64) => Value::U64(raw as u64),
            (false, 128) => Value::U128(raw as u128),
            (true, 8) => Value::I8(raw as i8),
            (true, 16) => Value::I16(raw as i16),
            (true, 32) => Value::I32(raw as i32),
            (true, 64) => Value::I64(raw as i64),
            (true, 128) => Value::I128(raw),
            _ => return None,
        })
    }

    /// Bytes a field of this type occupies in a record layout.
    pub fn field_size(&self) -> usize {
        match self {
            TypeDescriptor::Int { bits, .. } => *bits as usize / 8,
            TypeDescriptor::Bool => 1,
            TypeDescriptor::String | TypeDescriptor::Array(_) | TypeDescriptor::Class(_) => 4,
            TypeDescriptor::Void => 0,
        }
    }
}

fn malformed(text: &str) -> VmError {
    VmError::MalformedDescriptor {
        descriptor: text.to_string(),
    }
}

fn parse_one(text: &str) -> Option<(TypeDescriptor, &str)> {
    let base = text.trim_start_matches('[');
    let depth = text.len() - base.len();
    if depth > MAX_ARRAY_DEPTH {
        return None;
    }

    let (mut desc, rest) = parse_base(base)?;
    if depth > 0 && desc.is_void() {
        return None;
    }
    for _ in 0..depth {
        desc = TypeDescriptor::Array(Box::new(desc));
    }
    Some((desc, rest))
}

fn parse_base(text: &str) -> Option<(TypeDescriptor, &str)> {
    let end = text.find(';')?;
    let token = &text[..end];
    let rest = &text[end + 1..];

    let desc = match token {
        "" => return None,
        "B" => TypeDescriptor::Bool,
        "String" => TypeDescriptor::String,
        "void" => TypeDescriptor::Void,
        _ => match parse_int(token) {
            Some(result) => result?,
            None if token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '/') =>
            {
                TypeDescriptor::Class(token.to_string())
            }
            None => return None,
        },
    };

    Some((desc, rest))
}

/// `None` if the token is not integer-shaped at all, `Some(None)` if it is
/// integer-shaped with an unsupported width.
fn parse_int(token: &str) -> Option<Option<TypeDescriptor>> {
    let signed = match token.as_bytes().first()? {
        b'I' => true,
        b'U' => false,
        _ => return None,
    };
    let digits = &token[1..];
    if digits.is_empty() {
        return Some(Some(TypeDescriptor::Int { signed, bits: 32 }));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let bits = digits.parse::<u8>().ok().filter(|b| INT_WIDTHS.contains(b));
    Some(bits.map(|bits| TypeDescriptor::Int { signed, bits }))
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Int { signed, bits } => {
                write!(f, "{}{};", if *signed { "I" } else { "U" }, bits)
            }
            TypeDescriptor::Bool => write!(f, "B;"),
            TypeDescriptor::String => write!(f, "String;"),
            TypeDescriptor::Array(inner) => write!(f, "[{}", inner),
            TypeDescriptor::Class(name) => write!(f, "{};", name),
            TypeDescriptor::Void => write!(f, "void;"),
        }
    }
}

/// Render a parameter list the way it appears in a descriptor constant.
pub fn format_list(params: &[TypeDescriptor]) -> String {
    params.iter().map(|p| p.to_string()).collect()
}
