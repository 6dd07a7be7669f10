use std::fmt;
use std::rc::Rc;

use crate::runtime::error::VmError;

/// Handle to a heap object.
///
/// A `HeapRef` is a plain id, not a pointer: it has to be checked against the
/// heap's live-object table on every dereference. Id 0 is never issued and
/// doubles as the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapRef(pub u32);

impl HeapRef {
    pub const NULL: HeapRef = HeapRef(0);

    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Runtime value held in locals, on operand stacks and in heap object fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    Bool(bool),
    Str(Rc<str>),
    Ref(HeapRef),
}

// Expands one arm per integer tag, binding both payloads by value.
macro_rules! int_pair {
    ($lhs:expr, $rhs:expr, $op:literal, |$x:ident, $y:ident| $body:expr, $wrap:ident) => {
        match ($lhs, $rhs) {
            (Value::U8(a), Value::U8(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(U8, $body))
            }
            (Value::U16(a), Value::U16(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(U16, $body))
            }
            (Value::U32(a), Value::U32(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(U32, $body))
            }
            (Value::U64(a), Value::U64(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(U64, $body))
            }
            (Value::U128(a), Value::U128(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(U128, $body))
            }
            (Value::I8(a), Value::I8(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(I8, $body))
            }
            (Value::I16(a), Value::I16(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(I16, $body))
            }
            (Value::I32(a), Value::I32(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(I32, $body))
            }
            (Value::I64(a), Value::I64(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(I64, $body))
            }
            (Value::I128(a), Value::I128(b)) => {
                let ($x, $y) = (*a, *b);
                Ok($wrap!(I128, $body))
            }
            (a, b) => Err(VmError::type_mismatch(
                $op,
                format!("cannot apply to {} and {}", a.type_name(), b.type_name()),
            )),
        }
    };
}

macro_rules! same_tag {
    ($tag:ident, $e:expr) => {
        Value::$tag($e)
    };
}

macro_rules! to_bool {
    ($tag:ident, $e:expr) => {
        Value::Bool($e)
    };
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::U8(_) => "U8",
            Value::U16(_) => "U16",
            Value::U32(_) => "U32",
            Value::U64(_) => "U64",
            Value::U128(_) => "U128",
            Value::I8(_) => "I8",
            Value::I16(_) => "I16",
            Value::I32(_) => "I32",
            Value::I64(_) => "I64",
            Value::I128(_) => "I128",
            Value::Bool(_) => "Bool",
            Value::Str(_) => "String",
            Value::Ref(_) => "Ref",
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Value::Bool(_) | Value::Str(_) | Value::Ref(_))
    }

    /// Widens any integer to `i128`; `None` for non-integers and for `u128`
    /// values above `i128::MAX`.
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Value::U8(n) => n as i128,
            Value::U16(n) => n as i128,
            Value::U32(n) => n as i128,
            Value::U64(n) => n as i128,
            Value::U128(n) => i128::try_from(n).ok()?,
            Value::I8(n) => n as i128,
            Value::I16(n) => n as i128,
            Value::I32(n) => n as i128,
            Value::I64(n) => n as i128,
            Value::I128(n) => n,
            _ => return None,
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Condition test used by `JZ`/`JNZ`: integers test against zero,
    /// booleans against `false`.
    pub fn is_falsy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(!b),
            Value::U128(n) => Some(*n == 0),
            other => other.as_i128().map(|n| n == 0),
        }
    }

    /// Bytes this value adds to a heap object beyond its fixed slot.
    pub fn payload_bytes(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            _ => 0,
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(self, rhs, "ADD", |x, y| x.wrapping_add(y), same_tag)
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(self, rhs, "SUB", |x, y| x.wrapping_sub(y), same_tag)
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(self, rhs, "MUL", |x, y| x.wrapping_mul(y), same_tag)
    }

    pub fn div(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(
            self,
            rhs,
            "DIV",
            |x, y| {
                if y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                x.wrapping_div(y)
            },
            same_tag
        )
    }

    pub fn rem(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(
            self,
            rhs,
            "MOD",
            |x, y| {
                if y == 0 {
                    return Err(VmError::DivisionByZero);
                }
                x.wrapping_rem(y)
            },
            same_tag
        )
    }

    pub fn less_than(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(self, rhs, "LT", |x, y| x < y, to_bool)
    }

    pub fn less_or_equal(&self, rhs: &Value) -> Result<Value, VmError> {
        int_pair!(self, rhs, "LEQ", |x, y| x <= y, to_bool)
    }

    /// `EQ` works on any pair of identical tags.
    pub fn equals(&self, rhs: &Value) -> Result<Value, VmError> {
        if std::mem::discriminant(self) != std::mem::discriminant(rhs) {
            return Err(VmError::type_mismatch(
                "EQ",
                format!(
                    "cannot compare {} and {}",
                    self.type_name(),
                    rhs.type_name()
                ),
            ));
        }
        Ok(Value::Bool(self == rhs))
    }

    /// Arithmetic negation (`MIN`), wrapping at the operand's width.
    pub fn negate(&self) -> Result<Value, VmError> {
        Ok(match *self {
            Value::U8(n) => Value::U8(n.wrapping_neg()),
            Value::U16(n) => Value::U16(n.wrapping_neg()),
            Value::U32(n) => Value::U32(n.wrapping_neg()),
            Value::U64(n) => Value::U64(n.wrapping_neg()),
            Value::U128(n) => Value::U128(n.wrapping_neg()),
            Value::I8(n) => Value::I8(n.wrapping_neg()),
            Value::I16(n) => Value::I16(n.wrapping_neg()),
            Value::I32(n) => Value::I32(n.wrapping_neg()),
            Value::I64(n) => Value::I64(n.wrapping_neg()),
            Value::I128(n) => Value::I128(n.wrapping_neg()),
            ref other => {
                return Err(VmError::type_mismatch(
                    "MIN",
                    format!("expected an integer, got {}", other.type_name()),
                ));
            }
        })
    }

    /// Logical negation (`NEG`).
    pub fn not(&self) -> Result<Value, VmError> {
        match self {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(VmError::type_mismatch(
                "NEG",
                format!("expected Bool, got {}", other.type_name()),
            )),
        }
    }

    pub fn logical_or(&self, rhs: &Value) -> Result<Value, VmError> {
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a || *b)),
            (a, b) => Err(VmError::type_mismatch(
                "LOR",
                format!("expected two Bool, got {} and {}", a.type_name(), b.type_name()),
            )),
        }
    }

    pub fn logical_and(&self, rhs: &Value) -> Result<Value, VmError> {
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a && *b)),
            (a, b) => Err(VmError::type_mismatch(
                "LAND",
                format!("expected two Bool, got {} and {}", a.type_name(), b.type_name()),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(n) => write!(f, "{}", n),
            Value::U16(n) => write!(f, "{}", n),
            Value::U32(n) => write!(f, "{}", n),
            Value::U64(n) => write!(f, "{}", n),
            Value::U128(n) => write!(f, "{}", n),
            Value::I8(n) => write!(f, "{}", n),
            Value::I16(n) => write!(f, "{}", n),
            Value::I32(n) => write!(f, "{}", n),
            Value::I64(n) => write!(f, "{}", n),
            Value::I128(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Ref(r) => write!(f, "<ref {}>", r),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_wraps_at_declared_width() {
        assert_eq!(Value::U8(250).add(&Value::U8(10)), Ok(Value::U8(4)));
        assert_eq!(
            Value::I32(i32::MAX).add(&Value::I32(1)),
            Ok(Value::I32(i32::MIN))
        );
        assert_eq!(
            Value::I128(i128::MAX).add(&Value::I128(1)),
            Ok(Value::I128(i128::MIN))
        );
    }

    #[test]
    fn test_sub_and_mul_match_native_wrapping() {
        assert_eq!(Value::U16(0).sub(&Value::U16(1)), Ok(Value::U16(u16::MAX)));
        assert_eq!(Value::I8(-128).sub(&Value::I8(1)), Ok(Value::I8(127)));
        assert_eq!(
            Value::U64(u64::MAX).mul(&Value::U64(2)),
            Ok(Value::U64(u64::MAX.wrapping_mul(2)))
        );
        assert_eq!(Value::I16(-3).mul(&Value::I16(7)), Ok(Value::I16(-21)));
    }

    #[test]
    fn test_mixed_tags_are_rejected() {
        let err = Value::I32(1).add(&Value::I64(1)).unwrap_err();
        assert!(matches!(err, VmError::TypeMismatch { op: "ADD", .. }));

        let err = Value::I32(1).less_than(&Value::Bool(true)).unwrap_err();
        assert!(matches!(err, VmError::TypeMismatch { op: "LT", .. }));
    }

    #[test]
    fn test_division_by_zero_for_every_width() {
        let zeros = [
            (Value::U8(1), Value::U8(0)),
            (Value::U32(1), Value::U32(0)),
            (Value::U128(1), Value::U128(0)),
            (Value::I8(1), Value::I8(0)),
            (Value::I64(1), Value::I64(0)),
            (Value::I128(1), Value::I128(0)),
        ];
        for (a, b) in zeros {
            assert_eq!(a.div(&b), Err(VmError::DivisionByZero));
            assert_eq!(a.rem(&b), Err(VmError::DivisionByZero));
        }
    }

    #[test]
    fn test_signed_min_divided_by_minus_one_does_not_panic() {
        assert_eq!(
            Value::I32(i32::MIN).div(&Value::I32(-1)),
            Ok(Value::I32(i32::MIN))
        );
        assert_eq!(Value::I8(i8::MIN).rem(&Value::I8(-1)), Ok(Value::I8(0)));
    }

    #[test]
    fn test_division_truncates_toward_zero() {
        assert_eq!(Value::I32(-7).div(&Value::I32(2)), Ok(Value::I32(-3)));
        assert_eq!(Value::I32(-7).rem(&Value::I32(2)), Ok(Value::I32(-1)));
    }

    #[test]
    fn test_comparisons_produce_bools() {
        assert_eq!(Value::I32(2).less_than(&Value::I32(3)), Ok(Value::Bool(true)));
        assert_eq!(
            Value::U8(3).less_or_equal(&Value::U8(3)),
            Ok(Value::Bool(true))
        );
        assert_eq!(Value::from("a").equals(&Value::from("a")), Ok(Value::Bool(true)));
        assert_eq!(
            Value::Ref(HeapRef(1)).equals(&Value::Ref(HeapRef(2))),
            Ok(Value::Bool(false))
        );
        assert!(Value::Bool(true).equals(&Value::I32(1)).is_err());
    }

    #[test]
    fn test_negations() {
        assert_eq!(Value::I32(5).negate(), Ok(Value::I32(-5)));
        assert_eq!(Value::U8(1).negate(), Ok(Value::U8(255)));
        assert!(Value::Bool(true).negate().is_err());

        assert_eq!(Value::Bool(true).not(), Ok(Value::Bool(false)));
        assert!(Value::I32(0).not().is_err());
    }

    #[test]
    fn test_logical_ops_require_bools() {
        assert_eq!(
            Value::Bool(false).logical_or(&Value::Bool(true)),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            Value::Bool(true).logical_and(&Value::Bool(false)),
            Ok(Value::Bool(false))
        );
        assert!(Value::I32(1).logical_and(&Value::Bool(true)).is_err());
    }

    #[test]
    fn test_falsy_conditions() {
        assert_eq!(Value::I32(0).is_falsy(), Some(true));
        assert_eq!(Value::U128(u128::MAX).is_falsy(), Some(false));
        assert_eq!(Value::Bool(false).is_falsy(), Some(true));
        assert_eq!(Value::from("").is_falsy(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::I32(-1).to_string(), "-1");
        assert_eq!(Value::U128(u128::MAX).to_string(), u128::MAX.to_string());
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::from("hi").to_string(), "hi");
        assert_eq!(Value::Ref(HeapRef(3)).to_string(), "<ref #3>");
        assert_eq!(Value::Ref(HeapRef::NULL).to_string(), "<ref null>");
    }
}
