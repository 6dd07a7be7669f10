use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// OPCODE - Instruction selectors as encoded in .ball files
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    // constants & locals
    Ldc = 0x01,
    Store = 0x04,
    Ldv = 0x05,

    // stack ops
    Dup = 0x02,
    Swap = 0x03,

    // arithmetic
    Add = 0x06,
    Mul = 0x0D,
    Min = 0x0E,
    Sub = 0x0F,
    Div = 0x10,
    Mod = 0x19,

    // comparison & logic
    Eq = 0x12,
    Lt = 0x13,
    Leq = 0x14,
    Neg = 0x18,
    Lor = 0x1A,
    Land = 0x1B,

    // control flow
    Call = 0x11,
    Ret = 0x08,
    Halt = 0x09,
    Jmp = 0x15,
    Jz = 0x16,
    Jnz = 0x17,

    // arrays
    NewArr = 0x0A,
    StElem = 0x0B,
    LdElem = 0x0C,

    // I/O
    Print = 0x07,
}

impl Opcode {
    pub const ALL: [Opcode; 27] = [
        Opcode::Ldc,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::Store,
        Opcode::Ldv,
        Opcode::Add,
        Opcode::Print,
        Opcode::Ret,
        Opcode::Halt,
        Opcode::NewArr,
        Opcode::StElem,
        Opcode::LdElem,
        Opcode::Mul,
        Opcode::Min,
        Opcode::Sub,
        Opcode::Div,
        Opcode::Call,
        Opcode::Eq,
        Opcode::Lt,
        Opcode::Leq,
        Opcode::Jmp,
        Opcode::Jz,
        Opcode::Jnz,
        Opcode::Neg,
        Opcode::Mod,
        Opcode::Lor,
        Opcode::Land,
    ];

    pub fn from_u16(code: u16) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| *op as u16 == code)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the encoded instruction carries a u16 operand after the opcode.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::Ldc
                | Opcode::Store
                | Opcode::Ldv
                | Opcode::NewArr
                | Opcode::Call
                | Opcode::Halt
                | Opcode::Jmp
                | Opcode::Jz
                | Opcode::Jnz
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jz | Opcode::Jnz)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Ldc => "LDC",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Store => "STORE",
            Opcode::Ldv => "LDV",
            Opcode::Add => "ADD",
            Opcode::Print => "PRINT",
            Opcode::Ret => "RET",
            Opcode::Halt => "HALT",
            Opcode::NewArr => "NEWARR",
            Opcode::StElem => "STELEM",
            Opcode::LdElem => "LDELEM",
            Opcode::Mul => "MUL",
            Opcode::Min => "MIN",
            Opcode::Sub => "SUB",
            Opcode::Div => "DIV",
            Opcode::Call => "CALL",
            Opcode::Eq => "EQ",
            Opcode::Lt => "LT",
            Opcode::Leq => "LEQ",
            Opcode::Jmp => "JMP",
            Opcode::Jz => "JZ",
            Opcode::Jnz => "JNZ",
            Opcode::Neg => "NEG",
            Opcode::Mod => "MOD",
            Opcode::Lor => "LOR",
            Opcode::Land => "LAND",
        }
    }

    /// `( pops -- pushes )` for opcodes with a fixed effect. CALL and RET
    /// depend on the function involved and return `None`.
    pub fn stack_effect(self) -> Option<(usize, usize)> {
        Some(match self {
            Opcode::Ldc | Opcode::Ldv => (0, 1),
            Opcode::Store | Opcode::Print | Opcode::Jz | Opcode::Jnz => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Swap => (2, 2),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Lt
            | Opcode::Leq
            | Opcode::Lor
            | Opcode::Land
            | Opcode::LdElem => (2, 1),
            Opcode::Min | Opcode::Neg | Opcode::NewArr => (1, 1),
            Opcode::StElem => (3, 0),
            Opcode::Halt | Opcode::Jmp => (0, 0),
            Opcode::Call | Opcode::Ret => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A decoded instruction. Operands are widened to u32 in memory so indices
/// can be relocated past the u16 range when several files share one area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Option<u32>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            operand: None,
        }
    }

    pub fn with_operand(opcode: Opcode, operand: u32) -> Self {
        Instruction {
            opcode,
            operand: Some(operand),
        }
    }

    /// Operand of an instruction whose opcode requires one; decoding and
    /// image loading guarantee its presence, so a missing operand reads as 0.
    pub fn arg(&self) -> u32 {
        self.operand.unwrap_or(0)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Some(operand) => write!(f, "{} {}", self.opcode, operand),
            None => write!(f, "{}", self.opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_table() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u16(op.code()), Some(op));
        }
        assert_eq!(Opcode::from_u16(0x00), None);
        assert_eq!(Opcode::from_u16(0x1C), None);
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(Opcode::Ldc.code(), 0x01);
        assert_eq!(Opcode::Halt.code(), 0x09);
        assert_eq!(Opcode::Call.code(), 0x11);
        assert_eq!(Opcode::Land.code(), 0x1B);
    }

    #[test]
    fn test_operand_presence() {
        let with: Vec<_> = Opcode::ALL.iter().filter(|op| op.has_operand()).collect();
        assert_eq!(with.len(), 9);
        assert!(Opcode::Halt.has_operand());
        assert!(!Opcode::Ret.has_operand());
        assert!(!Opcode::StElem.has_operand());
    }

    #[test]
    fn test_instruction_display() {
        assert_eq!(Instruction::with_operand(Opcode::Ldc, 3).to_string(), "LDC 3");
        assert_eq!(Instruction::new(Opcode::Add).to_string(), "ADD");
    }
}
