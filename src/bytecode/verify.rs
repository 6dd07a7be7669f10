use crate::bytecode::op::Opcode;
use crate::runtime::method_area::{MethodArea, RuntimeFunction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub function: String,
    pub pc: usize,
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "verify error in {} at pc={}: {}",
            self.function, self.pc, self.message
        )
    }
}

impl std::error::Error for VerifyError {}

impl VerifyError {
    fn new(function: &RuntimeFunction, pc: usize, message: impl Into<String>) -> Self {
        Self {
            function: function.name.clone(),
            pc,
            message: message.into(),
        }
    }
}

/// Verify every function registered at or after `first`.
pub fn verify_from(area: &MethodArea, first: usize) -> Result<(), VerifyError> {
    for function in area.functions().iter().skip(first) {
        verify_function(function, area)?;
    }
    Ok(())
}

pub fn verify_function(function: &RuntimeFunction, area: &MethodArea) -> Result<(), VerifyError> {
    check_operands(function, area)?;
    check_stack_heights(function, area)
}

fn check_operands(function: &RuntimeFunction, area: &MethodArea) -> Result<(), VerifyError> {
    let len = function.code().len();
    let locals = function.locals_count();

    for (pc, instr) in function.code().iter().enumerate() {
        let operand = instr.arg();
        let fail = |message: String| -> Result<(), VerifyError> {
            Err(VerifyError::new(function, pc, message))
        };

        match instr.opcode {
            Opcode::Ldc => {
                if let Err(e) = area.constant_value(operand) {
                    return fail(format!("LDC {}: {}", operand, e));
                }
            }
            Opcode::NewArr => match area.descriptor(operand) {
                Ok(element) if element.is_void() => {
                    return fail(format!("NEWARR {}: array of void", operand));
                }
                Ok(_) => {}
                Err(e) => return fail(format!("NEWARR {}: {}", operand, e)),
            },
            Opcode::Halt => match area.constant(operand) {
                Ok(c) if c.tag.is_integer() => {}
                Ok(c) => {
                    return fail(format!("HALT {}: exit code constant has tag {}", operand, c.tag));
                }
                Err(e) => return fail(format!("HALT {}: {}", operand, e)),
            },
            Opcode::Ldv | Opcode::Store => {
                if operand as usize >= locals {
                    return fail(format!(
                        "{} {}: only {} local slots",
                        instr.opcode, operand, locals
                    ));
                }
            }
            Opcode::Jmp | Opcode::Jz | Opcode::Jnz => {
                if operand as usize >= len {
                    return fail(format!(
                        "{} {}: target outside code of length {}",
                        instr.opcode, operand, len
                    ));
                }
            }
            Opcode::Call => {
                if let Err(e) = area.function(operand) {
                    return fail(format!("CALL {}: {}", operand, e));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Returns (pops, pushes) for the instruction at hand, resolving CALL and RET
/// against the method area.
fn effect(function: &RuntimeFunction, opcode: Opcode, operand: u32, area: &MethodArea) -> (usize, usize) {
    match opcode {
        Opcode::Call => match area.function(operand) {
            Ok(callee) => (callee.arity(), usize::from(!callee.return_type.is_void())),
            Err(_) => (0, 0),
        },
        Opcode::Ret => (usize::from(!function.return_type.is_void()), 0),
        other => other.stack_effect().unwrap_or((0, 0)),
    }
}

/// Stack heights per basic-block entry: every path into an instruction must
/// agree on the height, and no path may pop below zero. Arguments are seeded
/// onto the operand stack, so the entry height is the arity.
fn check_stack_heights(function: &RuntimeFunction, area: &MethodArea) -> Result<(), VerifyError> {
    let code = function.code();
    if code.is_empty() {
        return Ok(());
    }

    let mut heights: Vec<Option<usize>> = vec![None; code.len()];
    heights[0] = Some(function.arity());
    let mut worklist = vec![0usize];

    while let Some(pc) = worklist.pop() {
        let Some(h) = heights[pc] else { continue };
        let instr = code[pc];
        let (pops, pushes) = effect(function, instr.opcode, instr.arg(), area);

        if h < pops {
            return Err(VerifyError::new(
                function,
                pc,
                format!(
                    "stack underflow at {}, needed {} items, have {}",
                    instr, pops, h
                ),
            ));
        }
        let next = h - pops + pushes;

        let successors = match instr.opcode {
            Opcode::Ret | Opcode::Halt => vec![],
            Opcode::Jmp => vec![instr.arg() as usize],
            Opcode::Jz | Opcode::Jnz => vec![pc + 1, instr.arg() as usize],
            _ => vec![pc + 1],
        };

        for succ in successors {
            // Falling off the end is reported by the interpreter as a missing
            // return.
            if succ >= code.len() {
                continue;
            }
            match heights[succ] {
                None => {
                    heights[succ] = Some(next);
                    worklist.push(succ);
                }
                Some(seen) if seen != next => {
                    return Err(VerifyError::new(
                        function,
                        succ,
                        format!(
                            "inconsistent stack height at join: {} vs {}",
                            seen, next
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::constant::Constant;
    use crate::bytecode::op::Opcode::*;
    use crate::bytecode::test_support::{
        BallBuilder, arg, array_ball, function_ball, ins, simple_ball,
    };

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Verify the last function added to the builder.
    fn verify_last(b: &BallBuilder) -> Result<(), VerifyError> {
        let area = b.to_area();
        let last = area.functions().len() - 1;
        verify_function(&area.functions()[last], &area)
    }

    /// Build `Main` with the given code and locals, then verify it.
    fn verify_main(locals: u16, code: Vec<crate::bytecode::op::Instruction>) -> Result<(), VerifyError> {
        let mut b = BallBuilder::new();
        b.function("Main", "", "void;", locals, code);
        verify_last(&b)
    }

    fn assert_rejected(result: Result<(), VerifyError>, needle: &str) {
        match result {
            Err(e) => assert!(
                e.message.contains(needle),
                "expected '{}' in '{}'",
                needle,
                e.message
            ),
            Ok(()) => panic!("expected verification to fail with '{}'", needle),
        }
    }

    // =========================================================================
    // Accepted programs
    // =========================================================================

    #[test]
    fn test_reference_programs_verify() {
        for b in [simple_ball(), array_ball(), function_ball()] {
            let area = b.to_area();
            assert_eq!(verify_from(&area, 0), Ok(()));
        }
    }

    #[test]
    fn test_arguments_count_toward_entry_height() {
        let mut b = BallBuilder::new();
        b.function("Id", "I;", "I;", 0, vec![ins(Ret)]);
        assert_eq!(verify_last(&b), Ok(()));
    }

    #[test]
    fn test_loop_with_balanced_heights() {
        // i = 3; while i != 0 { i = i - 1 }
        let mut b = BallBuilder::new();
        let three = b.int(3);
        let one = b.int(1);
        b.function(
            "Main",
            "",
            "void;",
            1,
            vec![
                arg(Ldc, three),
                arg(Store, 0),
                arg(Ldv, 0),
                arg(Jz, 9),
                arg(Ldv, 0),
                arg(Ldc, one),
                ins(Sub),
                arg(Store, 0),
                arg(Jmp, 2),
                ins(Ret),
            ],
        );
        assert_eq!(verify_last(&b), Ok(()));
    }

    // =========================================================================
    // Operand checks
    // =========================================================================

    #[test]
    fn test_local_out_of_range() {
        assert_rejected(verify_main(1, vec![arg(Ldv, 1), ins(Print), ins(Ret)]), "only 1 local slots");
    }

    #[test]
    fn test_jump_out_of_bounds() {
        assert_rejected(verify_main(0, vec![arg(Jmp, 5), ins(Ret)]), "target outside code");
    }

    #[test]
    fn test_ldc_out_of_range() {
        assert_rejected(verify_main(0, vec![arg(Ldc, 40), ins(Print), ins(Ret)]), "LDC 40");
    }

    #[test]
    fn test_ldc_of_class_constant_rejected() {
        let mut b = BallBuilder::new();
        let point = b.constant(Constant::class("Point"));
        b.function("Main", "", "void;", 0, vec![arg(Ldc, point), ins(Print), ins(Ret)]);
        assert_rejected(verify_last(&b), "cannot be loaded as a value");
    }

    #[test]
    fn test_halt_needs_integer_constant() {
        let mut b = BallBuilder::new();
        let text = b.string("bye");
        b.function("Main", "", "void;", 0, vec![arg(Halt, text)]);
        assert_rejected(verify_last(&b), "exit code constant");
    }

    #[test]
    fn test_newarr_needs_descriptor() {
        let mut b = BallBuilder::new();
        let size = b.int(2);
        b.function("Main", "", "void;", 0, vec![arg(Ldc, size), arg(NewArr, size), ins(Print), ins(Ret)]);
        assert_rejected(verify_last(&b), "NEWARR");
    }

    #[test]
    fn test_call_out_of_range() {
        assert_rejected(verify_main(0, vec![arg(Call, 9), ins(Ret)]), "CALL 9");
    }

    // =========================================================================
    // Stack heights
    // =========================================================================

    #[test]
    fn test_underflow_rejected() {
        let err = verify_main(0, vec![ins(Add), ins(Ret)]).unwrap_err();
        assert_eq!(err.pc, 0);
        assert!(err.message.contains("needed 2 items, have 0"));
    }

    #[test]
    fn test_call_pops_arity() {
        let mut b = BallBuilder::new();
        let sum = b.function("Sum", "I;I;", "I;", 2, vec![ins(Add), ins(Ret)]);
        let one = b.int(1);
        b.function("Main", "", "void;", 0, vec![arg(Ldc, one), arg(Call, sum), ins(Print), ins(Ret)]);
        assert_rejected(verify_last(&b), "needed 2 items, have 1");
    }

    #[test]
    fn test_non_void_return_needs_value() {
        let mut b = BallBuilder::new();
        b.function("Answer", "", "I;", 0, vec![ins(Ret)]);
        assert_rejected(verify_last(&b), "needed 1 items, have 0");
    }

    #[test]
    fn test_inconsistent_join_rejected() {
        let mut b = BallBuilder::new();
        let flag = b.constant(Constant::bool(true));
        let one = b.int(1);
        // One path pushes an extra value before reaching pc 4.
        b.function(
            "Main",
            "",
            "void;",
            0,
            vec![
                arg(Ldc, flag),
                arg(Jz, 4),
                arg(Ldc, one),
                arg(Jmp, 4),
                ins(Ret),
            ],
        );
        assert_rejected(verify_last(&b), "inconsistent stack height");
    }

    #[test]
    fn test_display_format() {
        let err = verify_main(0, vec![ins(Print), ins(Ret)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "verify error in Main at pc=0: stack underflow at PRINT, needed 1 items, have 0"
        );
    }
}
