//! Clean-up pass run on a function before native emission.
//!
//! Constants are first flattened into lane immediates ([`Step::Push`]), so
//! folding never has to grow the shared constant pool. The pass then splits
//! the code into basic blocks, drops blocks control can never reach, folds
//! constant arithmetic inside straight-line runs and removes jumps to the
//! very next step. Every removal compacts the code and retargets jumps.

use std::collections::{BTreeSet, HashSet};

use crate::bytecode::op::{Instruction, Opcode};
use crate::lang::value::Value;
use crate::runtime::jit::{JitError, Lane, to_lane};
use crate::runtime::method_area::{MethodArea, RuntimeFunction};

/// One unit of native code: a constant already in lane form, or a bytecode
/// instruction emitted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Push(i64),
    Op(Instruction),
}

impl Step {
    fn opcode(&self) -> Option<Opcode> {
        match self {
            Step::Op(instr) => Some(instr.opcode),
            Step::Push(_) => None,
        }
    }

    fn jump_target(&self) -> Option<usize> {
        match self {
            Step::Op(instr) if instr.opcode.is_jump() => Some(instr.arg() as usize),
            _ => None,
        }
    }

    fn is_terminator(&self) -> bool {
        self.jump_target().is_some() || self.opcode() == Some(Opcode::Ret)
    }

    fn retarget(&mut self, target: usize) {
        if let Step::Op(instr) = self {
            if instr.opcode.is_jump() {
                instr.operand = Some(target as u32);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// First step, inclusive.
    pub start: usize,
    /// One past the last step.
    pub end: usize,
    pub succs: Vec<usize>,
    pub reachable: bool,
}

/// Replace every `LDC` with its lane value.
pub fn lower(function: &RuntimeFunction, area: &MethodArea) -> Result<Vec<Step>, JitError> {
    function
        .code()
        .iter()
        .map(|instr| {
            if instr.opcode != Opcode::Ldc {
                return Ok(Step::Op(*instr));
            }
            let value = area.constant_value(instr.arg())?;
            let raw = match value {
                Value::Bool(b) => b as i64,
                other => to_lane(&other).ok_or_else(|| JitError::Unsupported {
                    function: function.name.clone(),
                    reason: format!("constant {} does not fit the lane", other),
                })?,
            };
            Ok(Step::Push(raw))
        })
        .collect()
}

/// Run every pass, in order.
pub fn optimize(code: Vec<Step>, lane: Lane) -> Vec<Step> {
    let code = remove_unreachable(&code);
    let code = fold_constants(&code, lane);
    remove_redundant_jumps(&code)
}

// =============================================================================
// Control flow
// =============================================================================

/// Split `code` at leaders: the entry, every jump target and every step
/// following a terminator. Successor edges point at block indices.
pub fn build_blocks(code: &[Step]) -> Vec<BasicBlock> {
    let mut leaders = BTreeSet::new();
    if !code.is_empty() {
        leaders.insert(0);
    }
    for (pc, step) in code.iter().enumerate() {
        if let Some(target) = step.jump_target() {
            if target < code.len() {
                leaders.insert(target);
            }
        }
        if step.is_terminator() && pc + 1 < code.len() {
            leaders.insert(pc + 1);
        }
    }

    let starts: Vec<usize> = leaders.into_iter().collect();
    let block_of = |pc: usize| starts.partition_point(|&s| s <= pc).checked_sub(1);

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(code.len());
            let last = code[end - 1];
            let mut succs = Vec::new();

            if let Some(target) = last.jump_target() {
                succs.extend(block_of(target).filter(|_| target < code.len()));
            }
            let falls_through = !matches!(last.opcode(), Some(Opcode::Ret | Opcode::Jmp));
            if falls_through && end < code.len() {
                succs.extend(block_of(end));
            }

            BasicBlock {
                start,
                end,
                succs,
                reachable: false,
            }
        })
        .collect()
}

pub fn mark_reachable(blocks: &mut [BasicBlock]) {
    if blocks.is_empty() {
        return;
    }
    let mut worklist = vec![0];
    while let Some(id) = worklist.pop() {
        if blocks[id].reachable {
            continue;
        }
        blocks[id].reachable = true;
        worklist.extend(blocks[id].succs.iter().copied());
    }
}

/// Drop every block control cannot reach from the entry.
pub fn remove_unreachable(code: &[Step]) -> Vec<Step> {
    let mut blocks = build_blocks(code);
    mark_reachable(&mut blocks);

    let mut keep = vec![false; code.len()];
    for block in blocks.iter().filter(|b| b.reachable) {
        keep[block.start..block.end].fill(true);
    }
    compact(code, &keep)
}

/// Keep the flagged steps and point each jump at the new position of its
/// target, or of the first kept step after it.
pub fn compact(code: &[Step], keep: &[bool]) -> Vec<Step> {
    // old_to_new[pc] is where the first kept step at or after pc lands
    let mut old_to_new = vec![0usize; code.len() + 1];
    let mut next = 0;
    for pc in 0..code.len() {
        old_to_new[pc] = next;
        if keep[pc] {
            next += 1;
        }
    }
    old_to_new[code.len()] = next;

    code.iter()
        .zip(keep)
        .filter(|(_, keep)| **keep)
        .map(|(step, _)| {
            let mut step = *step;
            if let Some(target) = step.jump_target() {
                step.retarget(old_to_new[target.min(code.len())]);
            }
            step
        })
        .collect()
}

// =============================================================================
// Folding
// =============================================================================

/// Evaluate `ADD`/`SUB`/`MUL`/`DIV` over constant operands. Runs never cross
/// a jump target, and division by zero is left for run time.
pub fn fold_constants(code: &[Step], lane: Lane) -> Vec<Step> {
    let targets: HashSet<usize> = code.iter().filter_map(Step::jump_target).collect();

    let mut out = code.to_vec();
    let mut keep = vec![true; code.len()];
    // (known value, step that produces it)
    let mut stack: Vec<(Option<i64>, usize)> = Vec::new();

    for pc in 0..code.len() {
        if targets.contains(&pc) {
            stack.clear();
        }

        let step = out[pc];
        match step {
            Step::Push(v) => stack.push((Some(v), pc)),
            Step::Op(instr)
                if matches!(instr.opcode, Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div) =>
            {
                if stack.len() < 2 {
                    stack.clear();
                    continue;
                }
                let (b, b_at) = stack.pop().unwrap_or((None, pc));
                let (a, a_at) = stack.pop().unwrap_or((None, pc));
                let folded = match (a, b) {
                    (Some(a), Some(b)) => fold(instr.opcode, a, b, lane),
                    _ => None,
                };
                match folded {
                    Some(v) => {
                        out[a_at] = Step::Push(v);
                        keep[b_at] = false;
                        keep[pc] = false;
                        stack.push((Some(v), a_at));
                    }
                    None => stack.push((None, pc)),
                }
            }
            Step::Op(_) => stack.clear(),
        }
    }

    compact(&out, &keep)
}

fn fold(opcode: Opcode, a: i64, b: i64, lane: Lane) -> Option<i64> {
    let v = match opcode {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div if b != 0 => a.wrapping_div(b),
        _ => return None,
    };
    Some(lane.wrap(v))
}

/// Drop `JMP`s whose target is the next step.
pub fn remove_redundant_jumps(code: &[Step]) -> Vec<Step> {
    let keep: Vec<bool> = code
        .iter()
        .enumerate()
        .map(|(pc, step)| !(step.opcode() == Some(Opcode::Jmp) && step.jump_target() == Some(pc + 1)))
        .collect();
    compact(code, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode::*;
    use crate::bytecode::test_support::{arg, ins};

    fn op(opcode: Opcode) -> Step {
        Step::Op(ins(opcode))
    }

    fn jump(opcode: Opcode, target: u32) -> Step {
        Step::Op(arg(opcode, target))
    }

    // =========================================================================
    // Unreachable code
    // =========================================================================

    #[test]
    fn test_removes_unreachable_block() {
        let code = vec![jump(Jmp, 2), Step::Push(1), op(Ret)];
        let out = remove_unreachable(&code);
        assert_eq!(out, vec![jump(Jmp, 1), op(Ret)]);
    }

    #[test]
    fn test_removes_dead_tail() {
        let code = vec![op(Ret), op(Add), op(Add)];
        assert_eq!(remove_unreachable(&code), vec![op(Ret)]);
    }

    #[test]
    fn test_conditional_jump_keeps_fallthrough() {
        let code = vec![Step::Push(0), jump(Jz, 4), Step::Push(1), op(Ret), op(Ret)];
        assert_eq!(remove_unreachable(&code), code);
    }

    #[test]
    fn test_jump_retargeted_after_compaction() {
        let code = vec![jump(Jmp, 3), Step::Push(1), Step::Push(2), op(Ret)];
        let out = remove_unreachable(&code);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].jump_target(), Some(1));
    }

    #[test]
    fn test_several_jumps_to_one_block() {
        let code = vec![
            Step::Push(0),
            jump(Jz, 5),
            jump(Jmp, 5),
            op(Add),
            op(Add),
            op(Ret),
        ];
        let out = remove_unreachable(&code);
        assert_eq!(out, vec![Step::Push(0), jump(Jz, 3), jump(Jmp, 3), op(Ret)]);
    }

    #[test]
    fn test_loop_back_edge_kept() {
        let code = vec![Step::Push(0), Step::Push(1), jump(Jnz, 1), op(Ret)];
        assert_eq!(remove_unreachable(&code), code);
    }

    #[test]
    fn test_jump_into_middle_of_block() {
        let code = vec![
            Step::Push(0),
            Step::Push(1),
            Step::Push(2),
            jump(Jmp, 1),
            op(Ret),
        ];
        let out = remove_unreachable(&code);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], jump(Jmp, 1));
    }

    #[test]
    fn test_fully_unreachable_region() {
        let code = vec![op(Ret), op(Add), jump(Jmp, 4), op(Add), op(Ret)];
        assert_eq!(remove_unreachable(&code), vec![op(Ret)]);
    }

    #[test]
    fn test_blocks_and_edges() {
        // 0: JZ 3 | 1: PUSH, 2: RET | 3: RET
        let code = vec![jump(Jz, 3), Step::Push(1), op(Ret), op(Ret)];
        let blocks = build_blocks(&code);
        let spans: Vec<_> = blocks.iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(spans, vec![(0, 1), (1, 3), (3, 4)]);
        assert_eq!(blocks[0].succs, vec![2, 1]);
        assert!(blocks[1].succs.is_empty());
    }

    // =========================================================================
    // Folding
    // =========================================================================

    #[test]
    fn test_folds_simple_add() {
        let code = vec![Step::Push(2), Step::Push(3), op(Add), op(Ret)];
        assert_eq!(fold_constants(&code, Lane::I32), vec![Step::Push(5), op(Ret)]);
    }

    #[test]
    fn test_folds_chains() {
        // (2 + 3) * 4
        let code = vec![
            Step::Push(2),
            Step::Push(3),
            op(Add),
            Step::Push(4),
            op(Mul),
            op(Ret),
        ];
        assert_eq!(fold_constants(&code, Lane::I32), vec![Step::Push(20), op(Ret)]);

        // 1 + 2 + 3
        let code = vec![
            Step::Push(1),
            Step::Push(2),
            op(Add),
            Step::Push(3),
            op(Add),
            op(Ret),
        ];
        assert_eq!(fold_constants(&code, Lane::I32), vec![Step::Push(6), op(Ret)]);
    }

    #[test]
    fn test_unknown_operand_not_folded() {
        let code = vec![Step::Op(arg(Ldv, 0)), Step::Push(3), op(Add), op(Ret)];
        assert_eq!(fold_constants(&code, Lane::I32), code);
    }

    #[test]
    fn test_folding_wraps_and_skips_zero_division() {
        let code = vec![Step::Push(i32::MAX as i64), Step::Push(1), op(Add), op(Ret)];
        assert_eq!(
            fold_constants(&code, Lane::I32),
            vec![Step::Push(i32::MIN as i64), op(Ret)]
        );
        assert_eq!(
            fold_constants(&code, Lane::I64),
            vec![Step::Push(i32::MAX as i64 + 1), op(Ret)]
        );

        let code = vec![Step::Push(7), Step::Push(0), op(Div), op(Ret)];
        assert_eq!(fold_constants(&code, Lane::I32), code);
    }

    #[test]
    fn test_folding_stops_at_jump_targets() {
        // the second push is also reached from the back edge
        let code = vec![Step::Push(1), Step::Push(2), op(Add), jump(Jmp, 1)];
        assert_eq!(fold_constants(&code, Lane::I32), code);
    }

    #[test]
    fn test_folding_retargets_later_jumps() {
        let code = vec![
            Step::Push(2),
            Step::Push(3),
            op(Sub),
            jump(Jz, 5),
            op(Ret),
            op(Ret),
        ];
        let out = fold_constants(&code, Lane::I32);
        assert_eq!(out, vec![Step::Push(-1), jump(Jz, 3), op(Ret), op(Ret)]);
    }

    // =========================================================================
    // Jumps
    // =========================================================================

    #[test]
    fn test_removes_jump_to_next_step() {
        let code = vec![Step::Push(1), jump(Jmp, 2), op(Ret)];
        assert_eq!(remove_redundant_jumps(&code), vec![Step::Push(1), op(Ret)]);
    }

    #[test]
    fn test_full_pipeline() {
        // PUSH 1; JMP 3; PUSH 2 (dead); RET
        let code = vec![Step::Push(1), jump(Jmp, 3), Step::Push(2), op(Ret)];
        assert_eq!(optimize(code, Lane::I32), vec![Step::Push(1), op(Ret)]);
    }
}
