use std::collections::HashMap;
use std::fmt::Write;

use crate::bytecode::op::{Instruction, Opcode};
use crate::runtime::method_area::{MethodArea, RuntimeClass, RuntimeFunction};

/// Disassembly of every function and class layout in the area.
pub fn disassemble(area: &MethodArea) -> String {
    let mut out = String::from("=== BALL PROGRAM ===\n\n");

    for (index, function) in area.functions().iter().enumerate() {
        out.push_str("════════════════════════════════════════\n");
        let _ = writeln!(out, " #{} {}{}", index, function.name, function.signature());
        let _ = writeln!(
            out,
            " {} instructions, {} locals",
            function.code().len(),
            function.locals_count()
        );
        out.push_str("════════════════════════════════════════\n");
        out.push_str(&disassemble_function(function, area));
        out.push('\n');
    }

    for class in area.classes() {
        out.push_str(&format_class(class, area));
        out.push('\n');
    }

    out
}

/// One line per instruction. Jump targets get a marker and a separator line
/// above them.
pub fn disassemble_function(function: &RuntimeFunction, area: &MethodArea) -> String {
    let code = function.code();
    let jump_targets = collect_jump_targets(code);
    let mut output = String::new();

    for (pc, instr) in code.iter().enumerate() {
        let is_target = jump_targets.contains(&pc);
        if is_target {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        output.push_str(&format!("{:04} ", pc));
        output.push_str(if is_target { "► " } else { "  " });
        output.push_str(&format_instruction(instr, area));
        output.push('\n');
    }

    output
}

fn collect_jump_targets(code: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();
    for instr in code {
        if instr.opcode.is_jump() {
            let target = instr.arg() as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

/// Mnemonic, operand and what the operand refers to.
pub fn format_instruction(instr: &Instruction, area: &MethodArea) -> String {
    let Some(operand) = instr.operand else {
        return instr.opcode.mnemonic().to_string();
    };

    let note = match instr.opcode {
        Opcode::Ldc | Opcode::NewArr | Opcode::Halt => match area.constant(operand) {
            Ok(constant) => format!("; {}", constant),
            Err(_) => "; <bad constant>".to_string(),
        },
        Opcode::Ldv | Opcode::Store => format!("; local {}", operand),
        Opcode::Jmp | Opcode::Jz | Opcode::Jnz => format!("(→ {:04})", operand),
        Opcode::Call => match area.function(operand) {
            Ok(callee) => format!("; {}{}", callee.name, callee.signature()),
            Err(_) => "; <bad function>".to_string(),
        },
        _ => String::new(),
    };

    format!("{:<11} {:<5} {}", instr.opcode.mnemonic(), operand, note)
        .trim_end()
        .to_string()
}

fn format_class(class: &RuntimeClass, area: &MethodArea) -> String {
    let mut out = format!("class {} ({} bytes)\n", class.name, class.size);
    for field in &class.fields {
        let _ = writeln!(out, "  +{:04} {}: {}", field.offset, field.name, field.descriptor);
    }
    for &method in &class.methods {
        if let Ok(function) = area.function(method) {
            let _ = writeln!(out, "  method #{} {}", method, function.name);
        }
    }
    out
}

// =============================================================================
// Statistics
// =============================================================================

/// Instruction counts and the most frequent mnemonics.
pub fn statistics(area: &MethodArea) -> String {
    let mut out = String::from("=== BYTECODE STATISTICS ===\n\n");

    let total_ops: usize = area.functions().iter().map(|f| f.code().len()).sum();
    let _ = writeln!(out, "Constants:        {}", area.constants().len());
    let _ = writeln!(out, "Functions:        {}", area.functions().len());
    let _ = writeln!(out, "Classes:          {}", area.classes().len());
    let _ = writeln!(out, "Instructions:     {}", total_ops);
    out.push('\n');

    let mut op_counts: HashMap<&'static str, usize> = HashMap::new();
    for function in area.functions() {
        count_ops(function.code(), &mut op_counts);
    }

    out.push_str("Op frequency:\n");
    let mut counts: Vec<_> = op_counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total_ops as f64) * 100.0;
        let _ = writeln!(out, "  {:<14} {:>4} ({:>5.1}%)", op, count, pct);
    }
    out
}

pub fn count_ops(code: &[Instruction], counts: &mut HashMap<&'static str, usize>) {
    for instr in code {
        *counts.entry(instr.opcode.mnemonic()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode::*;
    use crate::bytecode::test_support::{BallBuilder, arg, array_ball, function_ball, ins};

    #[test]
    fn test_annotates_constants_and_calls() {
        let area = function_ball().to_area();
        let main = area.function_by_name("Main").unwrap();
        let text = disassemble_function(main, &area);

        assert!(text.contains("0000   LDC"), "{}", text);
        assert!(text.contains("; I32 1"));
        assert!(text.contains("; Sum(I32;I32;) -> I32;"));
        assert!(text.contains("; local 2"));
        assert_eq!(text.lines().count(), main.code().len());
    }

    #[test]
    fn test_jump_targets_are_marked() {
        let mut b = BallBuilder::new();
        let flag = b.constant(crate::bytecode::constant::Constant::bool(false));
        b.function(
            "Main",
            "",
            "void;",
            0,
            vec![arg(Ldc, flag), arg(Jz, 3), arg(Jmp, 3), ins(Ret)],
        );
        let area = b.to_area();
        let text = disassemble_function(&area.functions()[0], &area);

        assert!(text.contains("0003 ► RET"), "{}", text);
        assert!(text.contains("(→ 0003)"));
        assert_eq!(text.matches("┌───").count(), 1);
    }

    #[test]
    fn test_whole_area_lists_classes() {
        let mut b = array_ball();
        b.class("Point", &[("x", "I;"), ("y", "I;")], vec![]);
        let text = disassemble(&b.to_area());

        assert!(text.contains("#0 Main() -> void;"));
        assert!(text.contains("NEWARR"));
        assert!(text.contains("class Point (8 bytes)"));
        assert!(text.contains("  +0004 y: I32;"));
    }

    #[test]
    fn test_op_counts() {
        let area = function_ball().to_area();
        let mut counts = HashMap::new();
        for function in area.functions() {
            count_ops(function.code(), &mut counts);
        }

        assert_eq!(counts.get("LDV"), Some(&5));
        assert_eq!(counts.get("STORE"), Some(&5));
        assert_eq!(counts.get("CALL"), Some(&1));
        assert_eq!(counts.get("RET"), Some(&2));

        let stats = statistics(&area);
        assert!(stats.contains("Functions:        2"));
        assert!(stats.contains("Instructions:     17"));
    }
}
