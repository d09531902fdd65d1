//! Human-readable disassembly of a bytecode program.

use std::fmt::Write as _;

use crate::processor::bytecode::{Bytecode, JumpTarget};

/// One line per instruction: `pc  MNEMONIC operand`, with the absolute
/// destination appended to relative jumps.
pub fn render(code: &Bytecode) -> String {
    let width = code.len().max(1).to_string().len();
    let mut out = String::new();
    for (pc, instruction) in code.iter().enumerate() {
        let _ = write!(out, "{pc:>width$}  {instruction}");
        if let Some(JumpTarget::Offset(offset)) = instruction.jump_target() {
            let _ = write!(out, "  -> {}", pc as i64 + i64::from(*offset));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::bytecode::Instruction;
    use crate::processor::decimal::Decimal;

    #[test]
    fn test_render() {
        let code: Bytecode = (0..10)
            .map(|_| Instruction::Nop)
            .chain([
                Instruction::PushNum(Decimal::from(2)),
                Instruction::Jnz(JumpTarget::Offset(-11)),
                Instruction::Ret,
            ])
            .collect();
        let listing = render(&code);
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 13);
        assert!(lines[0].starts_with(" 0  "), "{}", lines[0]);
        assert!(lines[11].starts_with("11  "), "{}", lines[11]);
        assert!(lines[11].ends_with("-> 0"), "{}", lines[11]);
        assert!(!lines[12].contains("->"));
    }
}
