//! Local instruction optimizations.
//!
//! These transforms produce smaller encodings without changing observable
//! behavior:
//!
//! - **Negated immediate**: `add rd, rs, -200` becomes `sub rd, rs, 200`
//!   (and vice versa) when the negated constant fits a narrower field.
//! - **Jump merge**: an arithmetic operation immediately followed by a
//!   conditional jump testing the same register fuses into a combined
//!   arithmetic-and-jump instruction, saving a word and a flag round trip.

use crate::encoder::{fit_integer, Code, FIT_I16, FIT_I8, FIT_J16, FIT_J8};
use crate::expr::Value;
use crate::ir::{
    II_ADD, II_ADD_JUMP_NOTZERO, II_ADD_JUMP_ZERO, II_JUMP_NOTZERO, II_JUMP_ZERO, II_SUB,
    II_SUB_JUMP_NOTZERO, II_SUB_JUMP_ZERO,
};
use crate::itable::InstructionTable;

/// Apply local optimizations to a single code (mutates in place).
///
/// Returns `true` if the code was changed.
pub fn optimize_code(code: &mut Code, itab: &InstructionTable) -> bool {
    try_negated_immediate(code, itab)
}

/// `add rd, rs, x` where `−x` fits a narrower field → `sub rd, rs, −x`
/// (and symmetrically for `sub`).
fn try_negated_immediate(code: &mut Code, itab: &InstructionTable) -> bool {
    let flipped = match code.id {
        II_ADD => II_SUB,
        II_SUB => II_ADD,
        _ => return false,
    };
    let Value::Int(v) = code.imm else {
        return false;
    };
    if code.imm_sym.is_some() || v == i64::MIN {
        return false;
    }
    let fits = fit_integer(v);
    let neg_fits = fit_integer(-v);
    // Only worthwhile when the negated value drops a size class.
    let better = (fits & FIT_I8 == 0 && neg_fits & FIT_I8 != 0)
        || (fits & (FIT_I8 | FIT_I16) == 0 && neg_fits & FIT_I16 != 0);
    // The J bits of the original value witness the same fact.
    debug_assert!(!better || fits & (FIT_J8 | FIT_J16) != 0 || fits == 0);
    if !better {
        return false;
    }
    let Some(instr) = itab.find_id(flipped) else {
        return false;
    };
    code.id = flipped;
    code.instr = instr;
    code.imm = Value::Int(-v);
    true
}

/// Fuse an arithmetic code with a directly following conditional jump on
/// the same register.
///
/// The pattern is `add/sub rd, rd, imm` followed by `jump_zero rd, L` or
/// `jump_notzero rd, L`. Returns the fused code, or `None` when the pair
/// does not match (different registers, masked, vector, or the jump is
/// itself a branch target).
#[must_use]
pub fn merge_jump(prev: &Code, jump: &Code, itab: &InstructionTable) -> Option<Code> {
    // The jump must be unlabelled: a fused instruction would swallow the
    // branch target otherwise.
    if jump.label.is_some() {
        return None;
    }
    let merged_id = match (prev.id, jump.id) {
        (II_ADD, II_JUMP_ZERO) => II_ADD_JUMP_ZERO,
        (II_ADD, II_JUMP_NOTZERO) => II_ADD_JUMP_NOTZERO,
        (II_SUB, II_JUMP_ZERO) => II_SUB_JUMP_ZERO,
        (II_SUB, II_JUMP_NOTZERO) => II_SUB_JUMP_NOTZERO,
        _ => return None,
    };
    // The arithmetic must rewrite one register in place with an immediate,
    // and the jump must test that same register.
    if prev.dest.is_none() || prev.dest != prev.reg1 || prev.dest != jump.reg1 {
        return None;
    }
    if prev.mem.is_some() || prev.mask.is_some() || prev.uses_vectors() {
        return None;
    }
    if prev.imm_sym.is_some() || !matches!(prev.imm, Value::Int(_)) {
        return None;
    }
    if jump.reg2.is_some() || jump.has_imm() {
        return None;
    }
    if prev.dtype != jump.dtype && jump.dtype.is_some() {
        return None;
    }
    let instr = itab.find_id(merged_id)?;
    let mut fused = prev.clone();
    fused.id = merged_id;
    fused.instr = instr;
    fused.category = Some(itab.get(instr).category);
    fused.target = jump.target;
    fused.format = None;
    fused.size = 0;
    fused.size_unknown = 0;
    Some(fused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fit_code;
    use crate::ir::{OperandType, Register};
    use crate::symtab::SymbolTable;

    fn make(name: &str, itab: &InstructionTable) -> Code {
        let idx = itab.find_name(name).unwrap();
        Code {
            id: itab.get(idx).id,
            instr: idx,
            category: Some(itab.get(idx).category),
            dtype: Some(OperandType::Int32),
            ..Code::default()
        }
    }

    #[test]
    fn add_negative_flips_to_sub() {
        let itab = InstructionTable::builtin();
        let mut code = make("add", &itab);
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(1));
        code.imm = Value::Int(-200);
        assert!(optimize_code(&mut code, &itab));
        assert_eq!(code.id, II_SUB);
        assert_eq!(code.imm, Value::Int(200));
        // The flipped form now fits a one-word format.
        let syms = SymbolTable::new();
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.size, 1);
    }

    #[test]
    fn small_immediate_left_alone() {
        let itab = InstructionTable::builtin();
        let mut code = make("add", &itab);
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(1));
        code.imm = Value::Int(-5);
        assert!(!optimize_code(&mut code, &itab));
        assert_eq!(code.id, II_ADD);
    }

    #[test]
    fn sub_negative_flips_to_add() {
        let itab = InstructionTable::builtin();
        let mut code = make("sub", &itab);
        code.dest = Some(Register::Gp(3));
        code.reg1 = Some(Register::Gp(3));
        code.imm = Value::Int(-40000);
        assert!(optimize_code(&mut code, &itab));
        assert_eq!(code.id, II_ADD);
        assert_eq!(code.imm, Value::Int(40000));
    }

    #[test]
    fn merge_sub_with_jump_notzero() {
        let itab = InstructionTable::builtin();
        let mut syms = SymbolTable::new();
        let target = syms.make_label("loop_top");

        let mut prev = make("sub", &itab);
        prev.dest = Some(Register::Gp(2));
        prev.reg1 = Some(Register::Gp(2));
        prev.imm = Value::Int(1);

        let mut jump = make("jump_notzero", &itab);
        jump.reg1 = Some(Register::Gp(2));
        jump.target = Some(target);

        let fused = merge_jump(&prev, &jump, &itab).expect("pair should fuse");
        assert_eq!(fused.id, II_SUB_JUMP_NOTZERO);
        assert_eq!(fused.target, Some(target));
        assert_eq!(fused.imm, Value::Int(1));
        // The fused code fits the combined arithmetic-and-jump format.
        let mut fused = fused;
        fit_code(&mut fused, &itab, &syms).unwrap();
        assert_eq!(fused.size, 2);
    }

    #[test]
    fn merge_refuses_different_registers() {
        let itab = InstructionTable::builtin();
        let mut syms = SymbolTable::new();
        let target = syms.make_label("l");
        let mut prev = make("add", &itab);
        prev.dest = Some(Register::Gp(2));
        prev.reg1 = Some(Register::Gp(2));
        prev.imm = Value::Int(1);
        let mut jump = make("jump_zero", &itab);
        jump.reg1 = Some(Register::Gp(3)); // other register
        jump.target = Some(target);
        assert!(merge_jump(&prev, &jump, &itab).is_none());
    }

    #[test]
    fn merge_refuses_labelled_jump() {
        let itab = InstructionTable::builtin();
        let mut syms = SymbolTable::new();
        let target = syms.make_label("l");
        let lbl = syms.make_label("entry");
        let mut prev = make("add", &itab);
        prev.dest = Some(Register::Gp(2));
        prev.reg1 = Some(Register::Gp(2));
        prev.imm = Value::Int(1);
        let mut jump = make("jump_zero", &itab);
        jump.reg1 = Some(Register::Gp(2));
        jump.target = Some(target);
        jump.label = Some(lbl);
        assert!(merge_jump(&prev, &jump, &itab).is_none());
    }

    #[test]
    fn merge_refuses_three_operand_arithmetic() {
        let itab = InstructionTable::builtin();
        let mut syms = SymbolTable::new();
        let target = syms.make_label("l");
        let mut prev = make("add", &itab);
        prev.dest = Some(Register::Gp(1));
        prev.reg1 = Some(Register::Gp(2)); // rd != rs: not in-place
        prev.imm = Value::Int(1);
        let mut jump = make("jump_zero", &itab);
        jump.reg1 = Some(Register::Gp(1));
        jump.target = Some(target);
        assert!(merge_jump(&prev, &jump, &itab).is_none());
    }
}
