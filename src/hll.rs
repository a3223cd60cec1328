//! High-level-language lowering: structured statements into labels and
//! branches.
//!
//! `if`/`else`, `while`, `do`-`while`, `for`, the vector `for (v in …)`
//! loop, and `switch` are desugared into conditional jumps against
//! synthesized labels. A block stack records, for each open `{`, its kind
//! and label slots; closing `}` pops the block and runs its finish
//! routine.
//!
//! Two statements buffer codes in a side store instead of emitting them
//! directly: a `for` loop holds its step codes until the loop closes, and
//! a `switch` holds its whole body so the dispatch (compare chain or jump
//! table, chosen by case density) can be emitted first.
//!
//! Label placement is expressed with zero-size anchor codes
//! ([`crate::ir::II_ANCHOR`]); the address-resolution pass gives them
//! their final addresses.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::encoder::Code;
use crate::error::{AsmError, Span};
use crate::expr::{self, Expr, Value};
use crate::ir::{
    OperandType, Register, II_ANCHOR, II_JUMP, II_JUMP_ABOVE, II_JUMP_ABOVEEQ, II_JUMP_BELOW,
    II_JUMP_BELOWEQ, II_JUMP_EQUAL, II_JUMP_INDIRECT, II_JUMP_INVERT, II_JUMP_NEGATIVE,
    II_JUMP_NEQUAL, II_JUMP_NOTNEGATIVE, II_JUMP_NOTPOSITIVE, II_JUMP_NOTZERO, II_JUMP_POSITIVE,
    II_JUMP_SABOVE, II_JUMP_SABOVEEQ, II_JUMP_SBELOW, II_JUMP_SBELOWEQ, II_JUMP_ZERO, II_MOVE,
    II_SUB_MAXLEN_JUMP_POS, II_TABLE,
};
use crate::itable::InstructionTable;
use crate::lexer::{
    HllKw, Token, TokenKind, OP_COLON, OP_EQUAL, OP_GE, OP_GT, OP_LBRACE, OP_LE, OP_LPAREN,
    OP_LT, OP_NEQUAL, OP_RPAREN, OP_SEMI,
};
use crate::parser;
use crate::symtab::SymbolTable;

/// Minimum number of contiguous, zero-based cases for a switch to use a
/// jump table instead of a compare chain.
const SWITCH_TABLE_MIN: usize = 4;

// ─── Blocks ─────────────────────────────────────────────────────────────

/// The kind of an open `{` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `if (…) {`
    If,
    /// `else {`
    Else,
    /// `while (…) {`
    While,
    /// `do {`
    DoWhile,
    /// `for (init; cond; step) {`
    For,
    /// `for (v in [base - counter]) {`
    ForIn,
    /// `switch (…) {`
    Switch,
}

/// One open block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block kind.
    pub kind: BlockKind,
    /// Sequential number used in synthesized label names.
    pub number: u32,
    /// Primary target: the false-branch label of an `if`, the top label
    /// of a loop, the end label of an `else`.
    pub jump_label: Option<u32>,
    /// Target of `break`; allocated lazily where the open statement does
    /// not need it itself.
    pub break_label: Option<u32>,
    /// Target of `continue`.
    pub continue_label: Option<u32>,
    /// Side code buffer: step codes of a `for`, the whole body of a
    /// `switch`.
    pub side: Vec<Code>,
    /// The block routes emitted codes into `side` (switch only).
    pub buffers_body: bool,
    /// Switch operand register.
    pub switch_reg: Option<Register>,
    /// Switch operand type.
    pub switch_dtype: Option<OperandType>,
    /// Collected `case` labels: value → label symbol.
    pub cases: Vec<(i64, u32)>,
    /// `default:` label.
    pub default_label: Option<u32>,
    /// For-in counter register.
    pub counter: Option<Register>,
    /// Operand type of a loop condition, re-used by the closing branch.
    pub dtype: Option<OperandType>,
}

impl Block {
    fn new(kind: BlockKind, number: u32) -> Self {
        Self {
            kind,
            number,
            jump_label: None,
            break_label: None,
            continue_label: None,
            side: Vec::new(),
            buffers_body: false,
            switch_reg: None,
            switch_dtype: None,
            cases: Vec::new(),
            default_label: None,
            counter: None,
            dtype: None,
        }
    }
}

/// The lowering engine: block stack plus label numbering.
#[derive(Debug, Default)]
pub struct Hll {
    blocks: Vec<Block>,
    next_number: u32,
}

// ─── Conditions ─────────────────────────────────────────────────────────

/// Interpret an evaluated condition into a conditional-jump code.
///
/// A comparison against constant zero maps to the register-test jumps;
/// anything else to a compare-and-jump. `invert` flips the condition (the
/// usual case: jump *around* the body when the condition is false).
fn condition_jump(
    e: &Expr,
    dtype: Option<OperandType>,
    invert: bool,
    target: u32,
    itab: &InstructionTable,
    span: Span,
) -> Result<Code, AsmError> {
    let Some(reg) = e.reg1 else {
        return Err(AsmError::TypeMismatch {
            detail: String::from("condition must test a register"),
            span,
        });
    };
    if e.instruction.is_some() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("condition cannot contain arithmetic"),
            span,
        });
    }
    let unsigned = dtype.is_some_and(OperandType::is_unsigned);
    let rhs_zero = e.reg2.is_none() && e.value.as_int() == Some(0) && e.sym1.is_none();

    let mut id = match e.cmp_op {
        None => {
            // `if (r1)` tests for non-zero.
            II_JUMP_NOTZERO
        }
        Some(op) => match (op, rhs_zero, unsigned) {
            (OP_EQUAL, true, _) => II_JUMP_ZERO,
            (OP_NEQUAL, true, _) => II_JUMP_NOTZERO,
            (OP_GT, true, false) => II_JUMP_POSITIVE,
            (OP_LE, true, false) => II_JUMP_NOTPOSITIVE,
            (OP_LT, true, false) => II_JUMP_NEGATIVE,
            (OP_GE, true, false) => II_JUMP_NOTNEGATIVE,
            (OP_EQUAL, false, _) => II_JUMP_EQUAL,
            (OP_NEQUAL, false, _) => II_JUMP_NEQUAL,
            (OP_LT, _, false) => II_JUMP_SBELOW,
            (OP_GE, _, false) => II_JUMP_SABOVEEQ,
            (OP_GT, _, false) => II_JUMP_SABOVE,
            (OP_LE, _, false) => II_JUMP_SBELOWEQ,
            (OP_LT, _, true) => II_JUMP_BELOW,
            (OP_GE, _, true) => II_JUMP_ABOVEEQ,
            (OP_GT, _, true) => II_JUMP_ABOVE,
            (OP_LE, _, true) => II_JUMP_BELOWEQ,
            _ => {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("unsupported condition operator"),
                    span,
                })
            }
        },
    };
    if invert {
        id ^= II_JUMP_INVERT;
    }
    let Some(instr) = itab.find_id(id) else {
        return Err(AsmError::TypeMismatch {
            detail: String::from("condition has no branch instruction"),
            span,
        });
    };
    // Register-test jumps (op1 4–9) take no second operand.
    let test_zero = (4..=9).contains(&crate::ir::jump_op1(id));
    let mut code = Code {
        id,
        instr,
        category: Some(itab.get(instr).category),
        dtype: Some(dtype.unwrap_or(OperandType::Int64)),
        reg1: Some(reg),
        target: Some(target),
        span,
        ..Code::default()
    };
    if !test_zero {
        code.reg2 = e.reg2;
        if e.reg2.is_none() {
            code.imm = e.value.clone();
            code.imm_sym = e.sym1;
        }
    }
    Ok(code)
}

/// A zero-size anchor code placing `label` at the current position.
fn anchor(label: u32, span: Span) -> Code {
    Code {
        id: II_ANCHOR,
        label: Some(label),
        span,
        ..Code::default()
    }
}

/// An unconditional jump to `label`.
fn plain_jump(label: u32, itab: &InstructionTable, span: Span) -> Result<Code, AsmError> {
    let Some(instr) = itab.find_id(II_JUMP) else {
        return Err(AsmError::Syntax {
            msg: String::from("jump instruction missing from table"),
            span,
        });
    };
    Ok(Code {
        id: II_JUMP,
        instr,
        category: Some(itab.get(instr).category),
        target: Some(label),
        span,
        ..Code::default()
    })
}

/// Find the matching `)` for the `(` at `open`, returning the index past
/// the condition (the `)` itself).
fn find_close_paren(toks: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in toks.iter().enumerate().skip(open) {
        if let TokenKind::Operator(op) = &t.kind {
            if *op == OP_LPAREN {
                depth += 1;
            } else if *op == OP_RPAREN {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Parse `( [type] condition )`, returning the declared type, the
/// evaluated condition, and the index past the `)`.
fn parse_condition(
    toks: &[Token],
    at: usize,
    src: &str,
    syms: &SymbolTable,
    itab: &InstructionTable,
) -> Result<(Option<OperandType>, Expr, usize), AsmError> {
    let span = toks.get(at).map_or_else(Span::dummy, |t| t.span);
    if !matches!(toks.get(at).map(|t| &t.kind), Some(TokenKind::Operator(op)) if *op == OP_LPAREN)
    {
        return Err(AsmError::Syntax {
            msg: String::from("expected '(' after keyword"),
            span,
        });
    }
    let close = find_close_paren(toks, at).ok_or(AsmError::UnmatchedBracket {
        bracket: '(',
        span,
    })?;
    let mut inner = at + 1;
    let mut dtype = None;
    if let Some(TokenKind::Type { ty, .. }) = toks.get(inner).map(|t| &t.kind) {
        dtype = Some(*ty);
        inner += 1;
    }
    let e = expr::eval(&toks[inner..close], src, syms, itab)?;
    if inner + e.tokens as usize != close {
        return Err(AsmError::Syntax {
            msg: String::from("trailing tokens in condition"),
            span,
        });
    }
    Ok((dtype, e, close + 1))
}

impl Hll {
    /// Create an empty block stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any block is still open (checked at section end).
    #[must_use]
    pub fn open_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The side buffer emitted codes should currently be routed into, if
    /// an enclosing `switch` is buffering its body.
    pub fn buffer_mut(&mut self) -> Option<&mut Vec<Code>> {
        self.blocks
            .iter_mut()
            .rev()
            .find(|b| b.buffers_body)
            .map(|b| &mut b.side)
    }

    fn bump(&mut self) -> u32 {
        self.next_number += 1;
        self.next_number
    }

    /// Whether a statement is a structured-control statement this module
    /// handles (including `}` lines).
    #[must_use]
    pub fn handles(toks: &[Token]) -> bool {
        if parser::starts_with_close(toks) {
            return true;
        }
        matches!(
            toks.first().map(|t| &t.kind),
            Some(TokenKind::Hll(
                HllKw::If
                    | HllKw::Else
                    | HllKw::While
                    | HllKw::Do
                    | HllKw::For
                    | HllKw::Switch
                    | HllKw::Break
                    | HllKw::Continue
                    | HllKw::Case
                    | HllKw::Default
            ))
        )
    }

    /// Interpret one structured statement, returning the codes it expands
    /// to (in order).
    ///
    /// # Errors
    ///
    /// Reports malformed headers, misplaced keywords, and condition
    /// errors.
    pub fn statement(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        if parser::starts_with_close(toks) {
            return self.close_bracket(toks, src, syms, itab);
        }
        let span = toks.first().map_or_else(Span::dummy, |t| t.span);
        match toks.first().map(|t| &t.kind) {
            Some(TokenKind::Hll(HllKw::If)) => self.open_if(toks, src, syms, itab),
            Some(TokenKind::Hll(HllKw::While)) => self.open_while(toks, src, syms, itab),
            Some(TokenKind::Hll(HllKw::Do)) => self.open_do(toks, syms, span),
            Some(TokenKind::Hll(HllKw::For)) => self.open_for(toks, src, syms, itab),
            Some(TokenKind::Hll(HllKw::Switch)) => self.open_switch(toks, src, syms, itab),
            Some(TokenKind::Hll(HllKw::Break)) => self.break_continue(true, syms, itab, span),
            Some(TokenKind::Hll(HllKw::Continue)) => self.break_continue(false, syms, itab, span),
            Some(TokenKind::Hll(HllKw::Case)) => self.case_label(toks, src, syms, itab),
            Some(TokenKind::Hll(HllKw::Default)) => self.default_label(syms, span),
            Some(TokenKind::Hll(HllKw::Else)) => Err(AsmError::Syntax {
                msg: String::from("'else' without a closing '}'"),
                span,
            }),
            _ => Err(AsmError::Syntax {
                msg: String::from("unrecognized structured statement"),
                span,
            }),
        }
    }

    fn expect_open_brace(toks: &[Token], at: usize) -> Result<(), AsmError> {
        match toks.get(at).map(|t| &t.kind) {
            Some(TokenKind::Operator(op)) if *op == OP_LBRACE && at + 1 == toks.len() => Ok(()),
            _ => Err(AsmError::Syntax {
                msg: String::from("expected '{' ending the statement"),
                span: toks.get(at).map_or_else(Span::dummy, |t| t.span),
            }),
        }
    }

    fn open_if(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        let (dtype, cond, after) = parse_condition(toks, 1, src, syms, itab)?;
        Self::expect_open_brace(toks, after)?;
        let n = self.bump();
        let l_else = syms.make_label("if");
        let jump = condition_jump(&cond, dtype, true, l_else, itab, span)?;
        let mut block = Block::new(BlockKind::If, n);
        block.jump_label = Some(l_else);
        self.blocks.push(block);
        Ok(vec![jump])
    }

    fn open_while(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        let (dtype, cond, after) = parse_condition(toks, 1, src, syms, itab)?;
        Self::expect_open_brace(toks, after)?;
        let n = self.bump();
        let l_top = syms.make_label("while");
        let l_end = syms.make_label("while_end");
        let jump = condition_jump(&cond, dtype, true, l_end, itab, span)?;
        let mut block = Block::new(BlockKind::While, n);
        block.jump_label = Some(l_top);
        block.break_label = Some(l_end);
        block.continue_label = Some(l_top);
        self.blocks.push(block);
        Ok(vec![anchor(l_top, span), jump])
    }

    fn open_do(
        &mut self,
        toks: &[Token],
        syms: &mut SymbolTable,
        span: Span,
    ) -> Result<Vec<Code>, AsmError> {
        Self::expect_open_brace(toks, 1)?;
        let n = self.bump();
        // The top label is placed immediately; break and continue stay
        // unallocated until first used.
        let l_top = syms.make_label("do");
        let mut block = Block::new(BlockKind::DoWhile, n);
        block.jump_label = Some(l_top);
        self.blocks.push(block);
        Ok(vec![anchor(l_top, span)])
    }

    fn open_for(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        if !matches!(toks.get(1).map(|t| &t.kind), Some(TokenKind::Operator(op)) if *op == OP_LPAREN)
        {
            return Err(AsmError::Syntax {
                msg: String::from("expected '(' after 'for'"),
                span,
            });
        }
        let close = find_close_paren(toks, 1).ok_or(AsmError::UnmatchedBracket {
            bracket: '(',
            span,
        })?;
        Self::expect_open_brace(toks, close + 1)?;
        let header = &toks[2..close];

        // Vector loop: `for ([type] vN in [base - counter]) {`.
        let in_pos = header
            .iter()
            .position(|t| matches!(t.kind, TokenKind::Hll(HllKw::In)));
        if let Some(in_pos) = in_pos {
            return self.open_for_in(header, in_pos, span, src, syms, itab);
        }

        // `for (init; cond; step) {`.
        let mut parts: Vec<&[Token]> = Vec::new();
        let mut start = 0;
        for (i, t) in header.iter().enumerate() {
            if matches!(&t.kind, TokenKind::Operator(op) if *op == OP_SEMI) {
                parts.push(&header[start..i]);
                start = i + 1;
            }
        }
        parts.push(&header[start..]);
        if parts.len() != 3 {
            return Err(AsmError::Syntax {
                msg: String::from("for header needs 'init; condition; step'"),
                span,
            });
        }
        let (init_toks, cond_toks, step_toks) = (parts[0], parts[1], parts[2]);

        let n = self.bump();
        let l_top = syms.make_label("for");
        let l_end = syms.make_label("for_end");
        let mut out = Vec::new();
        if !init_toks.is_empty() {
            out.push(parser::parse_code_line(init_toks, src, syms, itab)?);
        }
        out.push(anchor(l_top, span));
        let mut dtype = None;
        if !cond_toks.is_empty() {
            let mut inner = 0;
            if let Some(TokenKind::Type { ty, .. }) = cond_toks.first().map(|t| &t.kind) {
                dtype = Some(*ty);
                inner = 1;
            }
            let cond = expr::eval(&cond_toks[inner..], src, syms, itab)?;
            out.push(condition_jump(&cond, dtype, true, l_end, itab, span)?);
        }
        let mut block = Block::new(BlockKind::For, n);
        block.jump_label = Some(l_top);
        block.break_label = Some(l_end);
        block.dtype = dtype;
        if step_toks.is_empty() {
            block.continue_label = Some(l_top);
        } else {
            let l_cont = syms.make_label("for_step");
            block.continue_label = Some(l_cont);
            block.side.push(parser::parse_code_line(step_toks, src, syms, itab)?);
        }
        self.blocks.push(block);
        Ok(out)
    }

    /// `for ([type] vN in [base - counter]) {` — the vector-length loop.
    ///
    /// Lowered to a bounded load at the loop top and a
    /// subtract-max-length / jump-if-positive pair at the bottom; the
    /// counter register tracks the remaining byte length and indexes the
    /// array backward from its end.
    fn open_for_in(
        &mut self,
        header: &[Token],
        in_pos: usize,
        span: Span,
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let mut i = 0;
        let mut dtype = None;
        if let Some(TokenKind::Type { ty, .. }) = header.first().map(|t| &t.kind) {
            dtype = Some(*ty);
            i = 1;
        }
        let Some(TokenKind::Register(var)) = header.get(i).map(|t| &t.kind) else {
            return Err(AsmError::Syntax {
                msg: String::from("for-in needs a vector register before 'in'"),
                span,
            });
        };
        let var = *var;
        if !var.is_vector() || i + 1 != in_pos {
            return Err(AsmError::RegisterClass {
                detail: String::from("for-in loops over a vector register"),
                span,
            });
        }
        let e = expr::eval(&header[in_pos + 1..], src, syms, itab)?;
        let Some(mem) = e.mem.clone() else {
            return Err(AsmError::Syntax {
                msg: String::from("for-in needs a memory operand like [base - counter]"),
                span,
            });
        };
        let (Some(counter), true) = (mem.index, mem.scale == -1) else {
            return Err(AsmError::Syntax {
                msg: String::from("for-in memory operand must subtract the counter register"),
                span,
            });
        };
        let n = self.bump();
        let l_top = syms.make_label("vloop");
        let dtype = dtype.unwrap_or(OperandType::Int32);

        // Bounded load at the top of each iteration.
        let Some(move_instr) = itab.find_id(II_MOVE) else {
            return Err(AsmError::Syntax {
                msg: String::from("move instruction missing from table"),
                span,
            });
        };
        let mut load_mem = mem;
        load_mem.length = Some(counter);
        let load = Code {
            id: II_MOVE,
            instr: move_instr,
            category: Some(itab.get(move_instr).category),
            dtype: Some(dtype),
            dest: Some(var),
            mem: Some(load_mem),
            span,
            ..Code::default()
        };
        let mut block = Block::new(BlockKind::ForIn, n);
        block.jump_label = Some(l_top);
        block.counter = Some(counter);
        block.dtype = Some(dtype);
        self.blocks.push(block);
        Ok(vec![anchor(l_top, span), load])
    }

    fn open_switch(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        let (dtype, e, after) = parse_condition(toks, 1, src, syms, itab)?;
        Self::expect_open_brace(toks, after)?;
        let Some(reg) = e.reg1.filter(|_| e.instruction.is_none() && e.cmp_op.is_none()) else {
            return Err(AsmError::TypeMismatch {
                detail: String::from("switch operand must be a register"),
                span,
            });
        };
        let n = self.bump();
        let mut block = Block::new(BlockKind::Switch, n);
        block.switch_reg = Some(reg);
        block.switch_dtype = Some(dtype.unwrap_or(OperandType::Int64));
        block.buffers_body = true;
        self.blocks.push(block);
        Ok(Vec::new())
    }

    fn case_label(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        // `case K :`
        let colon = toks
            .iter()
            .position(|t| matches!(&t.kind, TokenKind::Operator(op) if *op == OP_COLON))
            .ok_or_else(|| AsmError::Syntax {
                msg: String::from("expected ':' after case value"),
                span,
            })?;
        let value = expr::eval(&toks[1..colon], src, syms, itab)?;
        let Some(k) = value.value.as_int().filter(|_| value.is_constant()) else {
            return Err(AsmError::TypeMismatch {
                detail: String::from("case value must be an assemble-time constant"),
                span,
            });
        };
        if colon + 1 != toks.len() {
            return Err(AsmError::Syntax {
                msg: String::from("a case label must end its statement"),
                span,
            });
        }
        let label = syms.make_label("case");
        let Some(block) = self
            .blocks
            .iter_mut()
            .rev()
            .find(|b| b.kind == BlockKind::Switch)
        else {
            return Err(AsmError::Syntax {
                msg: String::from("'case' outside a switch"),
                span,
            });
        };
        if block.cases.iter().any(|&(v, _)| v == k) {
            return Err(AsmError::DuplicateDefinition {
                name: format!("case {}", k),
                span,
            });
        }
        block.cases.push((k, label));
        Ok(vec![anchor(label, span)])
    }

    fn default_label(&mut self, syms: &mut SymbolTable, span: Span) -> Result<Vec<Code>, AsmError> {
        let label = syms.make_label("default");
        let Some(block) = self
            .blocks
            .iter_mut()
            .rev()
            .find(|b| b.kind == BlockKind::Switch)
        else {
            return Err(AsmError::Syntax {
                msg: String::from("'default' outside a switch"),
                span,
            });
        };
        if block.default_label.is_some() {
            return Err(AsmError::DuplicateDefinition {
                name: String::from("default"),
                span,
            });
        }
        block.default_label = Some(label);
        Ok(vec![anchor(label, span)])
    }

    fn break_continue(
        &mut self,
        is_break: bool,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
        span: Span,
    ) -> Result<Vec<Code>, AsmError> {
        // Find the nearest block that can take the statement, allocating
        // its label on first use.
        let target = self.blocks.iter_mut().rev().find(|b| {
            if is_break {
                !matches!(b.kind, BlockKind::If | BlockKind::Else)
            } else {
                matches!(
                    b.kind,
                    BlockKind::While | BlockKind::DoWhile | BlockKind::For | BlockKind::ForIn
                )
            }
        });
        let Some(block) = target else {
            return Err(AsmError::Syntax {
                msg: String::from(if is_break {
                    "'break' outside a loop or switch"
                } else {
                    "'continue' outside a loop"
                }),
                span,
            });
        };
        let stem = if is_break { "break" } else { "continue" };
        let slot = if is_break {
            &mut block.break_label
        } else {
            &mut block.continue_label
        };
        let label = match *slot {
            Some(l) => l,
            None => {
                let l = syms.make_label(stem);
                *slot = Some(l);
                l
            }
        };
        Ok(vec![plain_jump(label, itab, span)?])
    }

    /// Interpret a statement starting with `}`: plain close, `} else {`,
    /// or `} while (cond)`.
    fn close_bracket(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let span = toks[0].span;
        let Some(block) = self.blocks.pop() else {
            return Err(AsmError::UnmatchedBracket { bracket: '}', span });
        };
        let tail = &toks[1..];
        match block.kind {
            BlockKind::If => self.close_if(block, tail, span, syms, itab),
            BlockKind::Else => {
                Self::expect_plain_close(tail, span)?;
                let l_end = block.jump_label.unwrap_or_default();
                Ok(vec![anchor(l_end, span)])
            }
            BlockKind::While => {
                Self::expect_plain_close(tail, span)?;
                let mut out = Vec::new();
                if let Some(top) = block.jump_label {
                    out.push(plain_jump(top, itab, span)?);
                }
                if let Some(end) = block.break_label {
                    out.push(anchor(end, span));
                }
                Ok(out)
            }
            BlockKind::DoWhile => self.close_do(block, tail, span, src, syms, itab),
            BlockKind::For => {
                Self::expect_plain_close(tail, span)?;
                let mut out = Vec::new();
                if let Some(cont) = block.continue_label {
                    if block.continue_label != block.jump_label {
                        out.push(anchor(cont, span));
                    }
                }
                out.extend(block.side);
                if let Some(top) = block.jump_label {
                    out.push(plain_jump(top, itab, span)?);
                }
                if let Some(end) = block.break_label {
                    out.push(anchor(end, span));
                }
                Ok(out)
            }
            BlockKind::ForIn => {
                Self::expect_plain_close(tail, span)?;
                let mut out = Vec::new();
                if let Some(cont) = block.continue_label {
                    out.push(anchor(cont, span));
                }
                let counter = block.counter.unwrap_or(Register::Gp(0));
                let Some(instr) = itab.find_id(II_SUB_MAXLEN_JUMP_POS) else {
                    return Err(AsmError::Syntax {
                        msg: String::from("vector loop instruction missing from table"),
                        span,
                    });
                };
                out.push(Code {
                    id: II_SUB_MAXLEN_JUMP_POS,
                    instr,
                    category: Some(itab.get(instr).category),
                    dtype: block.dtype,
                    reg1: Some(counter),
                    target: block.jump_label,
                    span,
                    ..Code::default()
                });
                if let Some(end) = block.break_label {
                    out.push(anchor(end, span));
                }
                Ok(out)
            }
            BlockKind::Switch => {
                Self::expect_plain_close(tail, span)?;
                self.close_switch(block, span, syms, itab)
            }
        }
    }

    fn expect_plain_close(tail: &[Token], span: Span) -> Result<(), AsmError> {
        if tail.is_empty() {
            Ok(())
        } else {
            Err(AsmError::Syntax {
                msg: String::from("unexpected tokens after '}'"),
                span,
            })
        }
    }

    fn close_if(
        &mut self,
        block: Block,
        tail: &[Token],
        span: Span,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let l_else = block.jump_label.unwrap_or_default();
        match tail.first().map(|t| &t.kind) {
            None => Ok(vec![anchor(l_else, span)]),
            Some(TokenKind::Hll(HllKw::Else)) => {
                if tail.len() != 2
                    || !matches!(
                        tail.get(1).map(|t| &t.kind),
                        Some(TokenKind::Operator(op)) if *op == OP_LBRACE
                    )
                {
                    return Err(AsmError::Syntax {
                        msg: String::from("expected '{' after 'else'"),
                        span,
                    });
                }
                let l_end = syms.make_label("else_end");
                let mut else_block = Block::new(BlockKind::Else, block.number);
                else_block.jump_label = Some(l_end);
                self.blocks.push(else_block);
                // Skip the else body after the then body, then place the
                // false target.
                Ok(vec![plain_jump(l_end, itab, span)?, anchor(l_else, span)])
            }
            Some(_) => Err(AsmError::Syntax {
                msg: String::from("unexpected tokens after '}'"),
                span,
            }),
        }
    }

    fn close_do(
        &mut self,
        block: Block,
        tail: &[Token],
        span: Span,
        src: &str,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        // `} while (cond)`
        if !matches!(tail.first().map(|t| &t.kind), Some(TokenKind::Hll(HllKw::While))) {
            return Err(AsmError::Syntax {
                msg: String::from("expected 'while' closing a do block"),
                span,
            });
        }
        let (dtype, cond, after) = parse_condition(tail, 1, src, syms, itab)?;
        if after != tail.len() {
            return Err(AsmError::Syntax {
                msg: String::from("unexpected tokens after do-while condition"),
                span,
            });
        }
        let mut out = Vec::new();
        if let Some(cont) = block.continue_label {
            out.push(anchor(cont, span));
        }
        let l_top = block.jump_label.unwrap_or_default();
        out.push(condition_jump(&cond, dtype, false, l_top, itab, span)?);
        if let Some(end) = block.break_label {
            out.push(anchor(end, span));
        }
        Ok(out)
    }

    fn close_switch(
        &mut self,
        block: Block,
        span: Span,
        syms: &mut SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Vec<Code>, AsmError> {
        let reg = block.switch_reg.unwrap_or(Register::Gp(0));
        let dtype = block.switch_dtype;
        let l_end = match block.break_label {
            Some(l) => l,
            None => syms.make_label("switch_end"),
        };
        let l_fallback = block.default_label.unwrap_or(l_end);
        let mut out = Vec::new();

        // Density heuristic: contiguous keys from zero use a jump table.
        let mut sorted = block.cases.clone();
        sorted.sort_by_key(|&(k, _)| k);
        let contiguous = sorted.len() >= SWITCH_TABLE_MIN
            && sorted.first().map(|&(k, _)| k) == Some(0)
            && sorted.windows(2).all(|w| w[1].0 == w[0].0 + 1);

        if contiguous {
            // Bounds check, indirect jump, table of word-scaled label
            // differences.
            let count = sorted.len() as i64;
            let Some(cmp_instr) = itab.find_id(II_JUMP_ABOVEEQ) else {
                return Err(AsmError::Syntax {
                    msg: String::from("bound-check instruction missing from table"),
                    span,
                });
            };
            out.push(Code {
                id: II_JUMP_ABOVEEQ,
                instr: cmp_instr,
                category: Some(itab.get(cmp_instr).category),
                dtype,
                reg1: Some(reg),
                imm: Value::Int(count),
                target: Some(l_fallback),
                span,
                ..Code::default()
            });
            let l_table = syms.make_label("jumptab");
            let Some(ind_instr) = itab.find_id(II_JUMP_INDIRECT) else {
                return Err(AsmError::Syntax {
                    msg: String::from("indirect jump missing from table"),
                    span,
                });
            };
            out.push(Code {
                id: II_JUMP_INDIRECT,
                instr: ind_instr,
                category: Some(itab.get(ind_instr).category),
                dtype,
                reg1: Some(reg),
                target: Some(l_table),
                span,
                ..Code::default()
            });
            let table: Vec<u32> = sorted.iter().map(|&(_, l)| l).collect();
            let words = table.len() as u8;
            out.push(Code {
                id: II_TABLE,
                label: Some(l_table),
                table,
                size: words,
                span,
                ..Code::default()
            });
        } else {
            // Compare-and-branch chain.
            let Some(eq_instr) = itab.find_id(II_JUMP_EQUAL) else {
                return Err(AsmError::Syntax {
                    msg: String::from("compare-jump missing from table"),
                    span,
                });
            };
            for &(k, label) in &block.cases {
                out.push(Code {
                    id: II_JUMP_EQUAL,
                    instr: eq_instr,
                    category: Some(itab.get(eq_instr).category),
                    dtype,
                    reg1: Some(reg),
                    imm: Value::Int(k),
                    target: Some(label),
                    span,
                    ..Code::default()
                });
            }
            out.push(plain_jump(l_fallback, itab, span)?);
        }

        // The buffered body, then the end label.
        out.extend(block.side);
        out.push(anchor(l_end, span));
        Ok(out)
    }
}
