//! Assemble-time expression evaluator.
//!
//! Evaluates a token span with C-like operator precedence over mixed
//! operand kinds: integers, floats, strings, registers, memory operands,
//! and symbols. Pure scalar sub-expressions fold to constants; register
//! and memory sub-expressions assemble into the operand fields of an
//! instruction; symbol references that cannot be resolved yet are carried
//! through so a later pass can materialize a relocation.
//!
//! The evaluator is deterministic and side-effect free: the result is a
//! function of the token span, the symbol table, and the instruction
//! table alone.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;

use crate::error::{AsmError, Span};
use crate::ir::{
    self, Register, II_ADD, II_AND, II_DIV, II_DIV_U, II_MUL, II_OR, II_REM, II_REM_U,
    II_SHIFT_LEFT, II_SHIFT_RIGHT_S, II_SHIFT_RIGHT_U, II_SUB, II_XOR,
};
use crate::itable::InstructionTable;
use crate::lexer::{
    OpId, Token, TokenKind, OP_AND, OP_ANDAND, OP_COLON, OP_COMMA, OP_DIV, OP_EQUAL,
    OP_GE, OP_GT, OP_LBRACKET, OP_LE, OP_LOGNOT, OP_LPAREN, OP_LT, OP_MINUS, OP_MUL, OP_NEQUAL,
    OP_NOT, OP_OR, OP_OROR, OP_PERCENT, OP_PLUS, OP_QUESTION, OP_RBRACKET, OP_RPAREN, OP_SHL,
    OP_SHR, OP_SHRU, OP_XOR,
};
use crate::symtab::{SymbolTable, SYM_CONSTANT, SYM_DEFINED};

/// Highest operator priority the evaluator accepts by default: everything
/// below assignment (14) and the comma (15), so an operand expression
/// stops cleanly at `,`.
pub const MAX_OPERAND_PRIORITY: u32 = 13;

// ─── Values and operands ────────────────────────────────────────────────

/// A folded scalar value.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// No scalar value.
    #[default]
    None,
    /// Integer (also the addend of a symbol expression).
    Int(i64),
    /// Floating point.
    Float(f64),
    /// String.
    Str(String),
}

impl Value {
    /// The integer value, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether no scalar value is populated.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

/// A memory operand under assembly: `[base + index*scale + offset]`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemOperand {
    /// Base register.
    pub base: Option<Register>,
    /// Index register.
    pub index: Option<Register>,
    /// Scale factor on the index register.
    pub scale: i8,
    /// Constant offset.
    pub offset: i64,
    /// Symbol whose address joins the offset.
    pub sym: Option<u32>,
    /// Vector length register (`length=` option).
    pub length: Option<Register>,
    /// The length register is a broadcast length.
    pub broadcast: bool,
    /// Index limit (`limit=` option).
    pub limit: Option<u64>,
    /// Scalar access without broadcast (`scalar` option).
    pub scalar: bool,
}

/// The result of evaluating an expression span.
///
/// Exactly the fields the span populated are set; combining two partial
/// results is a field-wise merge that rejects a field populated on both
/// sides.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Expr {
    /// Folded scalar value, or the addend of a symbol expression.
    pub value: Value,
    /// First register operand.
    pub reg1: Option<Register>,
    /// Second register operand.
    pub reg2: Option<Register>,
    /// Instruction id implied by an operator on registers.
    pub instruction: Option<u32>,
    /// Relational operator of a condition (`r1 > r2`).
    pub cmp_op: Option<OpId>,
    /// Memory operand.
    pub mem: Option<MemOperand>,
    /// First symbol.
    pub sym1: Option<u32>,
    /// Reference symbol of a `sym1 − sym2` difference.
    pub sym2: Option<u32>,
    /// Scale divisor on `sym1 − sym2`; one of 1, 2, 4, 8 (−1 is expressed
    /// by swapping the symbols).
    pub symscale: u8,
    /// A referenced symbol has no known value yet.
    pub unresolved: bool,
    /// Number of tokens consumed.
    pub tokens: u32,
    /// Source span of the expression.
    pub span: Span,
}

impl Expr {
    fn at(span: Span) -> Self {
        Expr {
            symscale: 1,
            span,
            ..Expr::default()
        }
    }

    /// Whether the expression is a pure constant (no registers, memory, or
    /// symbols).
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.reg1.is_none()
            && self.mem.is_none()
            && self.sym1.is_none()
            && self.instruction.is_none()
            && self.cmp_op.is_none()
            && !self.unresolved
    }

    /// Field-wise merge of two partial results.
    ///
    /// # Errors
    ///
    /// Reports a type mismatch when any field is populated on both sides.
    pub fn merge(mut self, other: Expr, span: Span) -> Result<Expr, AsmError> {
        fn put<T>(dst: &mut Option<T>, src: Option<T>, what: &str, span: Span) -> Result<(), AsmError> {
            if let Some(v) = src {
                if dst.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: format!("{} specified twice", what),
                        span,
                    });
                }
                *dst = Some(v);
            }
            Ok(())
        }
        if !other.value.is_none() {
            if !self.value.is_none() {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("value specified twice"),
                    span,
                });
            }
            self.value = other.value;
        }
        put(&mut self.reg1, other.reg1, "register operand", span)?;
        put(&mut self.reg2, other.reg2, "second register operand", span)?;
        put(&mut self.instruction, other.instruction, "operation", span)?;
        put(&mut self.cmp_op, other.cmp_op, "comparison", span)?;
        put(&mut self.mem, other.mem, "memory operand", span)?;
        put(&mut self.sym1, other.sym1, "symbol", span)?;
        put(&mut self.sym2, other.sym2, "reference symbol", span)?;
        self.unresolved |= other.unresolved;
        Ok(self)
    }
}

/// Map a binary operator to the instruction that implements it on
/// registers. `unsigned` selects the unsigned variants.
#[must_use]
pub fn op_to_instruction(op: OpId, unsigned: bool) -> Option<u32> {
    Some(match op {
        OP_PLUS => II_ADD,
        OP_MINUS => II_SUB,
        OP_MUL => II_MUL,
        OP_DIV => {
            if unsigned {
                II_DIV_U
            } else {
                II_DIV
            }
        }
        OP_PERCENT => {
            if unsigned {
                II_REM_U
            } else {
                II_REM
            }
        }
        OP_AND => II_AND,
        OP_OR => II_OR,
        OP_XOR => II_XOR,
        OP_SHL => II_SHIFT_LEFT,
        OP_SHR => {
            if unsigned {
                II_SHIFT_RIGHT_U
            } else {
                II_SHIFT_RIGHT_S
            }
        }
        OP_SHRU => II_SHIFT_RIGHT_U,
        _ => return None,
    })
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Evaluate the token span `[0, tokens.len())` as one operand expression.
///
/// Stops before any operator of priority above
/// [`MAX_OPERAND_PRIORITY`] (assignment, comma); the number of tokens
/// consumed is recorded in the result.
///
/// # Errors
///
/// Returns an [`AsmError`] for malformed expressions, illegal operand
/// combinations, and division by zero.
pub fn eval(
    tokens: &[Token],
    source: &str,
    syms: &SymbolTable,
    itab: &InstructionTable,
) -> Result<Expr, AsmError> {
    let mut ev = Evaluator {
        toks: tokens,
        src: source,
        syms,
        itab,
        pos: 0,
    };
    let mut e = ev.binary(MAX_OPERAND_PRIORITY, false)?;
    e.tokens = ev.pos as u32;
    Ok(e)
}

struct Evaluator<'a> {
    toks: &'a [Token],
    src: &'a str,
    syms: &'a SymbolTable,
    itab: &'a InstructionTable,
    pos: usize,
}

impl<'a> Evaluator<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.toks.get(self.pos)
    }

    fn peek_op(&self) -> Option<OpId> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Operator(id),
                ..
            }) => Some(*id),
            _ => None,
        }
    }

    fn span_here(&self) -> Span {
        self.peek().map_or_else(Span::dummy, |t| t.span)
    }

    fn syntax(&self, msg: &str) -> AsmError {
        AsmError::Syntax {
            msg: String::from(msg),
            span: self.span_here(),
        }
    }

    /// Precedence climbing: parse operands joined by operators of priority
    /// at most `max_priority`.
    fn binary(&mut self, max_priority: u32, in_mem: bool) -> Result<Expr, AsmError> {
        let mut lhs = self.unary(in_mem)?;
        loop {
            let Some(op) = self.peek_op() else { break };
            let prio = op.priority();
            if prio == 0 || prio > max_priority {
                break;
            }
            let op_span = self.span_here();
            if op == OP_QUESTION {
                self.pos += 1;
                lhs = self.ternary(lhs, op_span)?;
                continue;
            }
            self.pos += 1;
            // Left associative: the right side binds strictly tighter.
            let rhs = self.binary(prio - 1, in_mem)?;
            lhs = if in_mem {
                op2_mem_part(op, lhs, rhs, op_span)?
            } else {
                op2(op, lhs, rhs, op_span)?
            };
        }
        Ok(lhs)
    }

    /// `cond ? a : b` — both arms are evaluated eagerly; the condition
    /// must be an assemble-time constant.
    fn ternary(&mut self, cond: Expr, span: Span) -> Result<Expr, AsmError> {
        let Some(c) = cond.value.as_int().filter(|_| cond.is_constant()) else {
            return Err(AsmError::TypeMismatch {
                detail: String::from("?: condition must be an assemble-time constant"),
                span,
            });
        };
        let a = self.binary(OP_QUESTION.priority(), false)?;
        if self.peek_op() != Some(OP_COLON) {
            return Err(self.syntax("expected ':' in conditional expression"));
        }
        self.pos += 1;
        let b = self.binary(OP_QUESTION.priority(), false)?;
        Ok(if c != 0 { a } else { b })
    }

    fn unary(&mut self, in_mem: bool) -> Result<Expr, AsmError> {
        let Some(tok) = self.peek() else {
            return Err(self.syntax("expected an operand"));
        };
        let span = tok.span;
        if let TokenKind::Operator(op) = tok.kind {
            match op {
                OP_MINUS => {
                    self.pos += 1;
                    let e = self.unary(in_mem)?;
                    return negate(e, span);
                }
                OP_PLUS => {
                    self.pos += 1;
                    return self.unary(in_mem);
                }
                OP_NOT => {
                    self.pos += 1;
                    let e = self.unary(in_mem)?;
                    return match e.value {
                        Value::Int(v) if e.is_constant() => {
                            let mut r = Expr::at(span);
                            r.value = Value::Int(!v);
                            Ok(r)
                        }
                        _ => Err(AsmError::TypeMismatch {
                            detail: String::from("'~' requires an integer constant"),
                            span,
                        }),
                    };
                }
                OP_LOGNOT => {
                    self.pos += 1;
                    let e = self.unary(in_mem)?;
                    return match e.value {
                        Value::Int(v) if e.is_constant() => {
                            let mut r = Expr::at(span);
                            r.value = Value::Int(i64::from(v == 0));
                            Ok(r)
                        }
                        _ => Err(AsmError::TypeMismatch {
                            detail: String::from("'!' requires an integer constant"),
                            span,
                        }),
                    };
                }
                _ => {}
            }
        }
        self.atom(in_mem)
    }

    fn atom(&mut self, in_mem: bool) -> Result<Expr, AsmError> {
        let Some(tok) = self.peek() else {
            return Err(self.syntax("expected an operand"));
        };
        let span = tok.span;
        let mut e = Expr::at(span);
        match &tok.kind {
            TokenKind::Int(v) => {
                e.value = Value::Int(*v);
                self.pos += 1;
            }
            TokenKind::Float(v) => {
                e.value = Value::Float(*v);
                self.pos += 1;
            }
            TokenKind::Char(v) => {
                e.value = Value::Int(*v as i64);
                self.pos += 1;
            }
            TokenKind::Str(s) => {
                e.value = Value::Str(s.clone());
                self.pos += 1;
            }
            TokenKind::Register(r) => {
                if in_mem {
                    e.mem = Some(MemOperand {
                        base: Some(*r),
                        scale: 1,
                        ..MemOperand::default()
                    });
                } else {
                    e.reg1 = Some(*r);
                }
                self.pos += 1;
            }
            TokenKind::SymbolRef(idx) => {
                let sym = self.syms.get(*idx);
                if sym.flags & (SYM_CONSTANT | SYM_DEFINED) == (SYM_CONSTANT | SYM_DEFINED) {
                    // Resolved assemble-time constant folds immediately.
                    e.value = Value::Int(sym.value);
                } else {
                    e.sym1 = Some(*idx);
                    e.value = Value::Int(0);
                    e.unresolved = true;
                }
                self.pos += 1;
            }
            TokenKind::Name => {
                let name = String::from(tok.text(self.src));
                return Err(AsmError::UndefinedSymbol { name, span });
            }
            TokenKind::Instruction(idx) => {
                let idx = *idx;
                self.pos += 1;
                return self.call(idx, span);
            }
            TokenKind::Operator(op) if *op == OP_LPAREN => {
                self.pos += 1;
                let inner = self.binary(MAX_OPERAND_PRIORITY, in_mem)?;
                if self.peek_op() != Some(OP_RPAREN) {
                    return Err(AsmError::UnmatchedBracket { bracket: '(', span });
                }
                self.pos += 1;
                return Ok(inner);
            }
            TokenKind::Operator(op) if *op == OP_LBRACKET => {
                self.pos += 1;
                let inner = self.binary(MAX_OPERAND_PRIORITY, true)?;
                if self.peek_op() != Some(OP_RBRACKET) {
                    return Err(AsmError::UnmatchedBracket { bracket: '[', span });
                }
                self.pos += 1;
                return finish_mem(inner, span);
            }
            _ => {
                return Err(self.syntax("unexpected token in expression"));
            }
        }
        Ok(e)
    }

    /// Function-call spelling: `name(arg1, arg2)` where `name` resolved to
    /// an instruction.
    fn call(&mut self, itab_index: u32, span: Span) -> Result<Expr, AsmError> {
        let def = self.itab.get(itab_index);
        let id = def.id;
        if self.peek_op() != Some(OP_LPAREN) {
            return Err(self.syntax("expected '(' after instruction name"));
        }
        self.pos += 1;
        let mut e = Expr::at(span);
        e.instruction = Some(id);
        if self.peek_op() != Some(OP_RPAREN) {
            loop {
                let arg = self.binary(MAX_OPERAND_PRIORITY, false)?;
                e = place_call_arg(e, arg, span)?;
                match self.peek_op() {
                    Some(op) if op == OP_COMMA => {
                        self.pos += 1;
                    }
                    Some(op) if op == OP_RPAREN => break,
                    _ => return Err(AsmError::UnmatchedBracket { bracket: '(', span }),
                }
            }
        }
        self.pos += 1; // ')'
        Ok(e)
    }
}

/// Slot a call argument into the next free operand position.
fn place_call_arg(mut e: Expr, arg: Expr, span: Span) -> Result<Expr, AsmError> {
    if arg.instruction.is_some() || arg.cmp_op.is_some() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("nested operation in instruction argument"),
            span,
        });
    }
    if let Some(r) = arg.reg1 {
        if e.reg1.is_none() {
            e.reg1 = Some(r);
        } else if e.reg2.is_none() {
            e.reg2 = Some(r);
        } else {
            return Err(AsmError::TypeMismatch {
                detail: String::from("too many register operands"),
                span,
            });
        }
        return Ok(e);
    }
    if arg.mem.is_some() || !arg.value.is_none() || arg.sym1.is_some() {
        return e.merge(arg, span);
    }
    Err(AsmError::TypeMismatch {
        detail: String::from("empty instruction argument"),
        span,
    })
}

/// Wrap the inner expression of `[...]` into a memory operand.
fn finish_mem(inner: Expr, span: Span) -> Result<Expr, AsmError> {
    let mut mem = inner.mem.unwrap_or_default();
    if let Value::Int(v) = inner.value {
        mem.offset = mem.offset.wrapping_add(v);
    } else if !inner.value.is_none() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("memory address must be integral"),
            span,
        });
    }
    if let Some(s) = inner.sym1 {
        if mem.sym.is_some() {
            return Err(AsmError::TypeMismatch {
                detail: String::from("two symbols in one memory operand"),
                span,
            });
        }
        mem.sym = Some(s);
    }
    if mem.scale == 0 {
        mem.scale = 1;
    }
    let mut e = Expr::at(span);
    e.mem = Some(mem);
    e.unresolved = inner.unresolved;
    Ok(e)
}

/// Unary minus. Folds constants; swaps the symbols of a difference.
fn negate(e: Expr, span: Span) -> Result<Expr, AsmError> {
    let mut r = e;
    match (&r.value, r.sym1, r.sym2) {
        (Value::Int(v), None, None) if r.is_constant() => {
            r.value = Value::Int(v.wrapping_neg());
            Ok(r)
        }
        (Value::Float(v), None, None) if r.is_constant() => {
            r.value = Value::Float(-v);
            Ok(r)
        }
        // −(a − b) = b − a with the addend negated.
        (_, Some(_), Some(_)) => {
            core::mem::swap(&mut r.sym1, &mut r.sym2);
            if let Value::Int(v) = r.value {
                r.value = Value::Int(v.wrapping_neg());
            }
            Ok(r)
        }
        _ => Err(AsmError::TypeMismatch {
            detail: String::from("operand of unary '-' cannot be negated"),
            span,
        }),
    }
}

// ─── Dyadic dispatch ────────────────────────────────────────────────────

/// Combine two evaluated operands with a binary operator outside a memory
/// bracket.
fn op2(op: OpId, a: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    // Symbol arithmetic first: sym ± const, sym − sym, diff / scale.
    if a.sym1.is_some() || b.sym1.is_some() {
        return op2_symbols(op, a, b, span);
    }
    // Register / memory operands assemble an instruction.
    if a.reg1.is_some() || a.mem.is_some() || a.instruction.is_some() || b.reg1.is_some() {
        return op2_operands(op, a, b, span);
    }
    // Pure scalars fold.
    match (&a.value, &b.value) {
        (Value::Int(x), Value::Int(y)) => op2_int(op, *x, *y, span),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let x = to_float(&a, span)?;
            let y = to_float(&b, span)?;
            op2_float(op, x, y, span)
        }
        (Value::Str(x), Value::Str(y)) => op2_string(op, x, y, span),
        _ => Err(AsmError::TypeMismatch {
            detail: String::from("operands cannot be combined"),
            span,
        }),
    }
}

fn to_float(e: &Expr, span: Span) -> Result<f64, AsmError> {
    match &e.value {
        Value::Float(v) => Ok(*v),
        Value::Int(v) => Ok(*v as f64),
        _ => Err(AsmError::TypeMismatch {
            detail: String::from("operand is not numeric"),
            span,
        }),
    }
}

/// Integer × integer.
fn op2_int(op: OpId, x: i64, y: i64, span: Span) -> Result<Expr, AsmError> {
    let v = match op {
        OP_PLUS => x.wrapping_add(y),
        OP_MINUS => x.wrapping_sub(y),
        OP_MUL => x.wrapping_mul(y),
        OP_DIV => {
            if y == 0 {
                return Err(AsmError::DivisionByZero { span });
            }
            // Round toward zero, mirroring the target's runtime division.
            x.wrapping_div(y)
        }
        OP_PERCENT => {
            if y == 0 {
                return Err(AsmError::DivisionByZero { span });
            }
            x.wrapping_rem(y)
        }
        OP_AND => x & y,
        OP_OR => x | y,
        OP_XOR => x ^ y,
        OP_SHL => x.wrapping_shl(y as u32 & 63),
        OP_SHR => x.wrapping_shr(y as u32 & 63),
        OP_SHRU => ((x as u64).wrapping_shr(y as u32 & 63)) as i64,
        OP_LT => i64::from(x < y),
        OP_LE => i64::from(x <= y),
        OP_GT => i64::from(x > y),
        OP_GE => i64::from(x >= y),
        OP_EQUAL => i64::from(x == y),
        OP_NEQUAL => i64::from(x != y),
        OP_ANDAND => i64::from(x != 0 && y != 0),
        OP_OROR => i64::from(x != 0 || y != 0),
        _ => {
            return Err(AsmError::TypeMismatch {
                detail: format!("operator '{}' not defined on integers", op),
                span,
            })
        }
    };
    let mut e = Expr::at(span);
    e.value = Value::Int(v);
    Ok(e)
}

/// Float × float (integers promoted). IEEE semantics; NaN propagates
/// through arithmetic and makes comparisons false.
fn op2_float(op: OpId, x: f64, y: f64, span: Span) -> Result<Expr, AsmError> {
    let mut e = Expr::at(span);
    e.value = match op {
        OP_PLUS => Value::Float(x + y),
        OP_MINUS => Value::Float(x - y),
        OP_MUL => Value::Float(x * y),
        OP_DIV => Value::Float(x / y),
        OP_PERCENT => Value::Float(x % y),
        OP_LT => Value::Int(i64::from(x < y)),
        OP_LE => Value::Int(i64::from(x <= y)),
        OP_GT => Value::Int(i64::from(x > y)),
        OP_GE => Value::Int(i64::from(x >= y)),
        OP_EQUAL => Value::Int(i64::from(x == y)),
        OP_NEQUAL => Value::Int(i64::from(x != y)),
        _ => {
            return Err(AsmError::TypeMismatch {
                detail: format!("operator '{}' not defined on floats", op),
                span,
            })
        }
    };
    Ok(e)
}

/// String × string: concatenation and lexicographic comparison.
fn op2_string(op: OpId, x: &str, y: &str, span: Span) -> Result<Expr, AsmError> {
    let mut e = Expr::at(span);
    e.value = match op {
        OP_PLUS => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Value::Str(s)
        }
        OP_LT => Value::Int(i64::from(x < y)),
        OP_LE => Value::Int(i64::from(x <= y)),
        OP_GT => Value::Int(i64::from(x > y)),
        OP_GE => Value::Int(i64::from(x >= y)),
        OP_EQUAL => Value::Int(i64::from(x == y)),
        OP_NEQUAL => Value::Int(i64::from(x != y)),
        _ => {
            return Err(AsmError::TypeMismatch {
                detail: format!("operator '{}' not defined on strings", op),
                span,
            })
        }
    };
    Ok(e)
}

/// Symbol arithmetic: `sym ± const`, `sym − sym`, `(sym − sym) / scale`.
fn op2_symbols(op: OpId, a: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    let mut r = a.clone();
    match op {
        OP_PLUS | OP_MINUS => {
            if let (Some(_), Some(bs)) = (a.sym1, b.sym1) {
                if op == OP_MINUS && a.sym2.is_none() && b.sym2.is_none() {
                    r.sym2 = Some(bs);
                    let addend = a.value.as_int().unwrap_or(0) - b.value.as_int().unwrap_or(0);
                    r.value = Value::Int(addend);
                    return Ok(r);
                }
                return Err(AsmError::TypeMismatch {
                    detail: String::from("symbols can only be subtracted, not added"),
                    span,
                });
            }
            // sym ± const (const + sym also allowed; const − sym is not).
            if op == OP_MINUS && a.sym1.is_none() {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("a symbol cannot be subtracted from a constant"),
                    span,
                });
            }
            let (symex, con) = if a.sym1.is_some() { (a, b) } else { (b, a) };
            let Some(k) = con.value.as_int().filter(|_| con.is_constant()) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("symbol can only combine with an integer constant"),
                    span,
                });
            };
            let mut r = symex;
            let base = r.value.as_int().unwrap_or(0);
            let k = if op == OP_MINUS { -k } else { k };
            r.value = Value::Int(base.wrapping_add(k));
            r.span = span;
            Ok(r)
        }
        OP_DIV => {
            // (sym1 − sym2) / scale with scale in {1, 2, 4, 8}.
            let Some(k) = b.value.as_int().filter(|_| b.is_constant()) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("symbol difference can only be divided by a constant"),
                    span,
                });
            };
            if a.sym2.is_none() || !matches!(k, 1 | 2 | 4 | 8) {
                return Err(AsmError::TypeMismatch {
                    detail: String::from(
                        "scale on a symbol difference must be 1, 2, 4, or 8",
                    ),
                    span,
                });
            }
            r.symscale = k as u8;
            r.span = span;
            Ok(r)
        }
        _ => Err(AsmError::TypeMismatch {
            detail: format!("operator '{}' not defined on symbols", op),
            span,
        }),
    }
}

/// Register and memory operands: assemble the fields of one instruction.
fn op2_operands(op: OpId, a: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    // A relational operator forms a condition: `r1 > r2`, `r1 == 0`.
    if matches!(op, OP_LT | OP_LE | OP_GT | OP_GE | OP_EQUAL | OP_NEQUAL) {
        if a.reg1.is_some() && a.instruction.is_none() && a.cmp_op.is_none() {
            let mut r = a;
            r.cmp_op = Some(op);
            return fill_second_operand(r, b, span);
        }
        return Err(AsmError::TypeMismatch {
            detail: String::from("comparison needs a register on the left"),
            span,
        });
    }
    let Some(instr) = op_to_instruction(op, false) else {
        return Err(AsmError::TypeMismatch {
            detail: format!("operator '{}' not defined on registers", op),
            span,
        });
    };
    // Only one operator level fits a single instruction.
    if a.instruction.is_some() || b.instruction.is_some() || a.cmp_op.is_some() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("expression too complex for one instruction"),
            span,
        });
    }
    if a.reg1.is_none() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("left operand must be a register"),
            span,
        });
    }
    let mut r = a;
    r.instruction = Some(instr);
    fill_second_operand(r, b, span)
}

/// Attach `b` as the second source operand of `r`.
fn fill_second_operand(mut r: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    if let Some(reg) = b.reg1 {
        if b.instruction.is_some() || b.cmp_op.is_some() {
            return Err(AsmError::TypeMismatch {
                detail: String::from("expression too complex for one instruction"),
                span,
            });
        }
        r.reg2 = Some(reg);
    } else if b.mem.is_some() {
        r = r.merge(b, span)?;
    } else if b.sym1.is_some() {
        r = r.merge(b, span)?;
    } else if !b.value.is_none() {
        if !r.value.is_none() {
            return Err(AsmError::TypeMismatch {
                detail: String::from("two immediate operands"),
                span,
            });
        }
        r.value = b.value;
        r.unresolved |= b.unresolved;
    } else {
        return Err(AsmError::TypeMismatch {
            detail: String::from("missing second operand"),
            span,
        });
    }
    r.span = span;
    Ok(r)
}

/// Combine the parts of a memory address inside `[...]`:
/// base + index·scale + offset + symbol.
fn op2_mem_part(op: OpId, a: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    match op {
        OP_PLUS => {
            let ma = to_mem_part(a, span)?;
            let mb = to_mem_part(b, span)?;
            merge_mem(ma, mb, span)
        }
        OP_MINUS => {
            let ma = to_mem_part(a, span)?;
            // A subtracted register is a negatively scaled index — the
            // vector-loop addressing idiom `[base - counter]`.
            if let Some(bm) = &b.mem {
                let (Some(breg), None, None) = (bm.base, bm.index, bm.sym) else {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("only a register or constant can be subtracted in an address"),
                        span,
                    });
                };
                let mut m = ma;
                let mem = m.mem.get_or_insert_with(MemOperand::default);
                if mem.index.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("two index registers in address"),
                        span,
                    });
                }
                mem.index = Some(breg);
                mem.scale = -1;
                mem.offset = mem.offset.wrapping_add(bm.offset.wrapping_neg());
                return Ok(m);
            }
            let Some(k) = b.value.as_int().filter(|_| b.is_constant() && b.mem.is_none()) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("only a register or constant can be subtracted in an address"),
                    span,
                });
            };
            let mut m = ma;
            if let Some(mem) = &mut m.mem {
                mem.offset = mem.offset.wrapping_sub(k);
            } else if let Value::Int(v) = m.value {
                m.value = Value::Int(v.wrapping_sub(k));
            }
            Ok(m)
        }
        OP_MUL => {
            // reg * scale → index register.
            let (regex, con) = if a.mem.is_some() { (a, b) } else { (b, a) };
            let Some(k) = con.value.as_int().filter(|_| con.is_constant()) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("index scale must be a constant"),
                    span,
                });
            };
            let Some(mem) = regex.mem else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("'*' in an address requires a register"),
                    span,
                });
            };
            let (Some(base), None) = (mem.base, mem.index) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("malformed scaled index"),
                    span,
                });
            };
            if !matches!(k, 1 | 2 | 4 | 8 | -1) {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("index scale must be 1, 2, 4, 8, or -1"),
                    span,
                });
            }
            let mut e = Expr::at(span);
            e.mem = Some(MemOperand {
                base: None,
                index: Some(base),
                scale: k as i8,
                offset: mem.offset,
                ..MemOperand::default()
            });
            e.unresolved = regex.unresolved;
            Ok(e)
        }
        _ => Err(AsmError::TypeMismatch {
            detail: format!("operator '{}' not allowed in an address", op),
            span,
        }),
    }
}

/// View any address part (register, constant, symbol) as a mem-part
/// expression.
fn to_mem_part(e: Expr, span: Span) -> Result<Expr, AsmError> {
    if e.instruction.is_some() || e.cmp_op.is_some() || e.reg1.is_some() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("operation not allowed in an address"),
            span,
        });
    }
    Ok(e)
}

/// Merge two address parts, enforcing one base, one index, one symbol.
fn merge_mem(a: Expr, b: Expr, span: Span) -> Result<Expr, AsmError> {
    let mut r = Expr::at(span);
    r.unresolved = a.unresolved || b.unresolved;
    let mut mem = MemOperand {
        scale: 1,
        ..MemOperand::default()
    };
    let mut offset = 0i64;
    for part in [a, b] {
        if let Some(pm) = part.mem {
            // Base meets base: the second becomes the index.
            match (pm.base, mem.base) {
                (Some(pb), Some(_)) => {
                    if mem.index.is_some() {
                        return Err(AsmError::TypeMismatch {
                            detail: String::from("too many registers in address"),
                            span,
                        });
                    }
                    mem.index = Some(pb);
                    mem.scale = 1;
                }
                (Some(pb), None) => mem.base = Some(pb),
                (None, _) => {}
            }
            if let Some(pi) = pm.index {
                if mem.index.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("two index registers in address"),
                        span,
                    });
                }
                mem.index = Some(pi);
                mem.scale = pm.scale;
            }
            if pm.sym.is_some() {
                if mem.sym.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("two symbols in one memory operand"),
                        span,
                    });
                }
                mem.sym = pm.sym;
            }
            offset = offset.wrapping_add(pm.offset);
        }
        if let Value::Int(v) = part.value {
            offset = offset.wrapping_add(v);
        }
        if let Some(s) = part.sym1 {
            if mem.sym.is_some() {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("two symbols in one memory operand"),
                    span,
                });
            }
            mem.sym = Some(s);
        }
    }
    mem.offset = offset;
    r.mem = Some(mem);
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn eval_str(src: &str) -> Result<Expr, AsmError> {
        let ts = tokenize(src, 0);
        let syms = SymbolTable::new();
        let itab = InstructionTable::builtin();
        // Strip the Eof token.
        let toks = &ts.tokens[..ts.tokens.len() - 1];
        // Mark instruction names the way pass 2 would.
        let toks: alloc::vec::Vec<Token> = toks
            .iter()
            .map(|t| {
                let mut t = t.clone();
                if t.kind == TokenKind::Name {
                    if let Some(i) = itab.find_name(t.text(src)) {
                        t.kind = TokenKind::Instruction(i);
                    }
                }
                t
            })
            .collect();
        eval(&toks, src, &syms, &itab)
    }

    fn int_of(src: &str) -> i64 {
        eval_str(src).unwrap().value.as_int().unwrap()
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(int_of("2 + 3 * 4"), 14);
        assert_eq!(int_of("(2 + 3) * 4"), 20);
        assert_eq!(int_of("7 / 2"), 3);
        assert_eq!(int_of("-7 / 2"), -3); // round toward zero
        assert_eq!(int_of("-7 % 2"), -1); // remainder takes dividend sign
        assert_eq!(int_of("1 << 4"), 16);
        assert_eq!(int_of("-8 >> 1"), -4);
        assert_eq!(int_of("-8 >>> 60"), 15);
        assert_eq!(int_of("0xF0 & 0x1F"), 0x10);
        assert_eq!(int_of("3 < 4"), 1);
        assert_eq!(int_of("3 == 4"), 0);
        assert_eq!(int_of("1 && 2"), 1);
        assert_eq!(int_of("0 || 0"), 0);
    }

    #[test]
    fn division_by_zero_reports() {
        assert!(matches!(
            eval_str("1 / 0"),
            Err(AsmError::DivisionByZero { .. })
        ));
        assert!(matches!(
            eval_str("1 % 0"),
            Err(AsmError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn float_arithmetic_and_promotion() {
        let e = eval_str("1.5 + 1").unwrap();
        assert_eq!(e.value, Value::Float(2.5));
        let e = eval_str("1.0 / 0.0").unwrap();
        assert_eq!(e.value, Value::Float(f64::INFINITY));
        // NaN propagates and compares false.
        let e = eval_str("(0.0 / 0.0) == (0.0 / 0.0)").unwrap();
        assert_eq!(e.value, Value::Int(0));
    }

    #[test]
    fn string_concat_and_compare() {
        let e = eval_str("\"ab\" + \"cd\"").unwrap();
        assert_eq!(e.value, Value::Str(String::from("abcd")));
        assert_eq!(int_of("\"ab\" < \"b\""), 1);
        assert_eq!(int_of("\"ab\" == \"ab\""), 1);
        assert!(eval_str("\"ab\" * \"cd\"").is_err());
    }

    #[test]
    fn char_literal_is_integer() {
        assert_eq!(int_of("'A' + 1"), 0x42);
    }

    #[test]
    fn ternary_selects_arm() {
        assert_eq!(int_of("1 ? 10 : 20"), 10);
        assert_eq!(int_of("0 ? 10 : 20"), 20);
    }

    #[test]
    fn register_plus_immediate_builds_add() {
        let e = eval_str("r2 + 1").unwrap();
        assert_eq!(e.reg1, Some(Register::Gp(2)));
        assert_eq!(e.instruction, Some(II_ADD));
        assert_eq!(e.value, Value::Int(1));
    }

    #[test]
    fn register_pair_builds_operation() {
        let e = eval_str("v2 + v3").unwrap();
        assert_eq!(e.reg1, Some(Register::Vector(2)));
        assert_eq!(e.reg2, Some(Register::Vector(3)));
        assert_eq!(e.instruction, Some(II_ADD));
    }

    #[test]
    fn complex_register_expression_rejected() {
        assert!(eval_str("r1 + r2 + r3").is_err());
    }

    #[test]
    fn condition_records_comparison() {
        let e = eval_str("r1 > 0").unwrap();
        assert_eq!(e.reg1, Some(Register::Gp(1)));
        assert_eq!(e.cmp_op, Some(OP_GT));
        assert_eq!(e.value, Value::Int(0));
    }

    #[test]
    fn call_spelling() {
        let e = eval_str("min(r2, r3)").unwrap();
        assert_eq!(e.instruction, Some(ir::II_MIN));
        assert_eq!(e.reg1, Some(Register::Gp(2)));
        assert_eq!(e.reg2, Some(Register::Gp(3)));
        let e = eval_str("max(r2, 7)").unwrap();
        assert_eq!(e.instruction, Some(ir::II_MAX));
        assert_eq!(e.value, Value::Int(7));
    }

    #[test]
    fn memory_operand_assembly() {
        let e = eval_str("[r1 + r2*4 + 8]").unwrap();
        let mem = e.mem.unwrap();
        assert_eq!(mem.base, Some(Register::Gp(1)));
        assert_eq!(mem.index, Some(Register::Gp(2)));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.offset, 8);
    }

    #[test]
    fn memory_operand_base_only() {
        let e = eval_str("[sp]").unwrap();
        let mem = e.mem.unwrap();
        assert_eq!(mem.base, Some(Register::Gp(31)));
        assert_eq!(mem.index, None);
        assert_eq!(mem.offset, 0);
    }

    #[test]
    fn memory_operand_two_plain_registers() {
        let e = eval_str("[r1 + r2]").unwrap();
        let mem = e.mem.unwrap();
        assert_eq!(mem.base, Some(Register::Gp(1)));
        assert_eq!(mem.index, Some(Register::Gp(2)));
        assert_eq!(mem.scale, 1);
    }

    #[test]
    fn bad_scale_rejected() {
        assert!(eval_str("[r1 + r2*3]").is_err());
    }

    #[test]
    fn too_many_address_registers_rejected() {
        assert!(eval_str("[r1 + r2 + r3]").is_err());
    }

    #[test]
    fn unmatched_brackets() {
        assert!(matches!(
            eval_str("(1 + 2"),
            Err(AsmError::UnmatchedBracket { bracket: '(', .. })
        ));
        assert!(matches!(
            eval_str("[r1"),
            Err(AsmError::UnmatchedBracket { bracket: '[', .. })
        ));
    }

    #[test]
    fn evaluation_is_deterministic_and_idempotent_on_folds() {
        // A folded constant re-evaluates to itself.
        let first = eval_str("2 + 3 * 4").unwrap();
        let refold = eval_str("14").unwrap();
        assert_eq!(first.value, refold.value);
        for _ in 0..3 {
            assert_eq!(eval_str("2 + 3 * 4").unwrap().value, first.value);
        }
    }

    #[test]
    fn merge_rejects_double_population() {
        let a = eval_str("r1").unwrap();
        let b = eval_str("r2").unwrap();
        // Same field on both sides: reg1.
        assert!(a.clone().merge(b, Span::dummy()).is_err());
        let c = eval_str("5").unwrap();
        let merged = a.merge(c, Span::dummy()).unwrap();
        assert_eq!(merged.reg1, Some(Register::Gp(1)));
        assert_eq!(merged.value, Value::Int(5));
    }

    #[test]
    fn operator_instruction_mapping() {
        assert_eq!(op_to_instruction(OP_PLUS, false), Some(II_ADD));
        assert_eq!(op_to_instruction(OP_DIV, true), Some(II_DIV_U));
        assert_eq!(op_to_instruction(OP_SHR, false), Some(II_SHIFT_RIGHT_S));
        assert_eq!(op_to_instruction(OP_SHRU, false), Some(II_SHIFT_RIGHT_U));
        assert_eq!(op_to_instruction(OP_QUESTION, false), None);
    }
}
