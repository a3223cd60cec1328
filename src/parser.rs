//! Statement-level interpretation: line classification, known-name
//! replacement, meta directives, and turning source statements into
//! abstract [`Code`]s and data definitions.
//!
//! Pass 2 owns the first half of this module: [`classify`] decides what a
//! statement is, [`MetaEnv`] evaluates `%` lines (assemble-time variables
//! and `%if`/`%else`/`%endif` conditionals), and [`replace_known_names`]
//! rewrites name tokens into symbol references, instruction references, or
//! literal meta-variable values.
//!
//! Pass 3 uses the second half: [`parse_code_line`] interprets one code
//! statement (assignment form, compound assignment, store, or
//! mnemonic-led jump) into a [`Code`]; [`parse_data_line`] evaluates a
//! data definition; the directive parsers handle `section`, `public`,
//! `extern`, and `align`.

#[allow(unused_imports)]
use alloc::format;
use alloc::collections::BTreeMap;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::encoder::Code;
use crate::error::{AsmError, Span};
use crate::expr::{self, Expr, Value};
use crate::ir::{
    self, is_jump_id, LineKind, OperandType, Register, II_ALIGN, II_DIV, II_DIV_U, II_MOVE,
    II_POP, II_PUSH, II_REM, II_REM_U, II_RETURN, II_SHIFT_RIGHT_S, II_SHIFT_RIGHT_U, II_STORE,
    MAX_ALIGN,
};
use crate::itable::InstructionTable;
use crate::lexer::{
    Attribute, Directive, HllKw, OptionKw, Token, TokenKind, OP_ASSIGN, OP_COMMA, OP_LBRACE,
    OP_LBRACKET, OP_PERCENT, OP_RBRACE,
};
use crate::symtab::SymbolTable;

// ─── Classification ─────────────────────────────────────────────────────

/// Classify one statement's tokens (pass 2). Leading labels are skipped
/// for the decision.
#[must_use]
pub fn classify(toks: &[Token]) -> LineKind {
    let mut i = 0;
    while matches!(toks.get(i).map(|t| &t.kind), Some(TokenKind::Label)) {
        i += 1;
    }
    let Some(tok) = toks.get(i) else {
        return if i > 0 { LineKind::CodeDef } else { LineKind::Unknown };
    };
    match &tok.kind {
        TokenKind::Directive(Directive::Section) => LineKind::Section,
        TokenKind::Directive(Directive::Function) => LineKind::Function,
        TokenKind::Directive(Directive::End) => LineKind::EndDir,
        TokenKind::Directive(Directive::Public) | TokenKind::Directive(Directive::Extern) => {
            LineKind::PublicDef
        }
        TokenKind::Operator(op) if *op == OP_PERCENT && i == 0 => LineKind::MetaDef,
        TokenKind::Type { .. } => match toks.get(i + 1).map(|t| &t.kind) {
            Some(TokenKind::Name | TokenKind::SymbolRef(_)) => LineKind::DataDef,
            _ => LineKind::CodeDef,
        },
        TokenKind::Error => LineKind::Error,
        _ => LineKind::CodeDef,
    }
}

// ─── Meta environment ───────────────────────────────────────────────────

/// One `%if` nesting level.
#[derive(Debug, Clone, Copy)]
struct CondFrame {
    /// The surrounding context was active.
    parent_active: bool,
    /// Some arm of this conditional has been taken.
    taken: bool,
    /// The current arm is active.
    active: bool,
    /// An `%else` has been seen.
    in_else: bool,
}

/// Assemble-time meta variables and the `%if` conditional stack.
#[derive(Debug, Clone, Default)]
pub struct MetaEnv {
    vars: BTreeMap<String, Value>,
    conds: Vec<CondFrame>,
}

impl MetaEnv {
    /// Create an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether statements at the current position are active (not
    /// suppressed by a false `%if` arm).
    #[must_use]
    pub fn active(&self) -> bool {
        self.conds.iter().all(|c| c.active)
    }

    /// Look up a meta variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Whether any conditional is still open (checked at end of input).
    #[must_use]
    pub fn unclosed_conditional(&self) -> bool {
        !self.conds.is_empty()
    }

    /// Process a `%` line: variable assignment, `%if`, `%else`, `%endif`.
    ///
    /// # Errors
    ///
    /// Reports malformed meta lines, non-constant `%if` conditions, and
    /// stray `%else`/`%endif`.
    pub fn process(
        &mut self,
        toks: &[Token],
        src: &str,
        syms: &SymbolTable,
        itab: &InstructionTable,
    ) -> Result<(), AsmError> {
        let span = toks.first().map_or_else(Span::dummy, |t| t.span);
        let Some(head) = toks.get(1) else {
            return Err(AsmError::Syntax {
                msg: String::from("empty meta line"),
                span,
            });
        };
        match &head.kind {
            TokenKind::Hll(HllKw::If) => {
                if !self.active() {
                    self.conds.push(CondFrame {
                        parent_active: false,
                        taken: true,
                        active: false,
                        in_else: false,
                    });
                    return Ok(());
                }
                let cond = self.eval_meta(&toks[2..], src, syms, itab)?;
                if !cond.is_constant() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("%if condition must be an assemble-time constant"),
                        span: head.span,
                    });
                }
                let truth = cond.value.as_int().map_or(false, |v| v != 0);
                self.conds.push(CondFrame {
                    parent_active: true,
                    taken: truth,
                    active: truth,
                    in_else: false,
                });
                Ok(())
            }
            TokenKind::Hll(HllKw::Else) => {
                let Some(frame) = self.conds.last_mut() else {
                    return Err(AsmError::Syntax {
                        msg: String::from("%else without %if"),
                        span: head.span,
                    });
                };
                if frame.in_else {
                    return Err(AsmError::Syntax {
                        msg: String::from("duplicate %else"),
                        span: head.span,
                    });
                }
                frame.in_else = true;
                frame.active = frame.parent_active && !frame.taken;
                frame.taken = true;
                Ok(())
            }
            TokenKind::Name if head.text(src) == "endif" => {
                if self.conds.pop().is_none() {
                    return Err(AsmError::Syntax {
                        msg: String::from("%endif without %if"),
                        span: head.span,
                    });
                }
                Ok(())
            }
            TokenKind::Name if head.text(src) == "include" => Err(AsmError::Syntax {
                msg: String::from("%include requires an include resolver"),
                span: head.span,
            }),
            TokenKind::Name => {
                if !self.active() {
                    return Ok(());
                }
                // %name = expr
                let name = String::from(head.text(src));
                match toks.get(2).map(|t| &t.kind) {
                    Some(TokenKind::Operator(op)) if *op == OP_ASSIGN => {}
                    _ => {
                        return Err(AsmError::Syntax {
                            msg: String::from("expected '=' in meta definition"),
                            span: head.span,
                        })
                    }
                }
                let value = self.eval_meta(&toks[3..], src, syms, itab)?;
                if !value.is_constant() || value.value.is_none() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("meta variable must be an assemble-time constant"),
                        span: head.span,
                    });
                }
                self.vars.insert(name, value.value);
                Ok(())
            }
            _ => Err(AsmError::Syntax {
                msg: String::from("unrecognized meta directive"),
                span: head.span,
            }),
        }
    }

    /// Evaluate a meta expression with variable references substituted.
    fn eval_meta(
        &self,
        toks: &[Token],
        src: &str,
        syms: &SymbolTable,
        itab: &InstructionTable,
    ) -> Result<Expr, AsmError> {
        let mut owned: Vec<Token> = toks.to_vec();
        substitute_meta(&mut owned, src, self);
        expr::eval(&owned, src, syms, itab)
    }
}

/// Replace name tokens that match meta variables with their literal
/// values.
fn substitute_meta(toks: &mut [Token], src: &str, metas: &MetaEnv) {
    for tok in toks {
        if tok.kind == TokenKind::Name {
            if let Some(v) = metas.get(tok.text(src)) {
                tok.kind = match v {
                    Value::Int(x) => TokenKind::Int(*x),
                    Value::Float(x) => TokenKind::Float(*x),
                    Value::Str(s) => TokenKind::Str(s.clone()),
                    Value::None => continue,
                };
            }
        }
    }
}

/// Replace known names in one active statement (pass 2): meta variables
/// become literals, symbol names become symbol references, instruction
/// mnemonics become instruction references.
pub fn replace_known_names(
    toks: &mut [Token],
    src: &str,
    syms: &SymbolTable,
    itab: &InstructionTable,
    metas: &MetaEnv,
) {
    substitute_meta(toks, src, metas);
    for tok in toks {
        if tok.kind == TokenKind::Name {
            let text = tok.text(src);
            if let Some(idx) = syms.find(text) {
                tok.kind = TokenKind::SymbolRef(idx);
            } else if let Some(idx) = itab.find_name(text) {
                tok.kind = TokenKind::Instruction(idx);
            }
        }
    }
}

// ─── Directive parsing ──────────────────────────────────────────────────

/// A parsed `section` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDef {
    /// Section name.
    pub name: String,
    /// `SHF_*` flag bits.
    pub flags: u32,
    /// Alignment in bytes.
    pub align: u32,
}

/// Parse `section <name> <attr…>`.
///
/// # Errors
///
/// Reports a missing name, an unknown attribute, or an invalid alignment.
pub fn parse_section_line(toks: &[Token], src: &str) -> Result<SectionDef, AsmError> {
    let span = toks.first().map_or_else(Span::dummy, |t| t.span);
    let Some(name_tok) = toks.get(1) else {
        return Err(AsmError::Syntax {
            msg: String::from("section directive needs a name"),
            span,
        });
    };
    if !matches!(
        name_tok.kind,
        TokenKind::Name | TokenKind::SymbolRef(_) | TokenKind::Instruction(_)
    ) {
        return Err(AsmError::Syntax {
            msg: String::from("section directive needs a name"),
            span: name_tok.span,
        });
    }
    let mut def = SectionDef {
        name: String::from(name_tok.text(src)),
        flags: 0,
        align: 4,
    };
    let mut i = 2;
    while let Some(tok) = toks.get(i) {
        match &tok.kind {
            TokenKind::Attribute(Attribute::Read) => def.flags |= ir::SHF_READ,
            TokenKind::Attribute(Attribute::Write) => def.flags |= ir::SHF_WRITE,
            TokenKind::Attribute(Attribute::Execute) => def.flags |= ir::SHF_EXEC | ir::SHF_READ,
            TokenKind::Attribute(Attribute::Weak) => def.flags |= ir::SHF_WEAK,
            TokenKind::Attribute(Attribute::Uninit) => def.flags |= ir::SHF_UNINIT,
            TokenKind::Attribute(Attribute::Comdat) => def.flags |= ir::SHF_COMDAT,
            TokenKind::Attribute(Attribute::Align) => {
                i += 1;
                let align = match toks.get(i).map(|t| &t.kind) {
                    Some(TokenKind::Int(v)) if *v > 0 => *v as u64,
                    _ => {
                        return Err(AsmError::Syntax {
                            msg: String::from("align needs a positive integer"),
                            span: tok.span,
                        })
                    }
                };
                if align > MAX_ALIGN {
                    return Err(AsmError::AlignmentTooLarge {
                        requested: align,
                        span: tok.span,
                    });
                }
                if !align.is_power_of_two() {
                    return Err(AsmError::Syntax {
                        msg: String::from("alignment must be a power of two"),
                        span: tok.span,
                    });
                }
                def.align = align as u32;
            }
            TokenKind::Operator(op) if *op == OP_COMMA => {}
            _ => {
                return Err(AsmError::Syntax {
                    msg: format!("unexpected token in section directive: '{}'", tok.text(src)),
                    span: tok.span,
                })
            }
        }
        i += 1;
    }
    if def.flags & (ir::SHF_READ | ir::SHF_WRITE | ir::SHF_EXEC) == 0 {
        def.flags |= ir::SHF_READ | ir::SHF_WRITE;
    }
    Ok(def)
}

/// Parse `public name, name, …`, returning the names.
///
/// # Errors
///
/// Reports when a listed item is not a name.
pub fn parse_public_line(toks: &[Token], src: &str) -> Result<Vec<String>, AsmError> {
    let mut names = Vec::new();
    let mut i = 1;
    while let Some(tok) = toks.get(i) {
        match &tok.kind {
            TokenKind::Name | TokenKind::SymbolRef(_) | TokenKind::Instruction(_) => {
                names.push(String::from(tok.text(src)));
            }
            TokenKind::Operator(op) if *op == OP_COMMA => {}
            _ => {
                return Err(AsmError::Syntax {
                    msg: String::from("expected a symbol name"),
                    span: tok.span,
                })
            }
        }
        i += 1;
    }
    if names.is_empty() {
        return Err(AsmError::Syntax {
            msg: String::from("public directive needs at least one name"),
            span: toks.first().map_or_else(Span::dummy, |t| t.span),
        });
    }
    Ok(names)
}

/// One declared external symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternDef {
    /// Symbol name.
    pub name: String,
    /// Declared type, when given.
    pub dtype: Option<OperandType>,
    /// Declared as an external constant rather than an address.
    pub constant: bool,
}

/// Parse `extern name: type [constant], …`.
///
/// # Errors
///
/// Reports malformed declarations.
pub fn parse_extern_line(toks: &[Token], src: &str) -> Result<Vec<ExternDef>, AsmError> {
    let mut out = Vec::new();
    let mut i = 1;
    while let Some(tok) = toks.get(i) {
        match &tok.kind {
            TokenKind::Label => {
                // `name:` — the lexer folded the colon into the token.
                let text = tok.text(src);
                let name = String::from(text.strip_suffix(':').unwrap_or(text));
                let mut def = ExternDef {
                    name,
                    dtype: None,
                    constant: false,
                };
                // Optional type and `constant` attribute.
                while let Some(next) = toks.get(i + 1) {
                    match &next.kind {
                        TokenKind::Type { ty, .. } => {
                            def.dtype = Some(*ty);
                            i += 1;
                        }
                        TokenKind::Attribute(Attribute::Constant) => {
                            def.constant = true;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(def);
            }
            TokenKind::Name | TokenKind::SymbolRef(_) => {
                out.push(ExternDef {
                    name: String::from(tok.text(src)),
                    dtype: None,
                    constant: false,
                });
            }
            TokenKind::Operator(op) if *op == OP_COMMA => {}
            _ => {
                return Err(AsmError::Syntax {
                    msg: String::from("malformed extern declaration"),
                    span: tok.span,
                })
            }
        }
        i += 1;
    }
    if out.is_empty() {
        return Err(AsmError::Syntax {
            msg: String::from("extern directive needs at least one name"),
            span: toks.first().map_or_else(Span::dummy, |t| t.span),
        });
    }
    Ok(out)
}

// ─── Data definitions ───────────────────────────────────────────────────

/// A parsed data definition line.
#[derive(Debug, Clone)]
pub struct DataDef {
    /// Element type.
    pub ty: OperandType,
    /// Symbol index of the defined name.
    pub name: Option<u32>,
    /// Evaluated initializers (empty for a bare reservation).
    pub items: Vec<Expr>,
    /// Source span.
    pub span: Span,
}

/// Parse `type name = expr, expr, …` or a bare `type name` reservation.
///
/// # Errors
///
/// Reports malformed definitions and initializer evaluation failures.
pub fn parse_data_line(
    toks: &[Token],
    src: &str,
    syms: &SymbolTable,
    itab: &InstructionTable,
) -> Result<DataDef, AsmError> {
    let span = toks.first().map_or_else(Span::dummy, |t| t.span);
    let Some(TokenKind::Type { ty, .. }) = toks.first().map(|t| &t.kind) else {
        return Err(AsmError::Syntax {
            msg: String::from("data definition must start with a type"),
            span,
        });
    };
    let ty = *ty;
    let name = match toks.get(1).map(|t| &t.kind) {
        Some(TokenKind::SymbolRef(idx)) => Some(*idx),
        Some(TokenKind::Name) => {
            return Err(AsmError::UndefinedSymbol {
                name: String::from(toks[1].text(src)),
                span: toks[1].span,
            })
        }
        _ => {
            return Err(AsmError::Syntax {
                msg: String::from("data definition needs a name"),
                span,
            })
        }
    };
    let mut items = Vec::new();
    match toks.get(2).map(|t| &t.kind) {
        None => {}
        Some(TokenKind::Operator(op)) if *op == OP_ASSIGN => {
            let mut i = 3;
            loop {
                let e = expr::eval(&toks[i..], src, syms, itab)?;
                i += e.tokens as usize;
                items.push(e);
                match toks.get(i).map(|t| &t.kind) {
                    None => break,
                    Some(TokenKind::Operator(op)) if *op == OP_COMMA => i += 1,
                    Some(_) => {
                        return Err(AsmError::Syntax {
                            msg: String::from("expected ',' between initializers"),
                            span: toks[i].span,
                        })
                    }
                }
            }
        }
        Some(_) => {
            return Err(AsmError::Syntax {
                msg: String::from("expected '=' in data definition"),
                span: toks[2].span,
            })
        }
    }
    Ok(DataDef {
        ty,
        name,
        items,
        span,
    })
}

// ─── Code lines ─────────────────────────────────────────────────────────

/// Flip signed operations to their unsigned variants for unsigned types.
fn apply_unsigned(id: u32, dtype: Option<OperandType>) -> u32 {
    if dtype.is_some_and(OperandType::is_unsigned) {
        match id {
            II_DIV => II_DIV_U,
            II_REM => II_REM_U,
            II_SHIFT_RIGHT_S => II_SHIFT_RIGHT_U,
            other => other,
        }
    } else {
        id
    }
}

/// Build a [`Code`] skeleton for an instruction id.
fn code_for(
    id: u32,
    itab: &InstructionTable,
    span: Span,
) -> Result<Code, AsmError> {
    let Some(instr) = itab.find_id(id) else {
        return Err(AsmError::Syntax {
            msg: String::from("operation has no instruction table entry"),
            span,
        });
    };
    Ok(Code {
        id,
        instr,
        category: Some(itab.get(instr).category),
        span,
        ..Code::default()
    })
}

/// Move an evaluated right-hand side into a code's operand fields.
fn fill_from_expr(code: &mut Code, e: &Expr, span: Span) -> Result<(), AsmError> {
    if code.reg1.is_none() {
        code.reg1 = e.reg1;
    } else if let Some(r) = e.reg1 {
        if code.reg2.is_none() {
            code.reg2 = Some(r);
        } else {
            return Err(AsmError::TypeMismatch {
                detail: String::from("too many register operands"),
                span,
            });
        }
    }
    if code.reg2.is_none() {
        code.reg2 = e.reg2;
    } else if e.reg2.is_some() {
        return Err(AsmError::TypeMismatch {
            detail: String::from("too many register operands"),
            span,
        });
    }
    if !e.value.is_none() {
        if code.has_imm() {
            return Err(AsmError::TypeMismatch {
                detail: String::from("two immediate operands"),
                span,
            });
        }
        code.imm = e.value.clone();
    }
    if let Some(s) = e.sym1 {
        if e.mem.is_none() {
            code.imm_sym = Some(s);
            code.imm_ref = e.sym2;
            code.imm_scale = e.symscale;
        }
    }
    if let Some(mem) = &e.mem {
        if code.mem.is_some() {
            return Err(AsmError::TypeMismatch {
                detail: String::from("two memory operands"),
                span,
            });
        }
        code.mem = Some(mem.clone());
    }
    Ok(())
}

/// Parse trailing `, option = value` groups into the code.
fn parse_option_list(
    code: &mut Code,
    toks: &[Token],
    mut i: usize,
    src: &str,
) -> Result<(), AsmError> {
    while let Some(tok) = toks.get(i) {
        let TokenKind::Operator(op) = &tok.kind else {
            return Err(AsmError::Syntax {
                msg: format!("unexpected token '{}' after operands", tok.text(src)),
                span: tok.span,
            });
        };
        if *op != OP_COMMA {
            return Err(AsmError::Syntax {
                msg: format!("unexpected token '{}' after operands", tok.text(src)),
                span: tok.span,
            });
        }
        i += 1;
        let Some(opt_tok) = toks.get(i) else {
            return Err(AsmError::Syntax {
                msg: String::from("dangling comma"),
                span: tok.span,
            });
        };
        let TokenKind::Option(kw) = &opt_tok.kind else {
            return Err(AsmError::Syntax {
                msg: String::from("expected an option keyword"),
                span: opt_tok.span,
            });
        };
        let kw = *kw;
        i += 1;
        // `scalar` stands alone; everything else takes `= value`.
        if kw == OptionKw::Scalar {
            match &mut code.mem {
                Some(mem) => mem.scalar = true,
                None => {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("scalar option needs a memory operand"),
                        span: opt_tok.span,
                    })
                }
            }
            continue;
        }
        match toks.get(i).map(|t| &t.kind) {
            Some(TokenKind::Operator(op)) if *op == OP_ASSIGN => i += 1,
            _ => {
                return Err(AsmError::Syntax {
                    msg: String::from("expected '=' after option keyword"),
                    span: opt_tok.span,
                })
            }
        }
        let Some(val_tok) = toks.get(i) else {
            return Err(AsmError::Syntax {
                msg: String::from("missing option value"),
                span: opt_tok.span,
            });
        };
        i += 1;
        match (kw, &val_tok.kind) {
            (OptionKw::Mask, TokenKind::Register(r)) => {
                if r.code() > 6 {
                    return Err(AsmError::RegisterClass {
                        detail: String::from("mask register must be number 0-6"),
                        span: val_tok.span,
                    });
                }
                code.mask = Some(r.code());
            }
            (OptionKw::Fallback, TokenKind::Register(r)) => {
                code.fallback = Some(*r);
            }
            (OptionKw::Length, TokenKind::Register(r)) => match &mut code.mem {
                Some(mem) => mem.length = Some(*r),
                None => {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("length option needs a memory operand"),
                        span: val_tok.span,
                    })
                }
            },
            (OptionKw::Broadcast, TokenKind::Register(r)) => match &mut code.mem {
                Some(mem) => {
                    mem.length = Some(*r);
                    mem.broadcast = true;
                }
                None => {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("broadcast option needs a memory operand"),
                        span: val_tok.span,
                    })
                }
            },
            (OptionKw::Limit, TokenKind::Int(v)) => match &mut code.mem {
                Some(mem) => mem.limit = Some(*v as u64),
                None => {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("limit option needs a memory operand"),
                        span: val_tok.span,
                    })
                }
            },
            (OptionKw::Options, TokenKind::Int(v)) => {
                code.options = Some(*v as u8);
            }
            _ => {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("invalid option value"),
                    span: val_tok.span,
                })
            }
        }
    }
    Ok(())
}

/// Interpret one code statement into an abstract [`Code`].
///
/// The statement must not start with a label (the caller strips those) and
/// must not be a structured-control statement (the caller routes those to
/// the high-level lowering).
///
/// # Errors
///
/// Reports syntax and operand errors for the statement.
pub fn parse_code_line(
    toks: &[Token],
    src: &str,
    syms: &SymbolTable,
    itab: &InstructionTable,
) -> Result<Code, AsmError> {
    let span = toks.first().map_or_else(Span::dummy, |t| t.span);
    let mut i = 0;
    let mut dtype = None;
    let mut dtype_plus = false;
    if let Some(TokenKind::Type { ty, plus }) = toks.first().map(|t| &t.kind) {
        dtype = Some(*ty);
        dtype_plus = *plus;
        i += 1;
    }
    let Some(head) = toks.get(i) else {
        return Err(AsmError::Syntax {
            msg: String::from("empty statement"),
            span,
        });
    };
    match &head.kind {
        // Alignment request.
        TokenKind::Attribute(Attribute::Align) => {
            let align = match toks.get(i + 1).map(|t| &t.kind) {
                Some(TokenKind::Int(v)) if *v > 0 => *v as u64,
                _ => {
                    return Err(AsmError::Syntax {
                        msg: String::from("align needs a positive integer"),
                        span: head.span,
                    })
                }
            };
            if align > MAX_ALIGN {
                return Err(AsmError::AlignmentTooLarge {
                    requested: align,
                    span: head.span,
                });
            }
            if !align.is_power_of_two() {
                return Err(AsmError::Syntax {
                    msg: String::from("alignment must be a power of two"),
                    span: head.span,
                });
            }
            let mut code = Code {
                id: II_ALIGN,
                imm: Value::Int(align as i64),
                span,
                ..Code::default()
            };
            code.size = 0;
            Ok(code)
        }

        // push / pop single-register stack primitives.
        TokenKind::Hll(HllKw::Push) | TokenKind::Hll(HllKw::Pop) => {
            let id = if matches!(head.kind, TokenKind::Hll(HllKw::Push)) {
                II_PUSH
            } else {
                II_POP
            };
            let Some(TokenKind::Register(r)) = toks.get(i + 1).map(|t| &t.kind) else {
                return Err(AsmError::Syntax {
                    msg: String::from("push/pop needs a register"),
                    span: head.span,
                });
            };
            if !r.is_gp() {
                return Err(AsmError::RegisterClass {
                    detail: String::from("push/pop operates on general purpose registers"),
                    span: head.span,
                });
            }
            let mut code = code_for(id, itab, span)?;
            if id == II_PUSH {
                code.reg1 = Some(*r);
            } else {
                code.dest = Some(*r);
            }
            code.dtype = Some(dtype.unwrap_or(OperandType::Int64));
            Ok(code)
        }

        // Assignment forms: `dest = expr`, `dest op= expr`.
        TokenKind::Register(dest) => {
            let dest = *dest;
            let Some(TokenKind::Operator(op)) = toks.get(i + 1).map(|t| &t.kind) else {
                return Err(AsmError::Syntax {
                    msg: String::from("expected '=' after destination register"),
                    span: head.span,
                });
            };
            let op = *op;
            if !op.is_assignment() {
                return Err(AsmError::Syntax {
                    msg: String::from("expected an assignment operator"),
                    span: head.span,
                });
            }
            let e = expr::eval(&toks[i + 2..], src, syms, itab)?;
            let consumed = i + 2 + e.tokens as usize;
            let dtype = Some(dtype.unwrap_or(OperandType::Int64));
            let mut code = if op == OP_ASSIGN {
                if e.cmp_op.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("comparison is only allowed in conditions"),
                        span,
                    });
                }
                let id = apply_unsigned(e.instruction.unwrap_or(II_MOVE), dtype);
                let mut code = code_for(id, itab, span)?;
                code.dest = Some(dest);
                fill_from_expr(&mut code, &e, span)?;
                code
            } else {
                // Compound assignment: the destination doubles as the
                // first source.
                let base_op = crate::lexer::OpId(op.0 & !crate::lexer::OP_EQ);
                let Some(id) =
                    expr::op_to_instruction(base_op, dtype.is_some_and(OperandType::is_unsigned))
                else {
                    return Err(AsmError::Syntax {
                        msg: String::from("operator has no compound-assignment form"),
                        span: head.span,
                    });
                };
                if e.instruction.is_some() || e.cmp_op.is_some() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("expression too complex for one instruction"),
                        span,
                    });
                }
                let mut code = code_for(id, itab, span)?;
                code.dest = Some(dest);
                code.reg1 = Some(dest);
                fill_from_expr(&mut code, &e, span)?;
                code
            };
            code.dtype = dtype;
            code.dtype_plus = dtype_plus;
            parse_option_list(&mut code, toks, consumed, src)?;
            Ok(code)
        }

        // Store: `type [mem] = reg`.
        TokenKind::Operator(op) if *op == OP_LBRACKET => {
            let lhs = expr::eval(&toks[i..], src, syms, itab)?;
            let mut j = i + lhs.tokens as usize;
            let Some(mem) = lhs.mem.clone() else {
                return Err(AsmError::Syntax {
                    msg: String::from("expected a memory destination"),
                    span: head.span,
                });
            };
            match toks.get(j).map(|t| &t.kind) {
                Some(TokenKind::Operator(op)) if *op == OP_ASSIGN => j += 1,
                _ => {
                    return Err(AsmError::Syntax {
                        msg: String::from("expected '=' after memory destination"),
                        span: head.span,
                    })
                }
            }
            let rhs = expr::eval(&toks[j..], src, syms, itab)?;
            let consumed = j + rhs.tokens as usize;
            let Some(src_reg) = rhs.reg1.filter(|_| rhs.instruction.is_none()) else {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("store source must be a single register"),
                    span,
                });
            };
            let mut code = code_for(II_STORE, itab, span)?;
            code.mem_dest = true;
            code.mem = Some(mem);
            code.reg1 = Some(src_reg);
            code.dtype = Some(dtype.unwrap_or(OperandType::Int64));
            code.dtype_plus = dtype_plus;
            parse_option_list(&mut code, toks, consumed, src)?;
            Ok(code)
        }

        // Mnemonic-led statement: jumps, calls, system instructions.
        TokenKind::Instruction(idx) => {
            let idx = *idx;
            let def = itab.get(idx);
            let id = def.id;
            let mut code = Code {
                id,
                instr: idx,
                category: Some(def.category),
                span,
                ..Code::default()
            };
            let needs_type = def.variant & crate::itable::VARIANT_D0 == 0;
            if needs_type {
                code.dtype = Some(dtype.unwrap_or(OperandType::Int64));
            }
            // Operand list.
            let mut j = i + 1;
            let mut operands: Vec<Expr> = Vec::new();
            while j < toks.len() {
                if let Some(TokenKind::Option(_)) = toks.get(j).map(|t| &t.kind) {
                    j -= 1; // back to the separating comma
                    break;
                }
                let e = expr::eval(&toks[j..], src, syms, itab)?;
                j += e.tokens as usize;
                operands.push(e);
                match toks.get(j).map(|t| &t.kind) {
                    None => break,
                    Some(TokenKind::Operator(op)) if *op == OP_COMMA => j += 1,
                    Some(_) => {
                        return Err(AsmError::Syntax {
                            msg: String::from("expected ',' between operands"),
                            span: toks[j].span,
                        })
                    }
                }
            }
            if is_jump_id(id) && id != II_RETURN {
                let Some(target) = operands.pop() else {
                    return Err(AsmError::Syntax {
                        msg: String::from("jump needs a target"),
                        span,
                    });
                };
                let Some(sym) = target.sym1 else {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("jump target must be a symbol"),
                        span,
                    });
                };
                if target.value.as_int().unwrap_or(0) != 0 {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("jump target cannot carry an addend"),
                        span,
                    });
                }
                code.target = Some(sym);
            }
            for e in &operands {
                fill_from_expr(&mut code, e, span)?;
            }
            parse_option_list(&mut code, toks, j, src)?;
            Ok(code)
        }

        TokenKind::Name => Err(AsmError::UndefinedSymbol {
            name: String::from(head.text(src)),
            span: head.span,
        }),

        _ => Err(AsmError::Syntax {
            msg: format!("cannot interpret statement starting with '{}'", head.text(src)),
            span: head.span,
        }),
    }
}

/// Whether a statement opens a block (its last token is `{`).
#[must_use]
pub fn opens_block(toks: &[Token]) -> bool {
    matches!(
        toks.last().map(|t| &t.kind),
        Some(TokenKind::Operator(op)) if *op == OP_LBRACE
    )
}

/// Whether a statement starts with `}`.
#[must_use]
pub fn starts_with_close(toks: &[Token]) -> bool {
    matches!(
        toks.first().map(|t| &t.kind),
        Some(TokenKind::Operator(op)) if *op == OP_RBRACE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn setup(src: &str) -> (Vec<Token>, SymbolTable, InstructionTable) {
        let ts = tokenize(src, 0);
        let toks: Vec<Token> = ts.tokens[..ts.tokens.len() - 1].to_vec();
        (toks, SymbolTable::new(), InstructionTable::builtin())
    }

    fn prepared(src: &str) -> (Vec<Token>, SymbolTable, InstructionTable) {
        let (mut toks, syms, itab) = setup(src);
        let metas = MetaEnv::new();
        replace_known_names(&mut toks, src, &syms, &itab, &metas);
        (toks, syms, itab)
    }

    #[test]
    fn classify_lines() {
        let (toks, ..) = setup("section code execute");
        assert_eq!(classify(&toks), LineKind::Section);
        let (toks, ..) = setup("function f:");
        assert_eq!(classify(&toks), LineKind::Function);
        let (toks, ..) = setup("int32 myvar = 1");
        assert_eq!(classify(&toks), LineKind::DataDef);
        let (toks, ..) = setup("int32 r1 = r2 + 1");
        assert_eq!(classify(&toks), LineKind::CodeDef);
        let (toks, ..) = setup("% count = 3");
        assert_eq!(classify(&toks), LineKind::MetaDef);
        let (toks, ..) = setup("end");
        assert_eq!(classify(&toks), LineKind::EndDir);
        let (toks, ..) = setup("public f");
        assert_eq!(classify(&toks), LineKind::PublicDef);
    }

    #[test]
    fn section_directive_parses_attributes() {
        let src = "section code execute align 16";
        let (toks, ..) = setup(src);
        let def = parse_section_line(&toks, src).unwrap();
        assert_eq!(def.name, "code");
        assert_ne!(def.flags & ir::SHF_EXEC, 0);
        assert_eq!(def.align, 16);
    }

    #[test]
    fn section_alignment_limit() {
        let src = "section big align 8192";
        let (toks, ..) = setup(src);
        assert!(matches!(
            parse_section_line(&toks, src),
            Err(AsmError::AlignmentTooLarge { requested: 8192, .. })
        ));
    }

    #[test]
    fn extern_with_types() {
        let src = "extern callee: int64, limit: int32 constant";
        let (toks, ..) = setup(src);
        let defs = parse_extern_line(&toks, src).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "callee");
        assert_eq!(defs[0].dtype, Some(OperandType::Int64));
        assert!(!defs[0].constant);
        assert_eq!(defs[1].name, "limit");
        assert!(defs[1].constant);
    }

    #[test]
    fn meta_variable_defines_and_substitutes() {
        let src1 = "% count = 3";
        let (toks, syms, itab) = setup(src1);
        let mut metas = MetaEnv::new();
        metas.process(&toks, src1, &syms, &itab).unwrap();
        assert_eq!(metas.get("count"), Some(&Value::Int(3)));

        let src2 = "int32 r1 = r2 + count";
        let (mut toks2, syms2, itab2) = setup(src2);
        replace_known_names(&mut toks2, src2, &syms2, &itab2, &metas);
        let code = parse_code_line(&toks2, src2, &syms2, &itab2).unwrap();
        assert_eq!(code.imm, Value::Int(3));
    }

    #[test]
    fn meta_conditionals_gate_lines() {
        let (syms, itab) = (SymbolTable::new(), InstructionTable::builtin());
        let mut metas = MetaEnv::new();
        for line in ["% flag = 0", "% if flag"] {
            let ts = tokenize(line, 0);
            metas
                .process(&ts.tokens[..ts.tokens.len() - 1], line, &syms, &itab)
                .unwrap();
        }
        assert!(!metas.active());
        let line = "% else";
        let ts = tokenize(line, 0);
        metas
            .process(&ts.tokens[..ts.tokens.len() - 1], line, &syms, &itab)
            .unwrap();
        assert!(metas.active());
        let line = "% endif";
        let ts = tokenize(line, 0);
        metas
            .process(&ts.tokens[..ts.tokens.len() - 1], line, &syms, &itab)
            .unwrap();
        assert!(metas.active());
        assert!(!metas.unclosed_conditional());
    }

    #[test]
    fn assignment_builds_add_code() {
        let src = "int32 r1 = r2 + 1";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, ir::II_ADD);
        assert_eq!(code.dest, Some(Register::Gp(1)));
        assert_eq!(code.reg1, Some(Register::Gp(2)));
        assert_eq!(code.imm, Value::Int(1));
        assert_eq!(code.dtype, Some(OperandType::Int32));
    }

    #[test]
    fn plain_assignment_is_move() {
        let src = "int64 r3 = r4";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_MOVE);
        assert_eq!(code.reg1, Some(Register::Gp(4)));
    }

    #[test]
    fn load_assignment_has_memory_operand() {
        let src = "int32 r1 = [r2 + 8]";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_MOVE);
        let mem = code.mem.unwrap();
        assert_eq!(mem.base, Some(Register::Gp(2)));
        assert_eq!(mem.offset, 8);
    }

    #[test]
    fn store_line() {
        let src = "int32 [r1 + 4] = r2";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_STORE);
        assert!(code.mem_dest);
        assert_eq!(code.reg1, Some(Register::Gp(2)));
    }

    #[test]
    fn compound_assignment() {
        let src = "v2 += v1";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, ir::II_ADD);
        assert_eq!(code.dest, Some(Register::Vector(2)));
        assert_eq!(code.reg1, Some(Register::Vector(2)));
        assert_eq!(code.reg2, Some(Register::Vector(1)));
        assert_eq!(code.dtype, Some(OperandType::Int64));
    }

    #[test]
    fn unsigned_type_flips_division() {
        let src = "uint32 r1 = r2 / r3";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_DIV_U);
    }

    #[test]
    fn jump_statement() {
        let src = "jump loop_top";
        let (mut toks, mut syms, itab) = setup(src);
        let target = syms.add("loop_top");
        let metas = MetaEnv::new();
        replace_known_names(&mut toks, src, &syms, &itab, &metas);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, ir::II_JUMP);
        assert_eq!(code.target, Some(target));
        assert_eq!(code.dtype, None);
    }

    #[test]
    fn conditional_jump_with_operands() {
        let src = "int32 jump_equal r1, r2, done";
        let (mut toks, mut syms, itab) = setup(src);
        let target = syms.add("done");
        let metas = MetaEnv::new();
        replace_known_names(&mut toks, src, &syms, &itab, &metas);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, ir::II_JUMP_EQUAL);
        assert_eq!(code.reg1, Some(Register::Gp(1)));
        assert_eq!(code.reg2, Some(Register::Gp(2)));
        assert_eq!(code.target, Some(target));
        assert_eq!(code.dtype, Some(OperandType::Int32));
    }

    #[test]
    fn return_statement() {
        let src = "return";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_RETURN);
        assert_eq!(code.target, None);
    }

    #[test]
    fn push_and_pop() {
        let src = "push r5";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_PUSH);
        assert_eq!(code.reg1, Some(Register::Gp(5)));

        let src = "pop r5";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.id, II_POP);
        assert_eq!(code.dest, Some(Register::Gp(5)));
    }

    #[test]
    fn options_after_operands() {
        let src = "int32 v1 = v2 + v3, mask = r4, fallback = v5";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(code.mask, Some(4));
        assert_eq!(code.fallback, Some(Register::Vector(5)));
    }

    #[test]
    fn mask_register_range_checked() {
        let src = "int32 r1 = r2 + r3, mask = r7";
        let (toks, syms, itab) = prepared(src);
        assert!(matches!(
            parse_code_line(&toks, src, &syms, &itab),
            Err(AsmError::RegisterClass { .. })
        ));
    }

    #[test]
    fn length_option_binds_to_memory() {
        let src = "int32 v1 = [r2], length = r3";
        let (toks, syms, itab) = prepared(src);
        let code = parse_code_line(&toks, src, &syms, &itab).unwrap();
        let mem = code.mem.unwrap();
        assert_eq!(mem.length, Some(Register::Gp(3)));
        assert!(!mem.broadcast);
    }

    #[test]
    fn data_line_with_values() {
        let src = "int32 table = 1, 2, 3";
        let (mut toks, mut syms, itab) = setup(src);
        syms.add("table");
        let metas = MetaEnv::new();
        replace_known_names(&mut toks, src, &syms, &itab, &metas);
        let def = parse_data_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(def.ty, OperandType::Int32);
        assert_eq!(def.items.len(), 3);
        assert_eq!(def.items[1].value, Value::Int(2));
    }

    #[test]
    fn data_line_symbol_difference() {
        let src = "int32 diff = label_b - label_a";
        let (mut toks, mut syms, itab) = setup(src);
        syms.add("diff");
        let a = syms.add("label_a");
        let b = syms.add("label_b");
        let metas = MetaEnv::new();
        replace_known_names(&mut toks, src, &syms, &itab, &metas);
        let def = parse_data_line(&toks, src, &syms, &itab).unwrap();
        assert_eq!(def.items.len(), 1);
        assert_eq!(def.items[0].sym1, Some(b));
        assert_eq!(def.items[0].sym2, Some(a));
    }

    #[test]
    fn block_structure_predicates() {
        let (toks, ..) = setup("if (r1 > 0) {");
        assert!(opens_block(&toks));
        let (toks, ..) = setup("} else {");
        assert!(starts_with_close(&toks));
        assert!(opens_block(&toks));
    }
}
