//! The assembly session: five passes from source text to a relocatable
//! object file.
//!
//! - **Pass 1** tokenizes the source (after textual `%include` expansion)
//!   and collects declared symbol names so later passes can resolve
//!   forward references.
//! - **Pass 2** classifies each statement, evaluates meta directives, and
//!   replaces known names with symbol or instruction references.
//! - **Pass 3** interprets statements: directives update the section
//!   state, data definitions append bytes, code statements become
//!   abstract codes with an initial format, structured statements lower
//!   through the block stack.
//! - **Pass 4** assigns addresses and re-fits codes until no size
//!   changes. Sizes only grow, so the iteration converges; a generous
//!   bound catches the impossible oscillation case.
//! - **Pass 5** encodes instruction words, pairs tiny codes, writes
//!   section bytes and relocation records, and builds the object file.
//!
//! A statement-level error marks its line and assembly continues; all
//! collected errors are returned together in source order.

#[allow(unused_imports)]
use alloc::format;
use alloc::boxed::Box;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::encoder::{self, Code};
use crate::error::{AsmError, Diagnostics, Pass, Span};
use crate::expr::{Expr, Value};
use crate::hll::Hll;
use crate::ir::{
    Category, LineKind, OperandType, II_ALIGN, II_ANCHOR, II_TABLE, SHF_EXEC, SHF_UNINIT,
};
use crate::itable::InstructionTable;
use crate::lexer::{self, Token, TokenKind};
use crate::object::{ObjectFile, ObjectSection, ObjectSymbol};
use crate::optimize;
use crate::parser::{self, MetaEnv};
use crate::symtab::{
    Binding, NamedRelocation, RelocKind, Relocation, SymbolKind, SymbolTable, SYM_ADDRESS_KNOWN,
    SYM_CONSTANT, SYM_DEFINED, SYM_EXTERNAL, SYM_PUBLIC, SYM_WEAK,
};

/// Configurable resource limits for defense against pathological input.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of statements.
    pub max_statements: usize,
    /// Maximum number of symbols.
    pub max_symbols: usize,
    /// Maximum address-resolution iterations in pass 4.
    pub max_resolve_iterations: usize,
    /// Maximum nesting depth of `%include`.
    pub max_include_depth: usize,
    /// Maximum collected errors.
    pub max_errors: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_statements: 1_000_000,
            max_symbols: 100_000,
            max_resolve_iterations: 64,
            max_include_depth: 16,
            max_errors: 50,
        }
    }
}

/// Callback resolving `%include "name"` to source text.
pub type IncludeResolver = Box<dyn Fn(&str) -> Option<String>>;

/// The result of a successful assembly.
#[derive(Debug, Clone)]
#[must_use]
pub struct AssemblyResult {
    object: ObjectFile,
}

impl AssemblyResult {
    /// The assembled object file.
    #[must_use]
    pub fn object(&self) -> &ObjectFile {
        &self.object
    }

    /// Consume the result, returning the object file.
    #[must_use]
    pub fn into_object(self) -> ObjectFile {
        self.object
    }
}

/// Assembly session: collects source, then runs the passes on `finish`.
pub struct Assembler {
    itab: InstructionTable,
    limits: ResourceLimits,
    source: String,
    include: Option<IncludeResolver>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    /// Create a session with the built-in instruction table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(InstructionTable::builtin())
    }

    /// Create a session with a custom instruction table (e.g. parsed from
    /// an external description).
    #[must_use]
    pub fn with_table(itab: InstructionTable) -> Self {
        Self {
            itab,
            limits: ResourceLimits::default(),
            source: String::new(),
            include: None,
        }
    }

    /// Override the resource limits.
    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    /// Install a resolver for `%include` directives. Without one, any
    /// `%include` is an error (the library performs no file I/O).
    pub fn set_include_resolver(&mut self, resolver: IncludeResolver) {
        self.include = Some(resolver);
    }

    /// Append source text to the session.
    pub fn emit(&mut self, source: &str) {
        self.source.push_str(source);
        if !source.ends_with('\n') {
            self.source.push('\n');
        }
    }

    /// Run all passes and produce the object file.
    ///
    /// # Errors
    ///
    /// Returns every collected diagnostic (in source order) as
    /// [`AsmError::Multiple`], or a single error for resource and
    /// convergence failures.
    pub fn finish(self) -> Result<AssemblyResult, AsmError> {
        let expanded = expand_includes(
            &self.source,
            self.include.as_deref(),
            self.limits.max_include_depth,
        )?;
        let mut session = Session::new(&expanded, &self.itab, &self.limits);
        session.pass1()?;
        session.pass2();
        session.pass3();
        session.pass4();
        let object = session.pass5();
        session.diags.into_result()?;
        Ok(AssemblyResult { object })
    }
}

/// Textually expand `%include "file"` lines through the resolver.
fn expand_includes(
    source: &str,
    resolver: Option<&dyn Fn(&str) -> Option<String>>,
    depth: usize,
) -> Result<String, AsmError> {
    if !source.contains("%include") {
        return Ok(String::from(source));
    }
    if depth == 0 {
        return Err(AsmError::ResourceLimitExceeded {
            resource: String::from("include depth"),
            limit: 0,
        });
    }
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("%include") {
            let name = rest.trim().trim_matches('"');
            let Some(resolver) = resolver else {
                return Err(AsmError::Syntax {
                    msg: String::from("%include requires an include resolver"),
                    span: Span::dummy(),
                });
            };
            let Some(text) = resolver(name) else {
                return Err(AsmError::Syntax {
                    msg: format!("cannot resolve include '{}'", name),
                    span: Span::dummy(),
                });
            };
            out.push_str(&expand_includes(&text, Some(resolver), depth - 1)?);
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

/// One section under assembly.
struct Section {
    name: String,
    flags: u32,
    align: u32,
    /// Initialized data bytes (data sections fill in pass 3, code
    /// sections in pass 5).
    data: Vec<u8>,
    /// Total size; exceeds `data.len()` for uninitialized sections.
    size: u64,
    /// Relocations with symbol-table indices.
    relocs: Vec<Relocation>,
}

struct Session<'a> {
    src: &'a str,
    itab: &'a InstructionTable,
    limits: &'a ResourceLimits,
    diags: Diagnostics,
    tokens: Vec<Token>,
    lines: Vec<crate::ir::Line>,
    syms: SymbolTable,
    metas: MetaEnv,
    hll: Hll,
    codes: Vec<Code>,
    sections: Vec<Section>,
    /// Current section (1-based; 0 = none).
    current_section: u32,
    current_function: Option<u32>,
}

impl<'a> Session<'a> {
    fn new(src: &'a str, itab: &'a InstructionTable, limits: &'a ResourceLimits) -> Self {
        let mut diags = Diagnostics::new();
        diags.set_max_errors(limits.max_errors);
        Self {
            src,
            itab,
            limits,
            diags,
            tokens: Vec::new(),
            lines: Vec::new(),
            syms: SymbolTable::new(),
            metas: MetaEnv::new(),
            hll: Hll::new(),
            codes: Vec::new(),
            sections: Vec::new(),
            current_section: 0,
            current_function: None,
        }
    }

    fn line_tokens(&self, line: &crate::ir::Line) -> &[Token] {
        let a = line.first_token as usize;
        let b = a + line.num_tokens as usize;
        &self.tokens[a..b]
    }

    fn section_mut(&mut self) -> Option<&mut Section> {
        if self.current_section == 0 {
            return None;
        }
        self.sections.get_mut(self.current_section as usize - 1)
    }

    fn in_exec_section(&self) -> bool {
        self.current_section != 0
            && self.sections[self.current_section as usize - 1].flags & SHF_EXEC != 0
    }

    // ─── Pass 1 ─────────────────────────────────────────────────────

    /// Tokenize and collect declared names.
    fn pass1(&mut self) -> Result<(), AsmError> {
        let ts = lexer::tokenize(self.src, 0);
        for e in ts.errors {
            self.diags.report(e, Pass::Tokenize);
        }
        self.tokens = ts.tokens;
        self.lines = ts.lines;
        if self.lines.len() > self.limits.max_statements {
            return Err(AsmError::ResourceLimitExceeded {
                resource: String::from("statements"),
                limit: self.limits.max_statements,
            });
        }
        // Collect declared names: labels, data definitions, extern and
        // public declarations. Forward references then resolve in pass 2.
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            let toks = self.line_tokens(&line).to_vec();
            // Leading labels do not change what the line declares.
            let body = toks
                .iter()
                .position(|t| t.kind != TokenKind::Label)
                .unwrap_or(toks.len());
            for (i, tok) in toks.iter().enumerate() {
                match &tok.kind {
                    TokenKind::Label => {
                        let text = tok.text(self.src);
                        let name = text.strip_suffix(':').unwrap_or(text);
                        self.syms.add(name);
                    }
                    TokenKind::Name => {
                        let declares = match toks.get(body).map(|t| &t.kind) {
                            // `type name = …` data definition.
                            Some(TokenKind::Type { .. }) => i == body + 1,
                            // `public a, b` / `extern a: …`.
                            Some(TokenKind::Directive(
                                lexer::Directive::Public | lexer::Directive::Extern,
                            )) => i > body,
                            _ => false,
                        };
                        if declares {
                            self.syms.add(tok.text(self.src));
                        }
                    }
                    _ => {}
                }
            }
            if self.syms.len() > self.limits.max_symbols {
                return Err(AsmError::ResourceLimitExceeded {
                    resource: String::from("symbols"),
                    limit: self.limits.max_symbols,
                });
            }
        }
        Ok(())
    }

    // ─── Pass 2 ─────────────────────────────────────────────────────

    /// Classify lines, process meta directives, resolve known names.
    fn pass2(&mut self) {
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            let range = line.first_token as usize..(line.first_token + line.num_tokens) as usize;
            let kind = parser::classify(&self.tokens[range.clone()]);
            if kind == LineKind::MetaDef {
                let toks = self.tokens[range.clone()].to_vec();
                if let Err(e) = self.metas.process(&toks, self.src, &self.syms, self.itab) {
                    self.diags.report(e, Pass::Classify);
                    self.lines[li].kind = LineKind::Error;
                    continue;
                }
                self.lines[li].kind = LineKind::MetaDef;
                continue;
            }
            if !self.metas.active() {
                self.lines[li].kind = LineKind::Skipped;
                continue;
            }
            self.lines[li].kind = kind;
            let (src, syms, itab, metas) = (self.src, &self.syms, self.itab, &self.metas);
            parser::replace_known_names(&mut self.tokens[range], src, syms, itab, metas);
        }
        if self.metas.unclosed_conditional() {
            self.diags.report(
                AsmError::Syntax {
                    msg: String::from("%if without matching %endif"),
                    span: Span::dummy(),
                },
                Pass::Classify,
            );
        }
    }

    // ─── Pass 3 ─────────────────────────────────────────────────────

    /// Interpret statements: directives, data, code.
    fn pass3(&mut self) {
        for li in 0..self.lines.len() {
            let line = self.lines[li];
            if let Err(e) = self.interpret_line(li, line) {
                self.diags.report(e, Pass::Generate);
                self.lines[li].kind = LineKind::Error;
            }
        }
        if self.hll.open_blocks() > 0 {
            self.diags.report(
                AsmError::UnmatchedBracket {
                    bracket: '{',
                    span: Span::dummy(),
                },
                Pass::Generate,
            );
        }
    }

    fn interpret_line(&mut self, li: usize, line: crate::ir::Line) -> Result<(), AsmError> {
        match line.kind {
            LineKind::Section => self.interpret_section(line),
            LineKind::Function => self.interpret_function(line),
            LineKind::EndDir => self.interpret_end(),
            LineKind::PublicDef => self.interpret_public_or_extern(line),
            LineKind::DataDef => self.interpret_data(line),
            LineKind::CodeDef => self.interpret_code(li, line),
            _ => Ok(()),
        }
    }

    fn interpret_section(&mut self, line: crate::ir::Line) -> Result<(), AsmError> {
        let toks = self.line_tokens(&line).to_vec();
        let def = parser::parse_section_line(&toks, self.src)?;
        // Re-entering an existing section continues it.
        let existing = self
            .sections
            .iter()
            .position(|s| s.name == def.name)
            .map(|i| i as u32 + 1);
        let index = match existing {
            Some(i) => i,
            None => {
                self.sections.push(Section {
                    name: def.name.clone(),
                    flags: def.flags,
                    align: def.align.max(4),
                    data: Vec::new(),
                    size: 0,
                    relocs: Vec::new(),
                });
                let index = self.sections.len() as u32;
                // The section name is itself a symbol.
                let si = self.syms.add(&def.name);
                let sym = self.syms.get_mut(si);
                sym.kind = SymbolKind::Section;
                sym.section = index;
                sym.flags |= SYM_DEFINED | SYM_ADDRESS_KNOWN;
                index
            }
        };
        self.current_section = index;
        Ok(())
    }

    fn interpret_function(&mut self, line: crate::ir::Line) -> Result<(), AsmError> {
        let toks = self.line_tokens(&line).to_vec();
        let span = toks[0].span;
        if !self.in_exec_section() {
            return Err(AsmError::Syntax {
                msg: String::from("function directive outside an executable section"),
                span,
            });
        }
        let name = match toks.get(1).map(|t| (t, &t.kind)) {
            Some((t, TokenKind::Label)) => {
                let text = t.text(self.src);
                String::from(text.strip_suffix(':').unwrap_or(text))
            }
            Some((t, TokenKind::Name | TokenKind::SymbolRef(_))) => String::from(t.text(self.src)),
            _ => {
                return Err(AsmError::Syntax {
                    msg: String::from("function directive needs a name"),
                    span,
                })
            }
        };
        let idx = self.syms.add(&name);
        self.syms.get_mut(idx).kind = SymbolKind::Function;
        self.current_function = Some(idx);
        self.define_label_here(idx, span)?;
        // `function f: public f` carries the visibility on the same
        // statement.
        if let Some(TokenKind::Directive(lexer::Directive::Public)) =
            toks.get(2).map(|t| &t.kind)
        {
            for name in parser::parse_public_line(&toks[2..], self.src)? {
                let idx = self.syms.add(&name);
                let sym = self.syms.get_mut(idx);
                sym.flags |= SYM_PUBLIC;
                sym.binding = Binding::Global;
            }
        } else if toks.len() > 2 {
            return Err(AsmError::Syntax {
                msg: String::from("unexpected tokens after function name"),
                span,
            });
        }
        Ok(())
    }

    fn interpret_end(&mut self) -> Result<(), AsmError> {
        if self.hll.open_blocks() > 0 {
            return Err(AsmError::UnmatchedBracket {
                bracket: '{',
                span: Span::dummy(),
            });
        }
        if self.current_function.take().is_none() {
            self.current_section = 0;
        }
        Ok(())
    }

    fn interpret_public_or_extern(&mut self, line: crate::ir::Line) -> Result<(), AsmError> {
        let toks = self.line_tokens(&line).to_vec();
        match toks.first().map(|t| &t.kind) {
            Some(TokenKind::Directive(lexer::Directive::Public)) => {
                for name in parser::parse_public_line(&toks, self.src)? {
                    let idx = self.syms.add(&name);
                    let sym = self.syms.get_mut(idx);
                    sym.flags |= SYM_PUBLIC;
                    sym.binding = Binding::Global;
                }
                Ok(())
            }
            _ => {
                for def in parser::parse_extern_line(&toks, self.src)? {
                    let idx = self.syms.add(&def.name);
                    let sym = self.syms.get_mut(idx);
                    sym.flags |= SYM_EXTERNAL;
                    if def.constant {
                        sym.flags |= SYM_CONSTANT;
                    }
                    sym.binding = Binding::Global;
                    // Externals live in no section of this module.
                    sym.section = 0;
                }
                Ok(())
            }
        }
    }

    /// Define `sym` at the current emission position.
    fn define_label_here(&mut self, sym: u32, span: Span) -> Result<(), AsmError> {
        if self.in_exec_section() {
            // Code addresses settle in pass 4: place an anchor.
            if !self.syms.define(sym, self.current_section, 0) {
                return Err(AsmError::DuplicateDefinition {
                    name: String::from(self.syms.name_of(sym)),
                    span,
                });
            }
            let code = Code {
                id: II_ANCHOR,
                label: Some(sym),
                section: self.current_section,
                span,
                ..Code::default()
            };
            self.push_code(code);
            Ok(())
        } else {
            let section = self.current_section;
            let Some(sec) = self.section_mut() else {
                return Err(AsmError::Syntax {
                    msg: String::from("label outside a section"),
                    span,
                });
            };
            let offset = if sec.flags & SHF_UNINIT != 0 {
                sec.size
            } else {
                sec.data.len() as u64
            };
            if !self.syms.define(sym, section, offset as i64) {
                return Err(AsmError::DuplicateDefinition {
                    name: String::from(self.syms.name_of(sym)),
                    span,
                });
            }
            self.syms.get_mut(sym).flags |= SYM_ADDRESS_KNOWN;
            Ok(())
        }
    }

    /// Route a code into the active sink (switch side buffer or the main
    /// stream), applying the jump-merge peephole at the insertion point.
    fn push_code(&mut self, mut code: Code) {
        code.section = self.current_section;
        let itab = self.itab;
        let sink: &mut Vec<Code> = match self.hll.buffer_mut() {
            Some(buf) => buf,
            None => &mut self.codes,
        };
        if crate::ir::is_jump_id(code.id) {
            if let Some(prev) = sink.last() {
                if prev.section == code.section {
                    if let Some(fused) = optimize::merge_jump(prev, &code, itab) {
                        sink.pop();
                        code = fused;
                    }
                }
            }
        }
        sink.push(code);
    }

    fn interpret_data(&mut self, line: crate::ir::Line) -> Result<(), AsmError> {
        let full = self.line_tokens(&line).to_vec();
        let span = full[0].span;
        if self.current_section == 0 {
            return Err(AsmError::Syntax {
                msg: String::from("data definition outside a section"),
                span,
            });
        }
        // Leading labels define at the current position.
        let mut at = 0;
        while let Some(tok) = full.get(at) {
            if tok.kind != TokenKind::Label {
                break;
            }
            let text = tok.text(self.src);
            let name = text.strip_suffix(':').unwrap_or(text);
            let idx = self.syms.add(name);
            self.define_label_here(idx, tok.span)?;
            at += 1;
        }
        let toks = &full[at..];
        if self.in_exec_section() {
            // Data in a code section (jump tables and the like) flows
            // through the code stream so addresses stay consistent.
            return self.interpret_data_in_code(toks, span);
        }
        let def = parser::parse_data_line(toks, self.src, &self.syms, self.itab)?;
        let elem = def.ty.size_bytes() as u64;
        let section = self.current_section;
        let uninit = {
            let sec = &self.sections[section as usize - 1];
            sec.flags & SHF_UNINIT != 0
        };

        // Align the element and define the name.
        {
            let sec = &mut self.sections[section as usize - 1];
            if uninit {
                sec.size = sec.size.div_ceil(elem) * elem;
            } else {
                while sec.data.len() as u64 % elem != 0 {
                    sec.data.push(0);
                }
            }
        }
        if let Some(name) = def.name {
            let offset = {
                let sec = &self.sections[section as usize - 1];
                if uninit {
                    sec.size
                } else {
                    sec.data.len() as u64
                }
            };
            if !self.syms.define(name, section, offset as i64) {
                return Err(AsmError::DuplicateDefinition {
                    name: String::from(self.syms.name_of(name)),
                    span,
                });
            }
            let sym = self.syms.get_mut(name);
            sym.flags |= SYM_ADDRESS_KNOWN;
            sym.kind = SymbolKind::Object;
            sym.size = elem * def.items.len().max(1) as u64;
        }

        if uninit {
            if !def.items.is_empty() {
                return Err(AsmError::Syntax {
                    msg: String::from("uninitialized section cannot hold initializers"),
                    span,
                });
            }
            self.sections[section as usize - 1].size += elem;
            return Ok(());
        }
        if def.items.is_empty() {
            // Bare reservation: one zero element.
            let sec = &mut self.sections[section as usize - 1];
            sec.data.extend(core::iter::repeat(0).take(elem as usize));
            sec.size = sec.data.len() as u64;
            return Ok(());
        }
        for item in &def.items {
            self.emit_data_item(section, def.ty, item)?;
        }
        let sec = &mut self.sections[section as usize - 1];
        sec.size = sec.data.len() as u64;
        Ok(())
    }

    /// A data definition inside an executable section: word-multiple
    /// items carried as pseudo-codes.
    fn interpret_data_in_code(&mut self, toks: &[Token], span: Span) -> Result<(), AsmError> {
        let def = parser::parse_data_line(toks, self.src, &self.syms, self.itab)?;
        let elem = def.ty.size_bytes();
        if elem % 4 != 0 {
            return Err(AsmError::TypeMismatch {
                detail: String::from("data in a code section must be word-sized"),
                span,
            });
        }
        if let Some(name) = def.name {
            self.define_label_here(name, span)?;
        }
        for item in &def.items {
            let mut code = Code {
                id: crate::ir::II_DATA,
                dtype: Some(def.ty),
                size: (elem / 4) as u8,
                span,
                ..Code::default()
            };
            if let Some(sym) = item.sym1 {
                code.imm = Value::Int(item.value.as_int().unwrap_or(0));
                code.imm_sym = Some(sym);
                code.imm_ref = item.sym2;
                code.imm_scale = item.symscale;
            } else {
                match &item.value {
                    Value::Int(_) | Value::Float(_) => code.imm = item.value.clone(),
                    _ => {
                        return Err(AsmError::TypeMismatch {
                            detail: String::from("unsupported initializer in code section"),
                            span,
                        })
                    }
                }
            }
            self.push_code(code);
        }
        Ok(())
    }

    /// Append one evaluated initializer to a section.
    fn emit_data_item(
        &mut self,
        section: u32,
        ty: OperandType,
        item: &Expr,
    ) -> Result<(), AsmError> {
        let span = item.span;
        let elem = ty.size_bytes() as usize;
        // Symbol references become relocations with the addend stored.
        if let Some(sym) = item.sym1 {
            let addend = item.value.as_int().unwrap_or(0);
            let sec = &mut self.sections[section as usize - 1];
            let offset = sec.data.len() as u32;
            let kind = match item.sym2 {
                Some(_) => RelocKind::Diff {
                    size: elem as u8,
                    scale: item.symscale.max(1),
                },
                None => RelocKind::Abs { size: elem as u8 },
            };
            sec.relocs.push(Relocation {
                section,
                offset,
                symbol: sym,
                addend,
                kind,
                ref_sym: item.sym2,
            });
            sec.data
                .extend_from_slice(&addend.to_le_bytes()[..elem.min(8)]);
            if elem > 8 {
                sec.data.extend(core::iter::repeat(0).take(elem - 8));
            }
            return Ok(());
        }
        match &item.value {
            Value::Int(v) => {
                if let Some((lo, hi)) = ty.int_range() {
                    let ok = if ty.is_unsigned() {
                        // Accept the two's-complement spelling of the value.
                        (*v >= lo && *v <= hi) || (*v < 0 && -*v <= hi / 2 + 1)
                    } else {
                        *v >= lo && *v <= hi
                    };
                    if !ok {
                        return Err(AsmError::ImmediateOverflow {
                            value: *v,
                            dtype: ty.name(),
                            span,
                        });
                    }
                }
                if ty.is_float() {
                    return self.emit_float_item(section, ty, *v as f64, span);
                }
                let sec = &mut self.sections[section as usize - 1];
                sec.data.extend_from_slice(&v.to_le_bytes()[..elem.min(8)]);
                if elem > 8 {
                    let fill = if *v < 0 { 0xFF } else { 0 };
                    sec.data.extend(core::iter::repeat(fill).take(elem - 8));
                }
                Ok(())
            }
            Value::Float(x) => {
                if !ty.is_float() {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("float initializer on an integer type"),
                        span,
                    });
                }
                self.emit_float_item(section, ty, *x, span)
            }
            Value::Str(s) => {
                if ty.size_bytes() != 1 {
                    return Err(AsmError::TypeMismatch {
                        detail: String::from("string initializer requires int8"),
                        span,
                    });
                }
                let sec = &mut self.sections[section as usize - 1];
                sec.data.extend_from_slice(s.as_bytes());
                Ok(())
            }
            Value::None => Err(AsmError::TypeMismatch {
                detail: String::from("initializer has no value"),
                span,
            }),
        }
    }

    fn emit_float_item(
        &mut self,
        section: u32,
        ty: OperandType,
        x: f64,
        span: Span,
    ) -> Result<(), AsmError> {
        let sec = &mut self.sections[section as usize - 1];
        match ty {
            OperandType::Float16 => {
                sec.data
                    .extend_from_slice(&encoder::f64_to_f16(x).to_le_bytes());
            }
            OperandType::Float32 => {
                sec.data.extend_from_slice(&(x as f32).to_bits().to_le_bytes());
            }
            OperandType::Float64 => {
                sec.data.extend_from_slice(&x.to_bits().to_le_bytes());
            }
            OperandType::Float128 => {
                sec.data.extend_from_slice(&x.to_bits().to_le_bytes());
                sec.data.extend(core::iter::repeat(0).take(8));
            }
            _ => {
                return Err(AsmError::TypeMismatch {
                    detail: String::from("not a float type"),
                    span,
                })
            }
        }
        Ok(())
    }

    fn interpret_code(&mut self, li: usize, line: crate::ir::Line) -> Result<(), AsmError> {
        let toks = self.line_tokens(&line).to_vec();
        let span = toks.first().map_or_else(Span::dummy, |t| t.span);

        // Leading labels become anchors (or data symbols).
        let mut rest = &toks[..];
        while let Some(tok) = rest.first() {
            if tok.kind != TokenKind::Label {
                break;
            }
            let text = tok.text(self.src);
            let name = text.strip_suffix(':').unwrap_or(text);
            let idx = self.syms.add(name);
            self.define_label_here(idx, tok.span)?;
            rest = &rest[1..];
        }
        if rest.is_empty() {
            return Ok(());
        }

        // Alignment applies to the current section, code or data.
        if matches!(
            rest.first().map(|t| &t.kind),
            Some(TokenKind::Attribute(lexer::Attribute::Align))
        ) {
            let code = parser::parse_code_line(rest, self.src, &self.syms, self.itab)?;
            let align = code.imm.as_int().unwrap_or(4) as u64;
            if self.in_exec_section() {
                self.push_code(Code {
                    id: II_ALIGN,
                    imm: Value::Int(align as i64),
                    span,
                    ..Code::default()
                });
            } else if let Some(sec) = self.section_mut() {
                sec.align = sec.align.max(align as u32);
                if sec.flags & SHF_UNINIT != 0 {
                    sec.size = sec.size.div_ceil(align) * align;
                } else {
                    while sec.data.len() as u64 % align != 0 {
                        sec.data.push(0);
                    }
                    sec.size = sec.data.len() as u64;
                }
            } else {
                return Err(AsmError::Syntax {
                    msg: String::from("align outside a section"),
                    span,
                });
            }
            return Ok(());
        }

        if !self.in_exec_section() {
            return Err(AsmError::Syntax {
                msg: String::from("code outside an executable section"),
                span,
            });
        }

        if Hll::handles(rest) {
            let src = self.src;
            let itab = self.itab;
            let out = {
                let Session { hll, syms, .. } = self;
                hll.statement(rest, src, syms, itab)?
            };
            for code in out {
                self.push_code(code);
            }
            return Ok(());
        }

        let mut code = parser::parse_code_line(rest, self.src, &self.syms, self.itab)?;
        code.line = li as u32;
        optimize::optimize_code(&mut code, self.itab);
        code.section = self.current_section;
        // Initial, optimistic format choice.
        if let Err(cause) = encoder::fit_code(&mut code, self.itab, &self.syms) {
            let mnemonic = String::from(self.itab.get(code.instr).name.as_str());
            return Err(AsmError::NoFormatFits {
                mnemonic,
                cause,
                span,
            });
        }
        self.push_code(code);
        Ok(())
    }

    // ─── Pass 4 ─────────────────────────────────────────────────────

    /// Assign addresses and re-fit until stable. Sizes are monotone, so
    /// the loop converges; the bound catches the unreachable oscillation.
    fn pass4(&mut self) {
        let mut iterations = 0;
        loop {
            iterations += 1;
            if iterations > self.limits.max_resolve_iterations {
                self.diags.report(
                    AsmError::ConvergenceLimit {
                        max: self.limits.max_resolve_iterations,
                    },
                    Pass::Resolve,
                );
                return;
            }
            let mut changed = false;

            // Lay out addresses per section, defining labels as we go.
            let mut offsets: Vec<u64> =
                self.sections.iter().map(|_| 0u64).collect();
            let mut i = 0;
            while i < self.codes.len() {
                let section = self.codes[i].section;
                if section == 0 {
                    i += 1;
                    continue;
                }
                let addr = &mut offsets[section as usize - 1];
                let code = &self.codes[i];
                match code.id {
                    II_ANCHOR => {
                        if let Some(label) = code.label {
                            let sym = self.syms.get_mut(label);
                            let value = *addr as i64;
                            if sym.value != value || sym.flags & SYM_ADDRESS_KNOWN == 0 {
                                sym.value = value;
                                sym.flags |= SYM_DEFINED | SYM_ADDRESS_KNOWN;
                                changed = true;
                            }
                            sym.section = section;
                        }
                        self.codes[i].address = *addr as u32;
                        i += 1;
                    }
                    II_ALIGN => {
                        let align = self.codes[i].imm.as_int().unwrap_or(4) as u64;
                        *addr = addr.div_ceil(align) * align;
                        self.codes[i].address = *addr as u32;
                        i += 1;
                    }
                    II_TABLE | crate::ir::II_DATA => {
                        self.codes[i].address = *addr as u32;
                        if let Some(label) = self.codes[i].label {
                            let value = *addr as i64;
                            let sym = self.syms.get_mut(label);
                            if sym.value != value || sym.flags & SYM_ADDRESS_KNOWN == 0 {
                                sym.value = value;
                                sym.flags |= SYM_DEFINED | SYM_ADDRESS_KNOWN;
                                changed = true;
                            }
                            sym.section = section;
                        }
                        *addr += u64::from(self.codes[i].size) * 4;
                        i += 1;
                    }
                    _ if self.codes[i].category == Some(Category::Tiny) => {
                        // A tiny pairs with a directly following tiny of
                        // the same section; an anchor in between splits
                        // the pair.
                        self.codes[i].address = *addr as u32;
                        let paired = self
                            .codes
                            .get(i + 1)
                            .filter(|n| {
                                n.section == section
                                    && n.category == Some(Category::Tiny)
                                    && n.id != II_ANCHOR
                            })
                            .is_some();
                        if paired {
                            self.codes[i + 1].address = *addr as u32;
                            i += 2;
                        } else {
                            i += 1;
                        }
                        *addr += 4;
                    }
                    _ => {
                        self.codes[i].address = *addr as u32;
                        let before = self.codes[i].size;
                        let mut code = self.codes[i].clone();
                        if let Err(cause) = encoder::fit_code(&mut code, self.itab, &self.syms) {
                            let mnemonic =
                                String::from(self.itab.get(code.instr).name.as_str());
                            let span = code.span;
                            self.diags.report(
                                AsmError::NoFormatFits {
                                    mnemonic,
                                    cause,
                                    span,
                                },
                                Pass::Resolve,
                            );
                            // Keep the old size so layout stays defined.
                            i += 1;
                            *addr += u64::from(before.max(1)) * 4;
                            continue;
                        }
                        if code.size != before {
                            changed = true;
                        }
                        *addr += code.byte_size() as u64;
                        self.codes[i] = code;
                        i += 1;
                    }
                }
            }

            // Record executable section sizes.
            for (si, sec) in self.sections.iter_mut().enumerate() {
                if sec.flags & SHF_EXEC != 0 {
                    sec.size = offsets[si];
                }
            }
            if !changed {
                return;
            }
        }
    }

    // ─── Pass 5 ─────────────────────────────────────────────────────

    /// Encode instruction words, write relocations, build the object.
    fn pass5(&mut self) -> ObjectFile {
        // Emit code bytes per section in code order.
        let mut i = 0;
        while i < self.codes.len() {
            let code = &self.codes[i];
            let section = code.section;
            if section == 0 {
                i += 1;
                continue;
            }
            match code.id {
                II_ANCHOR => {
                    i += 1;
                }
                II_ALIGN => {
                    let target = code.address as usize;
                    let sec = &mut self.sections[section as usize - 1];
                    while sec.data.len() < target {
                        sec.data.push(0);
                    }
                    i += 1;
                }
                II_TABLE => {
                    let base = code.label;
                    let entries = code.table.clone();
                    let address = code.address;
                    let sec = &mut self.sections[section as usize - 1];
                    for (n, &entry) in entries.iter().enumerate() {
                        let offset = address + n as u32 * 4;
                        sec.relocs.push(Relocation {
                            section,
                            offset,
                            symbol: entry,
                            addend: 0,
                            kind: RelocKind::Diff { size: 4, scale: 4 },
                            ref_sym: base,
                        });
                        sec.data.extend_from_slice(&0u32.to_le_bytes());
                    }
                    i += 1;
                }
                crate::ir::II_DATA => {
                    let address = code.address;
                    let bytes = u32::from(code.size) * 4;
                    let imm = code.imm.clone();
                    let imm_sym = code.imm_sym;
                    let imm_ref = code.imm_ref;
                    let imm_scale = code.imm_scale;
                    let dtype = code.dtype;
                    let sec = &mut self.sections[section as usize - 1];
                    if let Some(sym) = imm_sym {
                        let addend = imm.as_int().unwrap_or(0);
                        sec.relocs.push(Relocation {
                            section,
                            offset: address,
                            symbol: sym,
                            addend,
                            kind: match imm_ref {
                                Some(_) => RelocKind::Diff {
                                    size: bytes as u8,
                                    scale: imm_scale.max(1),
                                },
                                None => RelocKind::Abs { size: bytes as u8 },
                            },
                            ref_sym: imm_ref,
                        });
                        sec.data
                            .extend_from_slice(&addend.to_le_bytes()[..(bytes as usize).min(8)]);
                        for _ in 8..bytes as usize {
                            sec.data.push(0);
                        }
                    } else {
                        match imm {
                            Value::Float(x) if dtype == Some(OperandType::Float32) => {
                                sec.data.extend_from_slice(&(x as f32).to_bits().to_le_bytes());
                            }
                            Value::Float(x) => {
                                sec.data.extend_from_slice(&x.to_bits().to_le_bytes());
                            }
                            other => {
                                let v = other.as_int().unwrap_or(0);
                                sec.data.extend_from_slice(
                                    &v.to_le_bytes()[..(bytes as usize).min(8)],
                                );
                                let fill = if v < 0 { 0xFF } else { 0 };
                                for _ in 8..bytes as usize {
                                    sec.data.push(fill);
                                }
                            }
                        }
                    }
                    i += 1;
                }
                _ if code.category == Some(Category::Tiny) => {
                    let enc1 = encoder::encode_code(code, self.itab, &self.syms);
                    let slot1 = enc1.tiny.unwrap_or(0);
                    let paired = self
                        .codes
                        .get(i + 1)
                        .filter(|n| {
                            n.section == section && n.category == Some(Category::Tiny)
                        })
                        .is_some();
                    let slot2 = if paired {
                        let enc2 =
                            encoder::encode_code(&self.codes[i + 1], self.itab, &self.syms);
                        i += 1;
                        enc2.tiny.unwrap_or(0)
                    } else {
                        // Unpaired tiny: fill the second slot with nop.
                        0
                    };
                    let word = crate::format::pack_tiny_pair(slot1, slot2);
                    let sec = &mut self.sections[section as usize - 1];
                    sec.data.extend_from_slice(&word.to_le_bytes());
                    i += 1;
                }
                _ => {
                    let enc = encoder::encode_code(code, self.itab, &self.syms);
                    let address = code.address;
                    let sec = &mut self.sections[section as usize - 1];
                    for r in &enc.relocs {
                        sec.relocs.push(Relocation {
                            section,
                            offset: address + u32::from(r.offset),
                            symbol: r.symbol,
                            addend: r.addend,
                            kind: r.kind,
                            ref_sym: r.ref_sym,
                        });
                    }
                    for w in 0..enc.len {
                        sec.data
                            .extend_from_slice(&enc.words[w as usize].to_le_bytes());
                    }
                    i += 1;
                }
            }
        }

        // Undefined referenced symbols that were never declared extern.
        for (si, sec) in self.sections.iter().enumerate() {
            for r in &sec.relocs {
                let sym = self.syms.get(r.symbol);
                if sym.flags & (SYM_DEFINED | SYM_EXTERNAL) == 0 {
                    let _ = si;
                    self.diags.report(
                        AsmError::UndefinedSymbol {
                            name: String::from(self.syms.name_of(r.symbol)),
                            span: Span::dummy(),
                        },
                        Pass::Emit,
                    );
                }
            }
        }

        // Keep public, external, weak, and relocation-referenced symbols.
        let mut keep: Vec<bool> = self
            .syms
            .symbols()
            .iter()
            .map(|s| s.flags & (SYM_PUBLIC | SYM_EXTERNAL | SYM_WEAK) != 0)
            .collect();
        for sec in &self.sections {
            for r in &sec.relocs {
                keep[r.symbol as usize] = true;
                if let Some(rs) = r.ref_sym {
                    keep[rs as usize] = true;
                }
            }
        }

        let mut object = ObjectFile::default();
        for sec in &self.sections {
            object.sections.push(ObjectSection {
                name: sec.name.clone(),
                flags: sec.flags,
                align: sec.align,
                data: if sec.flags & SHF_UNINIT != 0 {
                    Vec::new()
                } else {
                    sec.data.clone()
                },
                size: sec.size.max(sec.data.len() as u64),
            });
        }
        for (idx, sym) in self.syms.symbols().iter().enumerate() {
            if !keep[idx] {
                continue;
            }
            let binding = if sym.flags & SYM_WEAK != 0 {
                Binding::Weak
            } else if sym.flags & (SYM_PUBLIC | SYM_EXTERNAL) != 0 {
                Binding::Global
            } else {
                Binding::Local
            };
            object.symbols.push(ObjectSymbol {
                name: String::from(self.syms.names.get(sym.name)),
                section: if sym.flags & SYM_DEFINED != 0 {
                    sym.section
                } else {
                    0
                },
                value: sym.value,
                size: sym.size,
                binding,
                kind: sym.kind,
                constant: sym.flags & SYM_CONSTANT != 0,
            });
        }
        for sec in &self.sections {
            for r in &sec.relocs {
                object.relocations.push(NamedRelocation {
                    section: r.section,
                    offset: r.offset,
                    symbol: String::from(self.syms.name_of(r.symbol)),
                    addend: r.addend,
                    kind: r.kind,
                    ref_sym: r.ref_sym.map(|s| String::from(self.syms.name_of(s))),
                });
            }
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_ok(src: &str) -> ObjectFile {
        let mut asm = Assembler::new();
        asm.emit(src);
        asm.finish().expect("assembly should succeed").into_object()
    }

    fn assemble_err(src: &str) -> AsmError {
        let mut asm = Assembler::new();
        asm.emit(src);
        asm.finish().expect_err("assembly should fail")
    }

    #[test]
    fn minimal_function() {
        let obj = assemble_ok(
            "section code execute\nfunction f: public f\nint32 r1 = r2 + 1\nreturn\nend\n",
        );
        assert_eq!(obj.sections.len(), 1);
        let sec = &obj.sections[0];
        assert_ne!(sec.flags & SHF_EXEC, 0);
        // add-immediate (1 word) + return (1 word).
        assert_eq!(sec.data.len(), 8);
        let f = obj.find_symbol("f").expect("public symbol");
        assert_eq!(f.section, 1);
        assert_eq!(f.value, 0);
        assert_eq!(f.binding, Binding::Global);
    }

    #[test]
    fn semicolons_separate_statements() {
        let obj = assemble_ok("section code execute; function f: public f; return; end");
        assert_eq!(obj.sections[0].data.len(), 4);
    }

    #[test]
    fn data_section_with_values() {
        let obj = assemble_ok("section data read write\nint32 tab = 1, 2, 3\nend\n");
        let sec = &obj.sections[0];
        assert_eq!(sec.data.len(), 12);
        assert_eq!(&sec.data[0..4], &1i32.to_le_bytes());
        assert_eq!(&sec.data[8..12], &3i32.to_le_bytes());
    }

    #[test]
    fn data_overflow_reports_and_continues() {
        let err = assemble_err(
            "section data read write\nint8 x = 1000\nint8 y = 2\nend\n",
        );
        match err {
            AsmError::Multiple { errors } => {
                assert!(matches!(
                    errors[0],
                    AsmError::ImmediateOverflow { value: 1000, dtype: "int8", .. }
                ));
            }
            other => panic!("expected Multiple, got {:?}", other),
        }
    }

    #[test]
    fn symbol_difference_relocation() {
        let obj = assemble_ok(
            "section data read write\nlabel_a:\nint32 a = 1\nlabel_b:\nint32 b = 2\nint32 diff = label_b - label_a\nend\n",
        );
        let reloc = obj
            .relocations
            .iter()
            .find(|r| matches!(r.kind, RelocKind::Diff { .. }))
            .expect("difference relocation");
        assert_eq!(reloc.symbol, "label_b");
        assert_eq!(reloc.ref_sym.as_deref(), Some("label_a"));
        assert!(matches!(reloc.kind, RelocKind::Diff { size: 4, scale: 1 }));
    }

    #[test]
    fn forward_branch_grows_to_sixteen_bit_displacement() {
        // A body long enough to push the target outside the 8-bit word
        // displacement.
        let mut src = String::from("section code execute\nfunction f:\nif (r1 > 0) {\n");
        for _ in 0..200 {
            src.push_str("int32 r2 = r2 + 1\n");
        }
        src.push_str("}\nreturn\nend\n");
        let obj = assemble_ok(&src);
        let sec = &obj.sections[0];
        // First instruction is the inverted conditional jump; it must have
        // grown to the two-word 16-bit-displacement format (il = 2).
        let w0 = u32::from_le_bytes([sec.data[0], sec.data[1], sec.data[2], sec.data[3]]);
        assert_eq!(crate::format::il(w0), 2);
        // Displacement reaches past the 200-instruction body.
        let disp = i64::from(u32::from_le_bytes([
            sec.data[4],
            sec.data[5],
            sec.data[6],
            sec.data[7],
        ]) as u16 as i16);
        assert!(disp > 120, "disp = {}", disp);
    }

    #[test]
    fn short_backward_branch_stays_one_word() {
        let obj = assemble_ok(
            "section code execute\nfunction f:\nloop_top:\nint32 r1 = r1 - 1\njump loop_top\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        // sub(1 word) + jump(1 word) + return(1 word).
        assert_eq!(sec.data.len(), 12);
        let w_jump = u32::from_le_bytes([sec.data[4], sec.data[5], sec.data[6], sec.data[7]]);
        assert_eq!(crate::format::il(w_jump), 1);
        // Backward displacement of -2 words in the 24-bit field.
        assert_eq!(w_jump & 0xFF_FFFF, 0xFF_FFFE);
    }

    #[test]
    fn external_call_emits_relocation() {
        let obj = assemble_ok(
            "section code execute\nextern callee:\nfunction f:\ncall callee\nreturn\nend\n",
        );
        let reloc = obj
            .relocations
            .iter()
            .find(|r| r.symbol == "callee")
            .expect("call relocation");
        assert!(matches!(reloc.kind, RelocKind::Rel { size: 4, scale: 4 }));
        let callee = obj.find_symbol("callee").unwrap();
        assert_eq!(callee.section, 0, "external symbol stays undefined");
    }

    #[test]
    fn undefined_symbol_reported() {
        let err = assemble_err("section code execute\nfunction f:\njump nowhere\nreturn\nend\n");
        let text = format!("{}", err);
        assert!(text.contains("nowhere"), "{}", text);
    }

    #[test]
    fn tiny_push_pop_pair_into_one_word() {
        let obj = assemble_ok(
            "section code execute\nfunction f:\npush r1\npush r2\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        // Two pushes pack into one tiny pair word, then return.
        assert_eq!(sec.data.len(), 8);
        let w0 = u32::from_le_bytes([sec.data[0], sec.data[1], sec.data[2], sec.data[3]]);
        assert!(crate::format::is_tiny_pair(w0));
    }

    #[test]
    fn label_splits_tiny_pair() {
        let obj = assemble_ok(
            "section code execute\nfunction f:\npush r1\nmid: push r2\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        // The label forces two separate (half-empty) tiny words.
        assert_eq!(sec.data.len(), 12);
    }

    #[test]
    fn meta_conditionals_select_code() {
        let obj = assemble_ok(
            "%wide = 1\nsection code execute\nfunction f:\n%if wide\nint64 r1 = r2 + 1\n%else\nint32 r1 = r2 + 1\n%endif\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        let w0 = u32::from_le_bytes([sec.data[0], sec.data[1], sec.data[2], sec.data[3]]);
        // ot field carries int64 (3).
        assert_eq!(crate::format::ot(w0), 3);
    }

    #[test]
    fn alignment_pads_code() {
        let obj = assemble_ok(
            "section code execute\nfunction f:\nreturn\nalign 16\nlate:\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        assert_eq!(sec.data.len(), 20);
        // Padding words are zero.
        assert_eq!(&sec.data[4..16], &[0u8; 12]);
    }

    #[test]
    fn resource_limit_statements() {
        let mut asm = Assembler::new();
        let mut limits = ResourceLimits::default();
        limits.max_statements = 2;
        asm.set_limits(limits);
        asm.emit("section code execute\nfunction f:\nreturn\nend\n");
        assert!(matches!(
            asm.finish(),
            Err(AsmError::ResourceLimitExceeded { .. })
        ));
    }

    #[test]
    fn include_resolver_splices_source() {
        let mut asm = Assembler::new();
        asm.set_include_resolver(Box::new(|name| {
            (name == "prologue.asm").then(|| String::from("section code execute\nfunction f:\n"))
        }));
        asm.emit("%include \"prologue.asm\"\nreturn\nend\n");
        let obj = asm.finish().unwrap().into_object();
        assert_eq!(obj.sections[0].data.len(), 4);
    }

    #[test]
    fn include_without_resolver_fails() {
        let mut asm = Assembler::new();
        asm.emit("%include \"missing.asm\"\n");
        assert!(asm.finish().is_err());
    }

    #[test]
    fn merge_jump_peephole_fuses_loop_counter() {
        let obj = assemble_ok(
            "section code execute\nfunction f:\nloop_top:\nint32 r1 = r1 - 1\nint32 jump_notzero r1, loop_top\nreturn\nend\n",
        );
        let sec = &obj.sections[0];
        // anchor + fused sub_jump_notzero (2 words) + return (1 word).
        assert_eq!(sec.data.len(), 12);
        let w0 = u32::from_le_bytes([sec.data[0], sec.data[1], sec.data[2], sec.data[3]]);
        assert_eq!(
            crate::format::op1(w0),
            crate::ir::jump_op1(crate::ir::II_SUB_JUMP_NOTZERO)
        );
    }
}
