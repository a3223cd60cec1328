//! Disassembler: object file back to assembly text.
//!
//! Two passes over each executable section. The first walks the
//! instruction cursor, decoding headers through the format-lookup trie,
//! and synthesizes labels for self-relative jump targets that have no
//! symbol. The second emits text: section headers, labels, one canonical
//! statement per instruction, and a raw-words comment.
//!
//! Decoding is total: a header that reaches the invalid sentinel, or a
//! word with a relocation on its first byte (jump-table entries), is
//! dumped as a data definition with a warning comment, and the cursor
//! always advances.

#[allow(unused_imports)]
use alloc::format;
use alloc::collections::BTreeMap;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::encoder::{extract, extract_unsigned, f16_to_f64};
use crate::error::AsmError;
use crate::format::{
    self, Format, Template, MEM_INDEX, MEM_OFFSET, MEM_SELF_REL, OPA_IMM, OPA_MASK, OPA_MEM,
    OPA_RT, OPA_RU, SCALE_OFFSET_OS, VECT_LEN_RU, VECT_USED,
};
use crate::ir::{
    Category, OperandType, Register, II_MOVE, II_RETURN, II_STORE, SHF_COMDAT, SHF_EXEC,
    SHF_READ, SHF_UNINIT, SHF_WEAK, SHF_WRITE,
};
use crate::itable::{Instruction, InstructionTable, VARIANT_D0};
use crate::object::ObjectFile;
use crate::symtab::{RelocKind, SymbolKind};

/// Disassemble an object file into assembly text with the built-in
/// instruction table.
///
/// # Errors
///
/// Returns [`AsmError::BadObjectFile`] for structurally broken inputs
/// (relocations pointing outside their section).
pub fn disassemble(obj: &ObjectFile) -> Result<String, AsmError> {
    Disassembler::new(obj).run()
}

/// One decoded stop of the cursor.
enum Slot {
    /// A decoded instruction.
    Instr {
        fmt: &'static Format,
        def: Instruction,
        words: [u32; 3],
    },
    /// A tiny pair.
    Tiny(u32, u32),
    /// An undecodable or relocated word dumped as data.
    Data(u32),
}

/// Disassembly session.
pub struct Disassembler<'a> {
    obj: &'a ObjectFile,
    itab: InstructionTable,
    /// Synthesized labels: (section, address) → name.
    labels: BTreeMap<(u32, u32), String>,
    /// Relocation lookup: (section, offset) → relocation index.
    relocs: BTreeMap<(u32, u32), usize>,
    /// Object symbols by (section, address).
    syms_at: BTreeMap<(u32, u32), Vec<usize>>,
    next_label: u32,
    next_data: u32,
}

impl<'a> Disassembler<'a> {
    /// Create a session with the built-in instruction table.
    #[must_use]
    pub fn new(obj: &'a ObjectFile) -> Self {
        Self::with_table(obj, InstructionTable::builtin())
    }

    /// Create a session with a custom instruction table.
    #[must_use]
    pub fn with_table(obj: &'a ObjectFile, itab: InstructionTable) -> Self {
        let mut relocs = BTreeMap::new();
        for (i, r) in obj.relocations.iter().enumerate() {
            relocs.insert((r.section, r.offset), i);
        }
        let mut syms_at: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
        for (i, s) in obj.symbols.iter().enumerate() {
            if s.section != 0 && !s.constant {
                syms_at
                    .entry((s.section, s.value as u32))
                    .or_default()
                    .push(i);
            }
        }
        Self {
            obj,
            itab,
            labels: BTreeMap::new(),
            relocs,
            syms_at,
            next_label: 0,
            next_data: 0,
        }
    }

    /// Run both passes and return the listing.
    ///
    /// # Errors
    ///
    /// Returns [`AsmError::BadObjectFile`] when the container is
    /// structurally inconsistent.
    pub fn run(mut self) -> Result<String, AsmError> {
        self.synthesize_labels();
        self.write_all()
    }

    // ─── Pass 1: label synthesis ────────────────────────────────────

    /// Walk every executable section and give each self-relative branch
    /// target a printable name.
    fn synthesize_labels(&mut self) {
        let obj = self.obj;
        for (si, sec) in obj.sections.iter().enumerate() {
            if sec.flags & SHF_EXEC == 0 {
                continue;
            }
            let section = si as u32 + 1;
            let mut pos: usize = 0;
            while pos + 4 <= sec.data.len() {
                let slot = self.decode_at(section, &sec.data, pos);
                let advance = match slot {
                    Slot::Instr { fmt, words, .. } => {
                        if fmt.mem & MEM_SELF_REL != 0
                            && fmt.addr_size > 0
                            && self
                                .relocs
                                .get(&(section, pos as u32 + u32::from(fmt.addr_pos)))
                                .is_none()
                        {
                            let disp = extract(&words, fmt.addr_pos, fmt.addr_size);
                            let target = pos as i64 + i64::from(fmt.size) * 4 + disp * 4;
                            if target >= 0 && (target as u64) <= sec.size {
                                self.ensure_label(section, target as u32);
                            }
                        }
                        usize::from(fmt.size) * 4
                    }
                    _ => 4,
                };
                pos += advance;
            }
        }
        // Sorted by address already (BTreeMap); number them in order.
        let keys: Vec<(u32, u32)> = self
            .labels
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.next_label += 1;
            let name = format!("L_{}", self.next_label);
            self.labels.insert(key, name);
        }
    }

    /// Record that `addr` needs a label; an existing symbol supplies the
    /// name, otherwise one is numbered later in address order.
    fn ensure_label(&mut self, section: u32, addr: u32) {
        if self.labels.contains_key(&(section, addr)) {
            return;
        }
        if self.syms_at.contains_key(&(section, addr)) {
            return;
        }
        // Placeholder; numbered after collection so names follow address
        // order.
        self.labels.insert((section, addr), String::new());
    }

    /// The printable name of the jump target at `addr`.
    fn target_name(&self, section: u32, addr: u32) -> String {
        if let Some(ids) = self.syms_at.get(&(section, addr)) {
            return self.obj.symbols[ids[0]].name.clone();
        }
        if let Some(name) = self.labels.get(&(section, addr)) {
            return name.clone();
        }
        // Fallback for a target the first pass could not see.
        format!("L_at_{}", addr)
    }

    // ─── Decoding ───────────────────────────────────────────────────

    fn word_at(data: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
    }

    fn decode_at(&self, section: u32, data: &[u8], pos: usize) -> Slot {
        let w0 = Self::word_at(data, pos);
        // A relocation on the first byte means this word is data (a
        // jump-table entry or embedded constant).
        if let Some(&ri) = self.relocs.get(&(section, pos as u32)) {
            if !matches!(self.obj.relocations[ri].kind, RelocKind::Rel { .. }) {
                return Slot::Data(w0);
            }
        }
        if format::is_tiny_pair(w0) {
            let (s1, s2) = format::tiny_slots(w0);
            return Slot::Tiny(s1, s2);
        }
        let w1 = if pos + 8 <= data.len() {
            Self::word_at(data, pos + 4)
        } else {
            0
        };
        let Some(fmt) = format::lookup_format(w0, w1) else {
            return Slot::Data(w0);
        };
        if pos + usize::from(fmt.size) * 4 > data.len() {
            // Truncated trailing instruction: dump as data.
            return Slot::Data(w0);
        }
        let mut words = [w0, w1, 0];
        if fmt.size == 3 {
            words[2] = Self::word_at(data, pos + 8);
        }
        // Look the operation up by (category, op1, op2).
        let op1 = if fmt.tmpl == Template::D {
            format::op1_d(w0)
        } else {
            format::op1(w0)
        };
        let Some(def) = self.itab.find_decode(fmt.category, op1, 0) else {
            return Slot::Data(w0);
        };
        // The chosen format must be allowed for the instruction.
        if def.formats & (1u64 << fmt.index) == 0 {
            return Slot::Data(w0);
        }
        Slot::Instr {
            fmt,
            def: def.clone(),
            words,
        }
    }

    // ─── Pass 2: text emission ──────────────────────────────────────

    fn write_all(&mut self) -> Result<String, AsmError> {
        let obj = self.obj;
        let mut out = String::new();

        // External declarations and public exports first.
        for sym in &obj.symbols {
            if sym.section == 0 {
                let attr = if sym.constant { " constant" } else { "" };
                let _ = writeln!(out, "extern {}:{}", sym.name, attr);
            }
        }
        for sym in &obj.symbols {
            if sym.section != 0 && matches!(sym.binding, crate::symtab::Binding::Global) {
                let _ = writeln!(out, "public {}", sym.name);
            }
        }
        if !obj.symbols.is_empty() {
            let _ = writeln!(out);
        }

        for (si, sec) in obj.sections.iter().enumerate() {
            let section = si as u32 + 1;
            let _ = writeln!(out, "section {} {}", sec.name, section_attrs(sec));
            if sec.flags & SHF_EXEC != 0 {
                self.write_code_section(&mut out, section);
            } else {
                self.write_data_section(&mut out, section);
            }
        }
        Ok(out)
    }

    fn write_labels_at(&self, out: &mut String, section: u32, addr: u32, functions: &mut u32) {
        if let Some(ids) = self.syms_at.get(&(section, addr)) {
            for &i in ids {
                let sym = &self.obj.symbols[i];
                if sym.kind == SymbolKind::Function {
                    let _ = writeln!(out, "function {}:", sym.name);
                    *functions += 1;
                } else if sym.kind != SymbolKind::Section {
                    let _ = writeln!(out, "{}:", sym.name);
                }
            }
        }
        if let Some(name) = self.labels.get(&(section, addr)) {
            let _ = writeln!(out, "{}:", name);
        }
    }

    fn write_code_section(&mut self, out: &mut String, section: u32) {
        let obj = self.obj;
        let sec = &obj.sections[section as usize - 1];
        let mut functions = 0u32;
        let mut pos: usize = 0;
        while pos + 4 <= sec.data.len() {
            self.write_labels_at(out, section, pos as u32, &mut functions);
            match self.decode_at(section, &sec.data, pos) {
                Slot::Instr { fmt, def, words } => {
                    let text = self.instruction_text(section, pos, fmt, &def, &words);
                    let _ = write!(out, "{}", text);
                    let _ = write!(out, "  // ");
                    for w in 0..fmt.size {
                        let _ = write!(out, "{:08X} ", words[w as usize]);
                    }
                    let _ = writeln!(out);
                    pos += usize::from(fmt.size) * 4;
                }
                Slot::Tiny(s1, s2) => {
                    let w0 = Self::word_at(&sec.data, pos);
                    for slot in [s1, s2] {
                        let _ = writeln!(out, "{}  // tiny of {:08X}", self.tiny_text(slot), w0);
                    }
                    pos += 4;
                }
                Slot::Data(w) => {
                    self.next_data += 1;
                    let name = format!("_d{}", self.next_data);
                    if let Some(&ri) = self.relocs.get(&(section, pos as u32)) {
                        let r = &obj.relocations[ri];
                        let expr = reloc_expr(r);
                        let _ = writeln!(out, "int32 {} = {}  // data in code", name, expr);
                    } else {
                        let _ = writeln!(
                            out,
                            "int32 {} = 0x{:08X}  // unrecognized word, dumped as data",
                            name, w
                        );
                    }
                    pos += 4;
                }
            }
        }
        self.write_labels_at(out, section, pos as u32, &mut functions);
        if functions > 0 {
            let _ = writeln!(out, "end");
        }
        let _ = writeln!(out, "end");
    }

    fn write_data_section(&mut self, out: &mut String, section: u32) {
        let obj = self.obj;
        let sec = &obj.sections[section as usize - 1];
        let mut functions = 0u32;
        if sec.flags & SHF_UNINIT != 0 {
            // No bytes: reserve through the recorded symbols.
            let mut addrs: Vec<u32> = Vec::new();
            for (&(s, a), _) in self.syms_at.range((section, 0)..(section + 1, 0)) {
                if s == section {
                    addrs.push(a);
                }
            }
            for a in addrs {
                self.write_labels_at(out, section, a, &mut functions);
            }
            let _ = writeln!(out, "// uninitialized, {} bytes", sec.size);
            let _ = writeln!(out, "end");
            return;
        }
        let mut pos: usize = 0;
        let mut pending: Vec<u8> = Vec::new();
        let mut flush = |out: &mut String, pending: &mut Vec<u8>, counter: &mut u32| {
            if pending.is_empty() {
                return;
            }
            *counter += 1;
            let _ = write!(out, "int8 _d{} = ", counter);
            for (i, b) in pending.iter().enumerate() {
                if i > 0 {
                    let _ = write!(out, ", ");
                }
                let _ = write!(out, "{}", b);
            }
            let _ = writeln!(out);
            pending.clear();
        };
        while pos < sec.data.len() {
            let has_label = self.syms_at.contains_key(&(section, pos as u32));
            if has_label {
                flush(out, &mut pending, &mut self.next_data);
                self.write_labels_at(out, section, pos as u32, &mut functions);
            }
            if let Some(&ri) = self.relocs.get(&(section, pos as u32)) {
                flush(out, &mut pending, &mut self.next_data);
                let r = &obj.relocations[ri];
                let size = r.kind.size() as usize;
                self.next_data += 1;
                let ty = match size {
                    2 => "int16",
                    4 => "int32",
                    8 => "int64",
                    _ => "int8",
                };
                let _ = writeln!(out, "{} _d{} = {}", ty, self.next_data, reloc_expr(r));
                pos += size.max(1);
                continue;
            }
            pending.push(sec.data[pos]);
            pos += 1;
            if pending.len() == 16 {
                flush(out, &mut pending, &mut self.next_data);
            }
        }
        flush(out, &mut pending, &mut self.next_data);
        self.write_labels_at(out, section, pos as u32, &mut functions);
        let _ = writeln!(out, "end");
    }

    // ─── Instruction printing ───────────────────────────────────────

    fn reg(&self, fmt: &Format, n: u32) -> Register {
        if fmt.vect & VECT_USED != 0 {
            Register::Vector(n as u8)
        } else {
            Register::Gp(n as u8)
        }
    }

    fn tiny_text(&self, slot: u32) -> String {
        let op1 = format::tiny_op1(slot);
        let rd = format::tiny_rd(slot);
        match self.itab.find_decode(Category::Tiny, op1, 0) {
            Some(def) if def.variant & VARIANT_D0 != 0 => def.name.clone(),
            Some(def) => format!("{} r{}", def.name, rd),
            None => format!("nop  // unknown tiny op {}", op1),
        }
    }

    /// Memory operand in canonical `[base + index*scale + offset]` form.
    fn mem_text(&self, section: u32, pos: usize, fmt: &Format, words: &[u32; 3]) -> String {
        let mut s = String::from("[");
        let base = format::rs(words[0]);
        let _ = write!(s, "r{}", base);
        if fmt.mem & MEM_INDEX != 0 {
            let index = format::rt(words[0]);
            if index != 0 {
                let neg = word1_fields(fmt) && format::im3(words[1]) & 2 != 0;
                if neg {
                    let _ = write!(s, " - r{}", index);
                } else {
                    let os = OperandType::from_ot_field(format::ot(words[0])).size_bytes();
                    let _ = write!(s, " + r{}*{}", index, os);
                }
            }
        }
        if fmt.addr_size > 0 && fmt.mem & MEM_OFFSET != 0 {
            let field = (section, pos as u32 + u32::from(fmt.addr_pos));
            if let Some(&ri) = self.relocs.get(&field) {
                let r = &self.obj.relocations[ri];
                let _ = write!(s, " + {}", r.symbol);
                if r.addend != 0 {
                    let _ = write!(s, " + {}", r.addend);
                }
            } else {
                let mut off = extract(words, fmt.addr_pos, fmt.addr_size);
                if fmt.scale & SCALE_OFFSET_OS != 0 {
                    off *= i64::from(OperandType::from_ot_field(format::ot(words[0])).size_bytes());
                }
                if off != 0 {
                    let _ = write!(s, " + {}", off);
                }
            }
        }
        s.push(']');
        s
    }

    /// The decoded immediate of a non-jump instruction.
    fn imm_value(&self, fmt: &Format, words: &[u32; 3], float: bool) -> String {
        if float {
            let x = match fmt.imm_size {
                2 => f16_to_f64(extract_unsigned(words, fmt.imm_pos, 2) as u16),
                _ => f64::from(f32::from_bits(
                    extract_unsigned(words, fmt.imm_pos, 4) as u32
                )),
            };
            return format!("{:?}", x);
        }
        let mut v = extract(words, fmt.imm_pos, fmt.imm_size);
        if fmt.imm_shift && word1_fields(fmt) {
            v <<= format::im3(words[1]);
        }
        format!("{}", v)
    }

    fn instruction_text(
        &self,
        section: u32,
        pos: usize,
        fmt: &Format,
        def: &Instruction,
        words: &[u32; 3],
    ) -> String {
        let mut s = String::new();
        let dtype = OperandType::from_ot_field(format::ot(words[0]));
        let typed = def.variant & VARIANT_D0 == 0 && fmt.tmpl != Template::D;

        if def.category == Category::Jump {
            return self.jump_text(section, pos, fmt, def, words, typed, dtype);
        }
        if def.variant & VARIANT_D0 != 0 {
            // No destination, no operand type: the bare mnemonic.
            return def.name.clone();
        }

        // Assignment spelling.
        if typed {
            let _ = write!(s, "{} ", dtype.name());
        }
        let rd = self.reg(fmt, format::rd(words[0]));
        if def.id == II_STORE {
            let _ = write!(s, "{} = {}", self.mem_text(section, pos, fmt, words), rd);
        } else {
            let _ = write!(s, "{} = ", rd);
            let second = self.second_operand_text(section, pos, fmt, def, words, dtype);
            if def.id == II_MOVE {
                // A single-source move: the operand is the memory operand,
                // the immediate, or the RS register.
                let src = if fmt.op_avail & (OPA_MEM | OPA_IMM) != 0 {
                    second
                } else {
                    format!("{}", self.reg(fmt, format::rs(words[0])))
                };
                let _ = write!(s, "{}", src);
            } else {
                // Binary operation. With a memory operand the destination
                // doubles as the first source; otherwise RS carries it.
                let first = if fmt.op_avail & OPA_MEM != 0 {
                    rd
                } else {
                    self.reg(fmt, format::rs(words[0]))
                };
                let _ = write!(s, "{}({}, {})", def.name, first, second);
            }
        }
        // Mask.
        if fmt.op_avail & OPA_MASK != 0 {
            let m = format::mask(words[0]);
            if m != 7 {
                let _ = write!(s, ", mask = r{}", m);
            }
        }
        // Vector length / broadcast in RU.
        if fmt.vect & VECT_LEN_RU != 0 && word1_fields(fmt) {
            let ru = format::ru(words[1]);
            let kw = if format::im3(words[1]) & 1 != 0 {
                "broadcast"
            } else {
                "length"
            };
            let _ = write!(s, ", {} = r{}", kw, ru);
        } else if fmt.op_avail & OPA_RU != 0 && word1_fields(fmt) {
            let ru = format::ru(words[1]);
            if ru != 0 {
                let _ = write!(s, ", fallback = {}", self.reg(fmt, ru));
            }
        }
        s
    }

    /// The second source operand of a binary operation (or the single
    /// source of a move): memory, a relocated immediate, the RT register,
    /// or an inline immediate.
    ///
    /// A format offering both RT and an immediate field stores exactly one
    /// of them; a non-zero RT wins the reading (an all-zero pair decodes
    /// as immediate 0, which re-encodes to the same word).
    fn second_operand_text(
        &self,
        section: u32,
        pos: usize,
        fmt: &Format,
        def: &Instruction,
        words: &[u32; 3],
        dtype: OperandType,
    ) -> String {
        if fmt.op_avail & OPA_MEM != 0 {
            return self.mem_text(section, pos, fmt, words);
        }
        if fmt.op_avail & OPA_IMM != 0 && fmt.imm_size > 0 {
            let field = (section, pos as u32 + u32::from(fmt.imm_pos));
            if let Some(&ri) = self.relocs.get(&field) {
                return reloc_expr(&self.obj.relocations[ri]);
            }
            if fmt.op_avail & OPA_RT != 0 && format::rt(words[0]) != 0 {
                return format!("{}", self.reg(fmt, format::rt(words[0])));
            }
            return self.imm_value(fmt, words, dtype.is_float() && def.variant & VARIANT_D0 == 0);
        }
        if fmt.op_avail & OPA_RT != 0 {
            return format!("{}", self.reg(fmt, format::rt(words[0])));
        }
        String::from("0")
    }

    #[allow(clippy::too_many_arguments)]
    fn jump_text(
        &self,
        section: u32,
        pos: usize,
        fmt: &Format,
        def: &Instruction,
        words: &[u32; 3],
        typed: bool,
        dtype: OperandType,
    ) -> String {
        let mut s = String::new();
        if typed {
            let _ = write!(s, "{} ", dtype.name());
        }
        let _ = write!(s, "{}", def.name);
        if def.id == II_RETURN {
            return s;
        }

        // Register and immediate operands before the target.
        if def.source_operands > 0 {
            let rd = Register::Gp(format::rd(words[0]) as u8);
            let _ = write!(s, " {}", rd);
            if def.source_operands >= 2 {
                // Second operand: the 32-bit immediate word, the RS
                // register, or the IM3 immediate. A non-zero RS wins over
                // an all-zero IM3 (both re-encode to the same word).
                let rs = format::rs(words[0]);
                if fmt.imm_size == 4 {
                    let _ = write!(s, ", {}", extract(words, fmt.imm_pos, 4));
                } else if rs != 0 {
                    let _ = write!(s, ", r{}", rs);
                } else if fmt.imm3 {
                    let _ = write!(s, ", {}", format::im3(words[1]));
                } else {
                    let _ = write!(s, ", r0");
                }
            }
            let _ = write!(s, ",");
        }

        // Target: relocation symbol or resolved label.
        let field = (section, pos as u32 + u32::from(fmt.addr_pos));
        if let Some(&ri) = self.relocs.get(&field) {
            let _ = write!(s, " {}", self.obj.relocations[ri].symbol);
        } else {
            let disp = extract(words, fmt.addr_pos, fmt.addr_size);
            let target = pos as i64 + i64::from(fmt.size) * 4 + disp * 4;
            let _ = write!(s, " {}", self.target_name(section, target.max(0) as u32));
        }
        s
    }
}

/// Whether a format's second word carries field bits rather than a raw
/// value (mirror of the encoder's rule).
fn word1_fields(fmt: &Format) -> bool {
    fmt.tmpl == Template::E
        && !(fmt.addr_pos == 4 && fmt.addr_size == 4)
        && !(fmt.imm_pos == 4 && fmt.imm_size == 4)
}

/// Render the value expression of a data relocation.
fn reloc_expr(r: &crate::symtab::NamedRelocation) -> String {
    match r.kind {
        RelocKind::Diff { scale, .. } => {
            let base = match &r.ref_sym {
                Some(rs) => format!("({} - {})", r.symbol, rs),
                None => r.symbol.clone(),
            };
            let scaled = if scale > 1 {
                format!("{} / {}", base, scale)
            } else {
                base
            };
            if r.addend != 0 {
                format!("{} + {}", scaled, r.addend)
            } else {
                scaled
            }
        }
        _ => {
            if r.addend != 0 {
                format!("{} + {}", r.symbol, r.addend)
            } else {
                r.symbol.clone()
            }
        }
    }
}

/// Canonical attribute list of a section header.
fn section_attrs(sec: &crate::object::ObjectSection) -> String {
    let mut s = String::new();
    if sec.flags & SHF_EXEC != 0 {
        s.push_str("execute");
    } else if sec.flags & SHF_READ != 0 {
        s.push_str("read");
    }
    if sec.flags & SHF_WRITE != 0 {
        s.push_str(" write");
    }
    if sec.flags & SHF_UNINIT != 0 {
        s.push_str(" uninit");
    }
    if sec.flags & SHF_WEAK != 0 {
        s.push_str(" weak");
    }
    if sec.flags & SHF_COMDAT != 0 {
        s.push_str(" comdat");
    }
    if sec.align > 4 {
        let _ = write!(s, " align {}", sec.align);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;

    fn assemble(src: &str) -> ObjectFile {
        let mut asm = Assembler::new();
        asm.emit(src);
        asm.finish().expect("assembly should succeed").into_object()
    }

    fn strip_comments(text: &str) -> String {
        let mut out = String::new();
        for line in text.lines() {
            let code = line.split("//").next().unwrap_or("");
            if !code.trim().is_empty() {
                out.push_str(code.trim_end());
                out.push('\n');
            }
        }
        out
    }

    #[test]
    fn disassemble_minimal_function() {
        let obj = assemble(
            "section code execute\nfunction f: public f\nint32 r1 = r2 + 1\nreturn\nend\n",
        );
        let text = disassemble(&obj).unwrap();
        assert!(text.contains("public f"), "{}", text);
        assert!(text.contains("function f:"), "{}", text);
        assert!(text.contains("int32 r1 = add(r2, 1)"), "{}", text);
        assert!(text.contains("return"), "{}", text);
    }

    #[test]
    fn branch_targets_get_labels() {
        let obj = assemble(
            "section code execute\nfunction f:\nloop_top:\nint32 r1 = r1 - 1\nint32 jump_positive r1, loop_top\nreturn\nend\n",
        );
        let text = disassemble(&obj).unwrap();
        // The local label was stripped from the object, so the
        // disassembler synthesizes one at the target address.
        assert!(text.contains("L_1:"), "{}", text);
        assert!(text.contains("jump_positive r1, L_1"), "{}", text);
    }

    #[test]
    fn roundtrip_simple_function() {
        let src =
            "section code execute\nfunction f: public f\nint32 r1 = r2 + 1\nint64 r3 = r1\nreturn\nend\n";
        let obj1 = assemble(src);
        let text = disassemble(&obj1).unwrap();
        let obj2 = assemble(&strip_comments(&text));
        assert_eq!(
            obj1.sections[0].data, obj2.sections[0].data,
            "bytes differ; listing was:\n{}",
            text
        );
    }

    #[test]
    fn roundtrip_branches_and_calls() {
        let src = "section code execute\nextern callee:\nfunction f: public f\nif (r1 > 0) {\nint32 r2 = r2 + 5\n}\ncall callee\nreturn\nend\n";
        let obj1 = assemble(src);
        let text = disassemble(&obj1).unwrap();
        let obj2 = assemble(&strip_comments(&text));
        assert_eq!(
            obj1.sections[0].data, obj2.sections[0].data,
            "listing was:\n{}",
            text
        );
        // The call relocation survives the round trip.
        let r1: Vec<_> = obj1.relocations.iter().map(|r| (&r.symbol, r.kind)).collect();
        let r2: Vec<_> = obj2.relocations.iter().map(|r| (&r.symbol, r.kind)).collect();
        assert_eq!(r1, r2);
    }

    #[test]
    fn roundtrip_memory_and_store() {
        let src = "section code execute\nfunction f: public f\nint32 r1 = [r2 + 8]\nint32 [r2 + 12] = r1\nreturn\nend\n";
        let obj1 = assemble(src);
        let text = disassemble(&obj1).unwrap();
        let obj2 = assemble(&strip_comments(&text));
        assert_eq!(
            obj1.sections[0].data, obj2.sections[0].data,
            "listing was:\n{}",
            text
        );
    }

    #[test]
    fn roundtrip_tiny_pair() {
        let src = "section code execute\nfunction f: public f\npush r1\npush r2\nreturn\nend\n";
        let obj1 = assemble(src);
        let text = disassemble(&obj1).unwrap();
        assert!(text.contains("push r1"), "{}", text);
        assert!(text.contains("push r2"), "{}", text);
        let obj2 = assemble(&strip_comments(&text));
        assert_eq!(obj1.sections[0].data, obj2.sections[0].data);
    }

    #[test]
    fn data_section_roundtrip_bytes() {
        let src = "section data read write\nint32 tab = 1, 2, 3\nend\n";
        let obj1 = assemble(src);
        let text = disassemble(&obj1).unwrap();
        let obj2 = assemble(&strip_comments(&text));
        assert_eq!(obj1.sections[0].data, obj2.sections[0].data, "{}", text);
    }

    #[test]
    fn undecodable_word_dumped_as_data() {
        let mut obj = assemble("section code execute\nfunction f: public f\nreturn\nend\n");
        // Append an il=0 (reserved) word: must be dumped, not decoded.
        obj.sections[0].data.extend_from_slice(&0x0000_0001u32.to_le_bytes());
        obj.sections[0].size += 4;
        let text = disassemble(&obj).unwrap();
        assert!(text.contains("dumped as data"), "{}", text);
    }

    #[test]
    fn cursor_never_stalls() {
        // Arbitrary byte soup must terminate and cover every word.
        let mut obj = ObjectFile::default();
        let mut data = Vec::new();
        for i in 0..64u32 {
            data.extend_from_slice(&(i.wrapping_mul(0x9E37_79B9)).to_le_bytes());
        }
        obj.sections.push(crate::object::ObjectSection {
            name: String::from("code"),
            flags: SHF_READ | SHF_EXEC,
            align: 4,
            size: data.len() as u64,
            data,
        });
        let text = disassemble(&obj).unwrap();
        assert!(text.contains("section code execute"));
    }
}
