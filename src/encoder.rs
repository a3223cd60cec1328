//! Encoding selection: constant fitting, format matching, and field
//! placement.
//!
//! The selector receives an abstract [`Code`] with operand fields populated
//! by the parser and chooses the smallest format whose constraints all
//! hold: category, operand availability, operand type, immediate fit,
//! address fit, and vector/mask compatibility. Among formats of equal size
//! it prefers one that needs no relocation, then the lowest format index,
//! so selection is deterministic.
//!
//! Fitting is expressed as bitmaps: [`fit_constant`] computes every
//! representation an immediate fits (signed/unsigned widths, shifted
//! forms, float precisions, "needs relocation"), [`fit_address`] the same
//! for displacements. A format accepts a code when the representations it
//! offers intersect the code's fit bitmap.
//!
//! Sizes never shrink once committed: re-fitting passes a floor, which is
//! what makes the address-resolution iteration converge.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::error::Span;
use crate::expr::{MemOperand, Value};
use crate::format::{
    self, Format, Template, FORMAT_LIST, MEM_BASE, MEM_INDEX, MEM_OFFSET, MEM_SELF_REL, OPA_IMM,
    OPA_MASK, OPA_MEM, OPA_RD, OPA_RS, OPA_RT, OPA_RU, SCALE_INDEX_OS, SCALE_MINUS1,
    SCALE_OFFSET_OS, VECT_LEN_RU, VECT_USED,
};
use crate::ir::{Category, OperandType, Register};
use crate::itable::{Instruction, InstructionTable, VARIANT_D0};
use crate::symtab::{RelocKind, SymbolTable, SYM_ADDRESS_KNOWN};

// ─── Fit bitmaps ────────────────────────────────────────────────────────

/// Fits a signed 4-bit integer (tiny immediate).
pub const FIT_I4: u32 = 1;
/// Fits an unsigned 4-bit integer.
pub const FIT_U4: u32 = 4;
/// Fits a signed 8-bit integer.
pub const FIT_I8: u32 = 0x10;
/// `(−x)` fits a signed 8-bit integer.
pub const FIT_J8: u32 = 0x20;
/// Fits an unsigned 8-bit integer.
pub const FIT_U8: u32 = 0x40;
/// Fits a signed 8-bit integer with a left shift.
pub const FIT_I8SHIFT: u32 = 0x80;
/// Fits a signed 16-bit integer.
pub const FIT_I16: u32 = 0x100;
/// `(−x)` fits a signed 16-bit integer.
pub const FIT_J16: u32 = 0x200;
/// Fits an unsigned 16-bit integer.
pub const FIT_U16: u32 = 0x400;
/// Fits a signed 16-bit integer with a left shift.
pub const FIT_I16SHIFT: u32 = 0x800;
/// Fits a signed 16-bit integer shifted left by 16.
pub const FIT_I16SH16: u32 = 0x1000;
/// Fits a signed 24-bit integer.
pub const FIT_I24: u32 = 0x4000;
/// Fits a signed 32-bit integer.
pub const FIT_I32: u32 = 0x1_0000;
/// `(−x)` fits a signed 32-bit integer.
pub const FIT_J32: u32 = 0x2_0000;
/// Fits an unsigned 32-bit integer.
pub const FIT_U32: u32 = 0x4_0000;
/// Fits a signed 32-bit integer with a left shift.
pub const FIT_I32SHIFT: u32 = 0x8_0000;
/// Fits a signed 32-bit integer shifted left by 32.
pub const FIT_I32SH32: u32 = 0x10_0000;
/// `(−x)` fits better than `x` in some width.
pub const FIT_J: u32 = FIT_J8 | FIT_J16 | FIT_J32;
/// Fits normal half precision.
pub const FIT_F16: u32 = 0x100_0000;
/// Fits normal single precision.
pub const FIT_F32: u32 = 0x200_0000;
/// Fits double precision.
pub const FIT_F64: u32 = 0x400_0000;
/// A relocation record is needed.
pub const FIT_RELOC: u32 = 0x1000_0000;
/// Choose the larger size when uncertain (convergence safety valve).
pub const FIT_LARGE: u32 = 0x2000_0000;

// ─── Code ───────────────────────────────────────────────────────────────

/// The result of interpreting one code line: an abstract instruction
/// before a format has been chosen.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Code {
    /// Instruction id.
    pub id: u32,
    /// Index into the instruction table.
    pub instr: u32,
    /// Category (copied from the table entry).
    pub category: Option<Category>,
    /// Operand type of the operation.
    pub dtype: Option<OperandType>,
    /// A larger operand type is acceptable (`int32+`).
    pub dtype_plus: bool,
    /// Destination register.
    pub dest: Option<Register>,
    /// The destination is the memory operand (store).
    pub mem_dest: bool,
    /// First source register.
    pub reg1: Option<Register>,
    /// Second source register.
    pub reg2: Option<Register>,
    /// Immediate operand.
    pub imm: Value,
    /// The immediate is the address of this symbol (plus the addend held
    /// in `imm`).
    pub imm_sym: Option<u32>,
    /// Reference symbol: the immediate is `(imm_sym − imm_ref) / imm_scale`.
    pub imm_ref: Option<u32>,
    /// Scale divisor on the symbol difference (1, 2, 4, or 8).
    pub imm_scale: u8,
    /// Memory operand.
    pub mem: Option<MemOperand>,
    /// Mask register number (0–6).
    pub mask: Option<u8>,
    /// Fallback register.
    pub fallback: Option<Register>,
    /// Raw option bits for IM3.
    pub options: Option<u8>,
    /// Jump target symbol.
    pub target: Option<u32>,
    /// Case labels of an embedded jump table (pseudo-codes only); each
    /// entry becomes a word-scaled difference against the table base.
    pub table: Vec<u32>,
    /// Label defined at this code's address.
    pub label: Option<u32>,
    /// Source line index.
    pub line: u32,
    /// Source span of the statement.
    pub span: Span,
    /// Section index.
    pub section: u32,
    /// Byte address relative to section start (assigned in pass 4).
    pub address: u32,
    /// Chosen format (index into the format table).
    pub format: Option<u8>,
    /// Immediate fit bitmap.
    pub fit_num: u32,
    /// Address fit bitmap.
    pub fit_addr: u32,
    /// Committed size in 32-bit words (0 = tiny half-slot).
    pub size: u8,
    /// The size may still grow by up to this many words.
    pub size_unknown: u8,
}

impl Code {
    /// Whether an immediate operand is populated.
    #[must_use]
    pub fn has_imm(&self) -> bool {
        !self.imm.is_none() || self.imm_sym.is_some()
    }

    /// Number of source register operands populated.
    #[must_use]
    pub fn source_regs(&self) -> u32 {
        u32::from(self.reg1.is_some()) + u32::from(self.reg2.is_some())
    }

    /// Whether any populated register is a vector register.
    #[must_use]
    pub fn uses_vectors(&self) -> bool {
        self.dest.is_some_and(Register::is_vector)
            || self.reg1.is_some_and(Register::is_vector)
            || self.reg2.is_some_and(Register::is_vector)
    }

    /// The byte size currently committed, counting a tiny half-slot as a
    /// full word (pairing happens at emission).
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        u32::from(self.size.max(1)) * 4
    }
}

// ─── Constant fitting ───────────────────────────────────────────────────

/// Fit bitmap of a signed integer value.
#[must_use]
pub fn fit_integer(v: i64) -> u32 {
    let mut f = 0;
    if (-8..8).contains(&v) {
        f |= FIT_I4;
    }
    if (0..16).contains(&v) {
        f |= FIT_U4;
    }
    if i64::from(v as i8) == v {
        f |= FIT_I8;
    }
    if (0..=i64::from(u8::MAX)).contains(&v) {
        f |= FIT_U8;
    }
    if v != i64::MIN && i64::from(v.wrapping_neg() as i8) == v.wrapping_neg() {
        f |= FIT_J8;
    }
    if i64::from(v as i16) == v {
        f |= FIT_I16;
    }
    if (0..=i64::from(u16::MAX)).contains(&v) {
        f |= FIT_U16;
    }
    if v != i64::MIN && i64::from(v.wrapping_neg() as i16) == v.wrapping_neg() {
        f |= FIT_J16;
    }
    if v != 0 && (v & 0xFFFF) == 0 && i64::from((v >> 16) as i16) == (v >> 16) {
        f |= FIT_I16SH16;
    }
    if i64::from(v as i32) == v {
        f |= FIT_I32;
    }
    if (0..=i64::from(u32::MAX)).contains(&v) {
        f |= FIT_U32;
    }
    if v != i64::MIN && i64::from(v.wrapping_neg() as i32) == v.wrapping_neg() {
        f |= FIT_J32;
    }
    if v != 0 && (v & 0xFFFF_FFFF) == 0 && i64::from((v >> 32) as i32) == (v >> 32) {
        f |= FIT_I32SH32;
    }
    // Shifted forms: value = s << k with s fitting the narrow width.
    if v != 0 {
        let k = v.trailing_zeros();
        if k > 0 {
            let s = v >> k;
            if i64::from(s as i8) == s {
                f |= FIT_I8SHIFT;
            }
            if i64::from(s as i16) == s {
                f |= FIT_I16SHIFT;
            }
            if i64::from(s as i32) == s {
                f |= FIT_I32SHIFT;
            }
        }
    }
    // 24-bit signed.
    if (-(1 << 23)..(1 << 23)).contains(&v) {
        f |= FIT_I24;
    }
    f
}

/// Whether a double survives a round trip through IEEE half precision.
#[must_use]
pub fn fits_half_precision(x: f64) -> bool {
    if x.is_nan() {
        return true;
    }
    f16_to_f64(f64_to_f16(x)) == x
}

/// Convert a double to IEEE half-precision bits (round to nearest even).
#[must_use]
pub fn f64_to_f16(x: f64) -> u16 {
    let b = (x as f32).to_bits();
    let sign = ((b >> 16) & 0x8000) as u16;
    let exp = ((b >> 23) & 0xFF) as i32;
    let man = b & 0x7F_FFFF;
    if exp == 0xFF {
        // Inf / NaN.
        return sign | 0x7C00 | if man != 0 { 0x200 } else { 0 };
    }
    let e = exp - 127 + 15;
    if e >= 0x1F {
        return sign | 0x7C00; // overflow to infinity
    }
    if e <= 0 {
        if e < -10 {
            return sign; // underflow to zero
        }
        // Subnormal half.
        let man = man | 0x80_0000;
        let shift = (14 - e) as u32;
        let half = (man >> shift) as u16;
        let rem = man & ((1 << shift) - 1);
        let round = 1u32 << (shift - 1);
        if rem > round || (rem == round && half & 1 != 0) {
            return sign | (half + 1);
        }
        return sign | half;
    }
    let half = sign | ((e as u16) << 10) | ((man >> 13) as u16);
    let rem = man & 0x1FFF;
    if rem > 0x1000 || (rem == 0x1000 && half & 1 != 0) {
        half + 1
    } else {
        half
    }
}

/// Convert IEEE half-precision bits to a double.
#[must_use]
pub fn f16_to_f64(h: u16) -> f64 {
    let sign = if h & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = (h >> 10) & 0x1F;
    let man = h & 0x3FF;
    let v = match (exp, man) {
        (0, 0) => 0.0,
        (0, m) => f64::from(m) * (2.0f64).powi(-24),
        (0x1F, 0) => f64::INFINITY,
        (0x1F, _) => f64::NAN,
        (e, m) => (1.0 + f64::from(m) / 1024.0) * (2.0f64).powi(i32::from(e) - 15),
    };
    sign * v
}

/// Fit bitmap of a floating point value.
#[must_use]
pub fn fit_float(x: f64) -> u32 {
    let mut f = FIT_F64;
    let as32 = x as f32;
    if f64::from(as32) == x || (x.is_nan() && as32.is_nan()) {
        f |= FIT_F32;
    }
    if fits_half_precision(x) {
        f |= FIT_F16;
    }
    f
}

/// Compute the immediate fit bitmap of a code.
///
/// An unresolved immediate symbol forces [`FIT_RELOC`].
#[must_use]
pub fn fit_constant(code: &Code) -> u32 {
    if code.imm_sym.is_some() {
        return FIT_RELOC;
    }
    match &code.imm {
        Value::None | Value::Str(_) => 0,
        Value::Int(v) => fit_integer(*v),
        Value::Float(x) => fit_float(*x),
    }
}

/// Compute the fit bitmap of a displacement or memory offset.
#[must_use]
pub fn fit_address(disp: i64) -> u32 {
    let mut f = 0;
    if i64::from(disp as i8) == disp {
        f |= FIT_I8;
    }
    if i64::from(disp as i16) == disp {
        f |= FIT_I16;
    }
    if (-(1 << 23)..(1 << 23)).contains(&disp) {
        f |= FIT_I24;
    }
    if i64::from(disp as i32) == disp {
        f |= FIT_I32;
    }
    f
}

/// Whether the immediate fits the 6-bit IM3 field (unsigned 0–63).
#[must_use]
pub fn fits_im3(code: &Code) -> bool {
    code.imm_sym.is_none() && matches!(code.imm, Value::Int(v) if (0..64).contains(&v))
}

// ─── Format matching ────────────────────────────────────────────────────

/// Why a candidate format rejected the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mismatch {
    Slots,
    OperandType,
    VectorClass,
    MaskUnsupported,
    Immediate,
    Address,
    MemoryShape,
    Scale,
    Fallback,
}

impl Mismatch {
    fn as_str(self) -> &'static str {
        match self {
            Mismatch::Slots => "operand combination has no matching slot layout",
            Mismatch::OperandType => "operand type not supported by this instruction",
            Mismatch::VectorClass => "register class does not match any format",
            Mismatch::MaskUnsupported => "mask register not supported by any candidate",
            Mismatch::Immediate => "immediate does not fit any candidate field",
            Mismatch::Address => "offset does not fit any candidate field",
            Mismatch::MemoryShape => "memory operand shape not supported",
            Mismatch::Scale => "index or offset scale not representable",
            Mismatch::Fallback => "fallback register not supported by any candidate",
        }
    }

    /// More specific causes win the error message.
    fn rank(self) -> u32 {
        match self {
            Mismatch::Slots => 1,
            Mismatch::VectorClass | Mismatch::MemoryShape => 2,
            Mismatch::OperandType | Mismatch::Scale => 3,
            Mismatch::MaskUnsupported | Mismatch::Fallback => 4,
            Mismatch::Immediate | Mismatch::Address => 5,
        }
    }
}

/// Signed fit mask for an address field of `size` bytes.
fn addr_accept(size: u8) -> u32 {
    match size {
        1 => FIT_I8,
        2 => FIT_I16,
        3 => FIT_I24,
        4 => FIT_I32,
        _ => 0,
    }
}

/// The displacement a jump would encode if it used `fmt`, when the target
/// address is already known. `None` while the target is unresolved.
fn jump_disp_words(code: &Code, fmt: &Format, syms: &SymbolTable) -> Option<i64> {
    let target = code.target?;
    let sym = syms.get(target);
    if sym.flags & SYM_ADDRESS_KNOWN == 0 || sym.section != code.section {
        return None;
    }
    let end = i64::from(code.address) + i64::from(fmt.size) * 4;
    Some((sym.value - end) / 4)
}

/// Check whether one format accepts the code. On success returns whether a
/// relocation will be required (used for tie-breaking).
fn format_accepts(
    code: &Code,
    def: &Instruction,
    fmt: &Format,
    syms: &SymbolTable,
) -> Result<bool, Mismatch> {
    let mut needs_reloc = false;

    // Operand availability: everything populated must have a slot.
    if code.has_imm() && fmt.op_avail & OPA_IMM == 0 {
        return Err(Mismatch::Slots);
    }
    if code.mem.is_some() && fmt.op_avail & OPA_MEM == 0 {
        return Err(Mismatch::Slots);
    }
    if code.mask.is_some() && fmt.op_avail & OPA_MASK == 0 {
        return Err(Mismatch::MaskUnsupported);
    }
    if code.fallback.is_some() && fmt.op_avail & OPA_RU == 0 {
        return Err(Mismatch::Fallback);
    }
    // IM3 cannot hold option bits and a shift count at once.
    if code.options.is_some() && fmt.imm_shift && code.has_imm() {
        return Err(Mismatch::Slots);
    }
    if (code.dest.is_some() || code.mem_dest) && fmt.op_avail & OPA_RD == 0 {
        return Err(Mismatch::Slots);
    }
    // Register slots: sources fill RS, then RT. A memory operand consumes
    // RS (base) and RT (index); the remaining source of a binary op must
    // then coincide with the destination register.
    let reg_slots =
        u32::from(fmt.op_avail & OPA_RS != 0) + u32::from(fmt.op_avail & OPA_RT != 0);
    let source_regs = if code.target.is_some() {
        // Jumps place their first operand in RD, the second in RS.
        code.source_regs().saturating_sub(1)
    } else if code.mem_dest {
        // The stored register travels in RD.
        code.source_regs().saturating_sub(1)
    } else if code.mem.is_some() {
        if code.reg1.is_some() && code.reg1 != code.dest {
            return Err(Mismatch::Slots);
        }
        0
    } else {
        code.source_regs()
    };
    if code.mem.is_none() && source_regs > reg_slots {
        return Err(Mismatch::Slots);
    }

    // Vector class.
    let vector = code.uses_vectors();
    if vector != (fmt.vect & VECT_USED != 0) {
        return Err(Mismatch::VectorClass);
    }
    let wants_len = code
        .mem
        .as_ref()
        .is_some_and(|m| m.length.is_some() || m.broadcast);
    if wants_len && fmt.vect & VECT_LEN_RU == 0 {
        return Err(Mismatch::VectorClass);
    }

    // Operand type.
    if let Some(dt) = code.dtype {
        let bit = dt.type_mask_bit();
        let mask = if vector {
            def.optypes_vector | def.optypes_scalar
        } else {
            def.optypes_gp
        };
        if mask & bit == 0 {
            return Err(Mismatch::OperandType);
        }
    }

    // Immediate fit.
    if code.has_imm() {
        if fmt.imm3 {
            if !fits_im3(code) {
                return Err(Mismatch::Immediate);
            }
        } else if fmt.imm_size == 0 {
            return Err(Mismatch::Slots);
        } else if code.fit_num & FIT_RELOC != 0 {
            // A relocated immediate needs a full 32-bit field.
            if fmt.imm_size != 4 {
                return Err(Mismatch::Immediate);
            }
            needs_reloc = true;
        } else {
            let unsigned = code.dtype.is_some_and(OperandType::is_unsigned);
            let float = code.dtype.is_some_and(OperandType::is_float);
            let accept = match fmt.imm_size {
                1 => {
                    if float {
                        0
                    } else {
                        FIT_I8 | if unsigned { FIT_U8 } else { 0 }
                    }
                }
                2 => {
                    if float {
                        FIT_F16
                    } else {
                        let mut a = FIT_I16 | if unsigned { FIT_U16 } else { 0 };
                        if fmt.imm_shift {
                            a |= FIT_I16SHIFT | FIT_I16SH16;
                        }
                        a
                    }
                }
                4 => {
                    if float {
                        FIT_F32
                    } else {
                        FIT_I32 | if unsigned { FIT_U32 } else { 0 }
                    }
                }
                _ => 0,
            };
            if code.fit_num & accept == 0 {
                return Err(Mismatch::Immediate);
            }
        }
    }

    // Memory operand shape and offset.
    if let Some(mem) = &code.mem {
        if fmt.mem & MEM_SELF_REL != 0 {
            return Err(Mismatch::MemoryShape);
        }
        if mem.base.is_some() && fmt.mem & MEM_BASE == 0 {
            return Err(Mismatch::MemoryShape);
        }
        if mem.index.is_some() && fmt.mem & MEM_INDEX == 0 {
            return Err(Mismatch::MemoryShape);
        }
        if mem.index.is_some() {
            let os = code.dtype.map_or(1, |d| i64::from(d.size_bytes()));
            let sc = i64::from(mem.scale);
            let ok = if sc == -1 {
                fmt.scale & SCALE_MINUS1 != 0
            } else {
                fmt.scale & SCALE_INDEX_OS != 0 && sc == os
            };
            if !ok {
                return Err(Mismatch::Scale);
            }
        }
        if mem.sym.is_some() {
            // Address symbol: needs a 32-bit offset field and a relocation.
            if fmt.addr_size != 4 {
                return Err(Mismatch::Address);
            }
            needs_reloc = true;
        } else if mem.offset != 0 {
            if fmt.mem & MEM_OFFSET == 0 || fmt.addr_size == 0 {
                return Err(Mismatch::MemoryShape);
            }
            let os = code.dtype.map_or(1, |d| i64::from(d.size_bytes()));
            let value = if fmt.scale & SCALE_OFFSET_OS != 0 {
                if mem.offset % os != 0 {
                    return Err(Mismatch::Scale);
                }
                mem.offset / os
            } else {
                mem.offset
            };
            if fit_address(value) & addr_accept(fmt.addr_size) == 0 {
                return Err(Mismatch::Address);
            }
        }
    }

    // Jump displacement.
    if code.target.is_some() {
        if fmt.mem & MEM_SELF_REL == 0 || fmt.addr_size == 0 {
            return Err(Mismatch::Slots);
        }
        match jump_disp_words(code, fmt, syms) {
            Some(disp) => {
                if fit_address(disp) & addr_accept(fmt.addr_size) == 0 {
                    return Err(Mismatch::Address);
                }
            }
            None => {
                let sym = syms.get(code.target.unwrap_or(0));
                if sym.section != code.section || sym.flags & SYM_ADDRESS_KNOWN == 0 {
                    let same_section_pending =
                        sym.section == code.section && sym.flags & SYM_ADDRESS_KNOWN == 0;
                    if !same_section_pending {
                        // Cross-section or external: relocated 32-bit
                        // displacement.
                        if fmt.addr_size != 4 {
                            return Err(Mismatch::Address);
                        }
                        needs_reloc = true;
                    }
                    // Same-section forward reference stays optimistic and
                    // may regrow in pass 4.
                }
            }
        }
    } else if fmt.mem & MEM_SELF_REL != 0 && def.source_operands > 0 {
        // A jump format for a code without a target only makes sense for
        // `return`-like codes.
        return Err(Mismatch::Slots);
    }

    Ok(needs_reloc)
}

/// Find the smallest format that fits the code, never shrinking below the
/// already committed size.
///
/// On success sets `format`, `size`, and `size_unknown`.
///
/// # Errors
///
/// Returns a human-readable cause when no candidate format accepts the
/// operand combination.
pub fn fit_code(
    code: &mut Code,
    itab: &InstructionTable,
    syms: &SymbolTable,
) -> Result<(), String> {
    let def = itab.get(code.instr);
    code.category = Some(def.category);
    code.fit_num = fit_constant(code);
    code.fit_addr = 0;

    if def.category == Category::Tiny {
        // Tiny instructions have exactly one (half-word) encoding.
        code.format = Some(format::FMT_TINY as u8);
        code.size = 0;
        code.size_unknown = 0;
        return Ok(());
    }

    let floor = code.size;
    let mut best: Option<(u8, bool, u8)> = None; // (size, reloc, index)
    let mut max_candidate = 0u8;
    let mut cause = Mismatch::Slots;

    for fmt in FORMAT_LIST {
        if def.formats & (1u64 << fmt.index) == 0 {
            continue;
        }
        if fmt.size < floor {
            continue;
        }
        match format_accepts(code, def, fmt, syms) {
            Ok(needs_reloc) => {
                max_candidate = max_candidate.max(fmt.size);
                let entry = (fmt.size, needs_reloc, fmt.index);
                if best.map_or(true, |b| entry < b) {
                    best = Some(entry);
                }
            }
            Err(m) => {
                if m.rank() > cause.rank() {
                    cause = m;
                }
            }
        }
    }

    let Some((size, _, index)) = best else {
        return Err(String::from(cause.as_str()));
    };
    code.format = Some(index);
    code.size = size;
    if let Some(disp) = jump_disp_words(code, &FORMAT_LIST[usize::from(index)], syms) {
        code.fit_addr = fit_address(disp);
    }
    // An unresolved same-section jump may still grow to the largest
    // candidate once the real displacement is known.
    let fmt = &FORMAT_LIST[usize::from(index)];
    let pending_jump = code.target.is_some() && jump_disp_words(code, fmt, syms).is_none() && {
        let sym = syms.get(code.target.unwrap_or(0));
        sym.section == code.section && sym.flags & SYM_ADDRESS_KNOWN == 0
    };
    code.size_unknown = if pending_jump {
        max_candidate.saturating_sub(size)
    } else {
        0
    };
    Ok(())
}

// ─── Field encoding ─────────────────────────────────────────────────────

/// A relocation produced while encoding one instruction; the offset is
/// relative to the instruction start.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeReloc {
    /// Byte offset of the patched field within the instruction.
    pub offset: u8,
    /// Relocation kind.
    pub kind: RelocKind,
    /// Target symbol.
    pub symbol: u32,
    /// Reference symbol of a difference relocation.
    pub ref_sym: Option<u32>,
    /// Addend.
    pub addend: i64,
}

/// One encoded instruction: up to three words plus pending relocations.
#[derive(Debug, Clone, Default)]
pub struct Encoded {
    /// The instruction words.
    pub words: [u32; 3],
    /// Number of words used (1 for a tiny slot, paired later).
    pub len: u8,
    /// Tiny slot value when the code is tiny (packed by the emitter).
    pub tiny: Option<u32>,
    /// Relocations against the instruction's fields.
    pub relocs: Vec<CodeReloc>,
}

/// Place a little-endian value into the 12-byte instruction image.
fn place(words: &mut [u32; 3], pos: u8, size: u8, value: u64) {
    for i in 0..size {
        let byte = ((value >> (8 * u32::from(i))) & 0xFF) as u32;
        let at = usize::from(pos + i);
        let w = at / 4;
        let sh = (at % 4) * 8;
        words[w] = (words[w] & !(0xFF << sh)) | (byte << sh);
    }
}

/// Extract a little-endian field from the 12-byte instruction image,
/// sign-extended.
#[must_use]
pub fn extract(words: &[u32; 3], pos: u8, size: u8) -> i64 {
    let mut v: u64 = 0;
    for i in 0..size {
        let at = usize::from(pos + i);
        let w = at / 4;
        let sh = (at % 4) * 8;
        v |= u64::from((words[w] >> sh) & 0xFF) << (8 * u32::from(i));
    }
    let bits = u32::from(size) * 8;
    if bits >= 64 {
        return v as i64;
    }
    let sign = 1u64 << (bits - 1);
    ((v ^ sign).wrapping_sub(sign)) as i64
}

/// Extract the same field zero-extended.
#[must_use]
pub fn extract_unsigned(words: &[u32; 3], pos: u8, size: u8) -> u64 {
    let mut v: u64 = 0;
    for i in 0..size {
        let at = usize::from(pos + i);
        let w = at / 4;
        let sh = (at % 4) * 8;
        v |= u64::from((words[w] >> sh) & 0xFF) << (8 * u32::from(i));
    }
    v
}

/// Whether the format's second word carries E-template fields (ru, im3,
/// mode2) rather than a raw 32-bit value.
fn word1_has_fields(fmt: &Format) -> bool {
    fmt.tmpl == Template::E && !(fmt.addr_pos == 4 && fmt.addr_size == 4)
        && !(fmt.imm_pos == 4 && fmt.imm_size == 4)
}

/// Encode a fitted code into instruction words.
///
/// The code must have been through [`fit_code`]; the chosen format drives
/// field placement. Unresolved references become relocations with their
/// field left as the addend.
#[must_use]
pub fn encode_code(code: &Code, itab: &InstructionTable, syms: &SymbolTable) -> Encoded {
    let def = itab.get(code.instr);
    let fmt = &FORMAT_LIST[usize::from(code.format.unwrap_or(0))];
    let mut out = Encoded {
        len: fmt.size,
        ..Encoded::default()
    };

    if fmt.tmpl == Template::T {
        let rd = code.dest.or(code.reg1).map_or(0, Register::code);
        let rs = code.imm.as_int().unwrap_or(0) as u32 & 15;
        out.tiny = Some(format::pack_tiny(def.op1, u32::from(rd), rs));
        out.len = 1;
        return out;
    }

    let words = &mut out.words;
    let il = u32::from(fmt.code >> 8);
    let mo = u32::from((fmt.code >> 4) & 0xF);
    words[0] = format::with_bits(words[0], 30, 2, il);
    words[0] = format::with_bits(words[0], 27, 3, mo);

    if fmt.tmpl == Template::D {
        words[0] = format::with_bits(words[0], 24, 3, def.op1);
    } else {
        words[0] = format::with_bits(words[0], 21, 6, def.op1);
        if def.variant & VARIANT_D0 == 0 {
            if let Some(dt) = code.dtype {
                words[0] = format::with_bits(words[0], 13, 3, dt.ot_field());
            }
        }
        // Register fields. RD carries the destination, the stored source,
        // or a jump's first operand; RS the first remaining source or the
        // memory base; RT the second source or the memory index.
        if code.target.is_some() {
            words[0] = format::with_bits(words[0], 16, 5, reg_field(code.reg1));
            words[0] = format::with_bits(words[0], 8, 5, reg_field(code.reg2));
        } else {
            let rd_reg = if code.mem_dest { code.reg1 } else { code.dest };
            words[0] = format::with_bits(words[0], 16, 5, reg_field(rd_reg));
            if let Some(mem) = &code.mem {
                words[0] = format::with_bits(words[0], 8, 5, reg_field(mem.base));
                if fmt.mem & MEM_INDEX != 0 {
                    words[0] = format::with_bits(words[0], 0, 5, reg_field(mem.index));
                }
            } else {
                let (src1, src2) = if code.mem_dest {
                    (None, None)
                } else {
                    (code.reg1, code.reg2)
                };
                words[0] = format::with_bits(words[0], 8, 5, reg_field(src1));
                if fmt.op_avail & OPA_RT != 0 {
                    words[0] = format::with_bits(words[0], 0, 5, reg_field(src2));
                }
            }
        }
        if fmt.op_avail & OPA_MASK != 0 {
            words[0] = format::with_bits(words[0], 5, 3, u32::from(code.mask.unwrap_or(7)));
        }
    }

    // Second-word bookkeeping for E formats whose word 1 carries fields.
    if word1_has_fields(fmt) {
        words[1] = format::with_bits(words[1], 27, 3, u32::from(fmt.code & 0xF));
        let ru_reg = code.fallback.or_else(|| {
            code.mem.as_ref().and_then(|m| m.length)
        });
        words[1] = format::with_bits(words[1], 16, 5, reg_field(ru_reg));
        let mut im3_bits = 0u32;
        if code.mem.as_ref().is_some_and(|m| m.broadcast) {
            im3_bits |= 1;
        }
        if code.mem.as_ref().is_some_and(|m| m.scale == -1) {
            im3_bits |= 2;
        }
        if let Some(opt) = code.options {
            im3_bits = u32::from(opt) & 63;
        }
        if im3_bits != 0 {
            words[1] = format::with_bits(words[1], 21, 6, im3_bits);
        }
    }

    // Immediate.
    if code.has_imm() {
        if let Some(sym) = code.imm_sym {
            let addend = code.imm.as_int().unwrap_or(0);
            place(words, fmt.imm_pos, fmt.imm_size, addend as u64);
            let kind = match code.imm_ref {
                Some(_) => RelocKind::Diff {
                    size: fmt.imm_size,
                    scale: code.imm_scale.max(1),
                },
                None => RelocKind::Abs { size: fmt.imm_size },
            };
            out.relocs.push(CodeReloc {
                offset: fmt.imm_pos,
                kind,
                symbol: sym,
                ref_sym: code.imm_ref,
                addend,
            });
        } else if fmt.imm3 {
            let v = code.imm.as_int().unwrap_or(0);
            words[1] = format::with_bits(words[1], 21, 6, (v as u32) & 63);
        } else {
            match &code.imm {
                Value::Int(v) => {
                    let mut v = *v;
                    if fmt.imm_shift && fmt.imm_size == 2 && i64::from(v as i16) != v {
                        // Shifted immediate: IM3 holds the shift count.
                        let k = v.trailing_zeros().min(48);
                        v >>= k;
                        words[1] = format::with_bits(words[1], 21, 6, k);
                    }
                    place(words, fmt.imm_pos, fmt.imm_size, v as u64);
                }
                Value::Float(x) => {
                    let bits: u64 = match fmt.imm_size {
                        2 => u64::from(f64_to_f16(*x)),
                        4 => u64::from((*x as f32).to_bits()),
                        _ => 0,
                    };
                    place(words, fmt.imm_pos, fmt.imm_size, bits);
                }
                _ => {}
            }
        }
    }

    // Memory offset.
    if let Some(mem) = &code.mem {
        if let Some(sym) = mem.sym {
            place(words, fmt.addr_pos, fmt.addr_size, mem.offset as u64);
            out.relocs.push(CodeReloc {
                offset: fmt.addr_pos,
                kind: RelocKind::Abs {
                    size: fmt.addr_size,
                },
                symbol: sym,
                ref_sym: None,
                addend: mem.offset,
            });
        } else if mem.offset != 0 {
            let os = code.dtype.map_or(1, |d| i64::from(d.size_bytes()));
            let v = if fmt.scale & SCALE_OFFSET_OS != 0 {
                mem.offset / os
            } else {
                mem.offset
            };
            place(words, fmt.addr_pos, fmt.addr_size, v as u64);
        }
    }

    // Jump displacement.
    if let Some(target) = code.target {
        let sym = syms.get(target);
        if sym.flags & SYM_ADDRESS_KNOWN != 0 && sym.section == code.section {
            let end = i64::from(code.address) + i64::from(fmt.size) * 4;
            let disp = (sym.value - end) / 4;
            place(words, fmt.addr_pos, fmt.addr_size, disp as u64);
        } else {
            place(words, fmt.addr_pos, fmt.addr_size, 0);
            out.relocs.push(CodeReloc {
                offset: fmt.addr_pos,
                kind: RelocKind::Rel {
                    size: fmt.addr_size,
                    scale: 4,
                },
                symbol: target,
                ref_sym: None,
                addend: 0,
            });
        }
    }

    out
}

fn reg_field(r: Option<Register>) -> u32 {
    u32::from(r.map_or(0, Register::code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir;

    fn code_of(name: &str) -> (Code, InstructionTable, SymbolTable) {
        let itab = InstructionTable::builtin();
        let idx = itab.find_name(name).expect("known instruction");
        let code = Code {
            id: itab.get(idx).id,
            instr: idx,
            category: Some(itab.get(idx).category),
            dtype: Some(OperandType::Int32),
            ..Code::default()
        };
        (code, itab, SymbolTable::new())
    }

    #[test]
    fn fit_integer_widths() {
        assert_ne!(fit_integer(0) & FIT_I8, 0);
        assert_ne!(fit_integer(127) & FIT_I8, 0);
        assert_eq!(fit_integer(128) & FIT_I8, 0);
        assert_ne!(fit_integer(128) & FIT_J8, 0); // -128 fits i8
        assert_ne!(fit_integer(255) & FIT_U8, 0);
        assert_ne!(fit_integer(-32768) & FIT_I16, 0);
        assert_eq!(fit_integer(65535) & FIT_I16, 0);
        assert_ne!(fit_integer(65535) & FIT_U16, 0);
        assert_ne!(fit_integer(0x7F_0000) & FIT_I24, 0);
        assert_ne!(fit_integer(i64::from(i32::MIN)) & FIT_I32, 0);
        assert_eq!(fit_integer(1 << 40) & FIT_I32, 0);
        assert_ne!(fit_integer(7) & FIT_I4, 0);
        assert_eq!(fit_integer(8) & FIT_I4, 0);
        assert_ne!(fit_integer(15) & FIT_U4, 0);
    }

    #[test]
    fn fit_integer_shifted_forms() {
        // 0x7F00 = 0x7F << 8.
        assert_ne!(fit_integer(0x7F00) & FIT_I8SHIFT, 0);
        assert_ne!(fit_integer(0x1234_0000) & FIT_I16SH16, 0);
        assert_ne!(fit_integer(0x1234_0000_0000) & FIT_I32SHIFT, 0);
        assert_ne!(
            fit_integer(0x7654_3210_0000_0000) & FIT_I32SH32,
            0
        );
        assert_eq!(fit_integer(3) & FIT_I8SHIFT, 0); // odd: no shift possible
    }

    #[test]
    fn fit_float_precisions() {
        assert_eq!(fit_float(1.0), FIT_F16 | FIT_F32 | FIT_F64);
        assert_eq!(fit_float(1.0e30), FIT_F32 | FIT_F64);
        assert_eq!(fit_float(1.0e300), FIT_F64);
        // 1/3 is not exactly representable below f64.
        assert_eq!(fit_float(1.0 / 3.0), FIT_F64);
        assert_ne!(fit_float(f64::NAN) & FIT_F16, 0);
    }

    #[test]
    fn half_precision_roundtrip() {
        for x in [0.0, 1.0, -2.5, 65504.0, 0.0009765625] {
            assert!(fits_half_precision(x), "{}", x);
            assert_eq!(f16_to_f64(f64_to_f16(x)), x);
        }
        assert!(!fits_half_precision(65505.0));
        assert_eq!(f16_to_f64(f64_to_f16(1.0e9)), f64::INFINITY);
    }

    #[test]
    fn add_register_pair_selects_one_word_a() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.reg2 = Some(Register::Gp(3));
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(0));
        assert_eq!(code.size, 1);
    }

    #[test]
    fn add_small_immediate_selects_one_word_b() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.imm = Value::Int(1);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(1));
        assert_eq!(code.size, 1);
    }

    #[test]
    fn add_imm16_grows_to_two_words() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.imm = Value::Int(1000);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(6));
        assert_eq!(code.size, 2);
    }

    #[test]
    fn add_imm32_grows_to_three_words() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.imm = Value::Int(1_000_000);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(12));
        assert_eq!(code.size, 3);
    }

    #[test]
    fn huge_immediate_fits_via_shift() {
        // 0x34_0000_0000 = 0x34 << 32 fits the 16-bit field with a shift.
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.dtype = Some(OperandType::Int64);
        code.imm = Value::Int(0x34_0000_0000);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(6), "shifted form should fit the 2-word E");
    }

    #[test]
    fn unfittable_combination_reports_cause() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.imm = Value::Int(0x1234_5678_9ABD);
        let err = fit_code(&mut code, &itab, &syms).unwrap_err();
        assert!(err.contains("immediate"), "{}", err);
    }

    #[test]
    fn vector_registers_select_vector_formats() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Vector(1));
        code.reg1 = Some(Register::Vector(2));
        code.reg2 = Some(Register::Vector(3));
        fit_code(&mut code, &itab, &syms).unwrap();
        let fmt = &FORMAT_LIST[code.format.unwrap() as usize];
        assert_ne!(fmt.vect & VECT_USED, 0);
    }

    #[test]
    fn mask_requires_mask_capable_format() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.reg2 = Some(Register::Gp(3));
        code.mask = Some(4);
        fit_code(&mut code, &itab, &syms).unwrap();
        let fmt = &FORMAT_LIST[code.format.unwrap() as usize];
        assert_ne!(fmt.op_avail & OPA_MASK, 0);
    }

    #[test]
    fn memory_operand_selects_memory_format() {
        let (mut code, itab, syms) = code_of("move");
        code.dest = Some(Register::Gp(1));
        code.mem = Some(MemOperand {
            base: Some(Register::Gp(2)),
            scale: 1,
            offset: 8,
            ..MemOperand::default()
        });
        fit_code(&mut code, &itab, &syms).unwrap();
        // Offset 8 scales by the int32 operand size to 2: 8-bit form fits.
        assert_eq!(code.format, Some(3));
    }

    #[test]
    fn unscalable_offset_uses_wide_format() {
        let (mut code, itab, syms) = code_of("move");
        code.dest = Some(Register::Gp(1));
        code.mem = Some(MemOperand {
            base: Some(Register::Gp(2)),
            scale: 1,
            offset: 7, // not divisible by the operand size
            ..MemOperand::default()
        });
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(7), "unscaled 16-bit offset form");
    }

    #[test]
    fn tiny_has_fixed_half_slot() {
        let (mut code, itab, syms) = code_of("push");
        code.reg1 = Some(Register::Gp(5));
        code.dtype = Some(OperandType::Int64);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.size, 0);
        assert_eq!(code.format, Some(format::FMT_TINY as u8));
    }

    #[test]
    fn jump_to_unknown_target_reserves_growth() {
        let (mut code, itab, mut syms) = code_of("jump_positive");
        code.reg1 = Some(Register::Gp(1));
        let target = syms.make_label("if_end");
        code.target = Some(target);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.size, 1, "optimistic 8-bit displacement first");
        assert!(code.size_unknown > 0, "may still grow");
    }

    #[test]
    fn jump_refit_grows_when_displacement_outgrows_field() {
        let (mut code, itab, mut syms) = code_of("jump_positive");
        code.reg1 = Some(Register::Gp(1));
        let target = syms.make_label("far");
        {
            let s = syms.get_mut(target);
            s.flags |= SYM_ADDRESS_KNOWN;
            s.section = 0;
            s.value = 4000; // 1000 words away, outside i8
        }
        code.address = 0;
        code.target = Some(target);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.size, 2, "needs the 16-bit displacement form");
        assert_eq!(code.format, Some(10));
    }

    #[test]
    fn refit_never_shrinks() {
        let (mut code, itab, mut syms) = code_of("jump_positive");
        code.reg1 = Some(Register::Gp(1));
        let target = syms.make_label("near");
        {
            let s = syms.get_mut(target);
            s.flags |= SYM_ADDRESS_KNOWN;
            s.section = 0;
            s.value = 8;
        }
        code.target = Some(target);
        code.size = 2; // previously committed two words
        fit_code(&mut code, &itab, &syms).unwrap();
        assert!(code.size >= 2);
    }

    #[test]
    fn place_extract_roundtrip() {
        let mut words = [0u32; 3];
        place(&mut words, 4, 2, 0xBEEF);
        assert_eq!(extract_unsigned(&words, 4, 2), 0xBEEF);
        place(&mut words, 8, 4, 0x1234_5678);
        assert_eq!(extract(&words, 8, 4), 0x1234_5678);
        let mut w2 = [0u32; 3];
        place(&mut w2, 0, 1, 0x80);
        assert_eq!(extract(&w2, 0, 1), -128);
        assert_eq!(extract_unsigned(&w2, 0, 1), 0x80);
    }

    #[test]
    fn encode_add_imm8() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.imm = Value::Int(5);
        fit_code(&mut code, &itab, &syms).unwrap();
        let enc = encode_code(&code, &itab, &syms);
        assert_eq!(enc.len, 1);
        let w = enc.words[0];
        assert_eq!(format::il(w), 1);
        assert_eq!(format::mode(w), 1);
        assert_eq!(format::op1(w), ir::II_ADD);
        assert_eq!(format::rd(w), 1);
        assert_eq!(format::rs(w), 2);
        assert_eq!(w & 0xFF, 5);
        assert!(enc.relocs.is_empty());
    }

    #[test]
    fn encode_unresolved_jump_emits_rel_reloc() {
        let (mut code, itab, mut syms) = code_of("jump");
        let target = syms.add("elsewhere");
        code.dtype = None;
        code.target = Some(target);
        // An undefined target in another module: section never matches.
        syms.get_mut(target).section = u32::MAX;
        fit_code(&mut code, &itab, &syms).unwrap();
        let enc = encode_code(&code, &itab, &syms);
        assert_eq!(enc.relocs.len(), 1);
        assert!(matches!(enc.relocs[0].kind, RelocKind::Rel { scale: 4, .. }));
    }

    #[test]
    fn encode_resolved_backward_jump() {
        let (mut code, itab, mut syms) = code_of("jump");
        let target = syms.make_label("top");
        {
            let s = syms.get_mut(target);
            s.flags |= SYM_ADDRESS_KNOWN;
            s.section = 0;
            s.value = 0;
        }
        code.dtype = None;
        code.target = Some(target);
        code.address = 12;
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(5));
        let enc = encode_code(&code, &itab, &syms);
        // Displacement: (0 - (12 + 4)) / 4 = -4 words, in the 24-bit field.
        assert_eq!(extract(&enc.words, 0, 3), -4);
        assert!(enc.relocs.is_empty());
    }

    #[test]
    fn encode_mask_default_is_seven() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.reg2 = Some(Register::Gp(3));
        fit_code(&mut code, &itab, &syms).unwrap();
        let enc = encode_code(&code, &itab, &syms);
        assert_eq!(format::mask(enc.words[0]), 7);
    }

    #[test]
    fn encode_shifted_immediate_records_shift_in_im3() {
        let (mut code, itab, syms) = code_of("add");
        code.dest = Some(Register::Gp(1));
        code.reg1 = Some(Register::Gp(2));
        code.dtype = Some(OperandType::Int64);
        code.imm = Value::Int(0x1230_0000);
        fit_code(&mut code, &itab, &syms).unwrap();
        assert_eq!(code.format, Some(6));
        let enc = encode_code(&code, &itab, &syms);
        let k = format::im3(enc.words[1]);
        let im2 = extract(&enc.words, 4, 2);
        assert_eq!(im2 << k, 0x1230_0000);
    }
}
