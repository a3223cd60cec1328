//! The instruction table: an immutable catalog of instruction definitions.
//!
//! Definitions are loaded from a 13-column comma-separated description
//! (id, category, format bitmap, template, source-operand count, op1, op2,
//! operand-type masks for general purpose / scalar / vector use, immediate
//! kind, template-variant string, name). Numbers accept decimal, hex,
//! binary, and octal. A built-in description of the standard instruction
//! set ships with the crate.
//!
//! The table keeps two sorted views: by name for the assembler, and by
//! (category, op1, op2) for the disassembler's reverse lookup.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{AsmError, Span};
use crate::ir::Category;

// ─── Template variants ──────────────────────────────────────────────────

/// No destination operand, no operand type.
pub const VARIANT_D0: u64 = 1 << 0;
/// No destination operand, but operand type specified.
pub const VARIANT_D1: u64 = 1 << 1;
/// Memory operand is the destination.
pub const VARIANT_M0: u64 = 1 << 3;
/// Destination is a general purpose register even for vector operands.
pub const VARIANT_R0: u64 = 1 << 8;
/// First source operand is a general purpose register.
pub const VARIANT_R1: u64 = 1 << 9;
/// Second source operand is a general purpose register.
pub const VARIANT_R2: u64 = 1 << 10;
/// Immediate operand is an integer even for float operand types.
pub const VARIANT_I2: u64 = 1 << 16;
/// Integer operands are unsigned.
pub const VARIANT_U0: u64 = 1 << 18;
/// Half precision floating point operands.
pub const VARIANT_H0: u64 = 1 << 28;

/// Interpret a template-variant string (pairs like `M0`, `D1`, `U0`)
/// into a flag word. Unknown pairs are ignored so newer descriptions stay
/// loadable.
#[must_use]
pub fn interpret_template_variants(s: &str) -> u64 {
    let mut flags = 0u64;
    let b = s.as_bytes();
    let mut i = 0;
    while i + 1 < b.len() {
        flags |= match (b[i].to_ascii_uppercase(), b[i + 1]) {
            (b'D', b'0') => VARIANT_D0,
            (b'D', b'1') => VARIANT_D1,
            (b'M', b'0') => VARIANT_M0,
            (b'R', b'0') => VARIANT_R0,
            (b'R', b'1') => VARIANT_R1,
            (b'R', b'2') => VARIANT_R2,
            (b'I', b'2') => VARIANT_I2,
            (b'U', b'0') => VARIANT_U0,
            (b'H', b'0') => VARIANT_H0,
            _ => 0,
        };
        i += 2;
    }
    flags
}

// ─── Instruction records ────────────────────────────────────────────────

/// One instruction definition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    /// Instruction id (see the `II_*` constants in [`crate::ir`]).
    pub id: u32,
    /// Category.
    pub category: Category,
    /// Bitmap of allowed formats; bit *i* = `FORMAT_LIST[i]`.
    pub formats: u64,
    /// Template letter (`0xA`–`0xE`), 1 for tiny, 0 for multiple.
    pub tmpl: u32,
    /// Number of source operands.
    pub source_operands: u32,
    /// Operation code.
    pub op1: u32,
    /// Additional operation code.
    pub op2: u32,
    /// Operand types supported in general purpose registers (bit per
    /// [`crate::ir::OperandType::type_mask_bit`]).
    pub optypes_gp: u16,
    /// Operand types supported for scalars in vector registers.
    pub optypes_scalar: u16,
    /// Operand types supported for full vectors.
    pub optypes_vector: u16,
    /// Kind of immediate operand for single-format instructions (0 = none).
    pub imm_kind: u32,
    /// Interpreted template-variant flags (`VARIANT_*`).
    pub variant: u64,
    /// Lower-case mnemonic.
    pub name: String,
}

impl Instruction {
    /// Whether the instruction accepts the given operand-type mask bit in
    /// any register class.
    #[must_use]
    pub fn supports_type_bit(&self, bit: u16) -> bool {
        (self.optypes_gp | self.optypes_scalar | self.optypes_vector) & bit != 0
    }
}

/// The instruction table with its sorted lookup views.
#[derive(Debug, Clone, Default)]
pub struct InstructionTable {
    /// Definitions in description order.
    defs: Vec<Instruction>,
    /// Indices sorted by name.
    by_name: Vec<u32>,
    /// Indices sorted by id.
    by_id: Vec<u32>,
    /// Indices sorted by (category, op1, op2) — the disassembler view.
    by_decode: Vec<u32>,
}

impl InstructionTable {
    /// Parse an instruction description.
    ///
    /// Empty lines and lines starting with `//` or `#` are skipped. Each
    /// remaining line must have at least 13 comma-separated columns.
    ///
    /// # Errors
    ///
    /// Returns [`AsmError::BadObjectFile`]-style syntax errors with the
    /// offending line number when a column is missing or a number is
    /// malformed.
    pub fn from_csv(text: &str) -> Result<Self, AsmError> {
        let mut defs = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            if cols.len() < 13 {
                return Err(AsmError::Syntax {
                    msg: format!(
                        "instruction description line {}: expected 13 columns, found {}",
                        lineno + 1,
                        cols.len()
                    ),
                    span: Span::dummy(),
                });
            }
            let num = |i: usize| -> Result<u64, AsmError> {
                interpret_number(cols[i]).ok_or_else(|| AsmError::Syntax {
                    msg: format!(
                        "instruction description line {}: malformed number '{}'",
                        lineno + 1,
                        cols[i]
                    ),
                    span: Span::dummy(),
                })
            };
            let category =
                Category::from_code(num(1)? as u32).ok_or_else(|| AsmError::Syntax {
                    msg: format!(
                        "instruction description line {}: unknown category '{}'",
                        lineno + 1,
                        cols[1]
                    ),
                    span: Span::dummy(),
                })?;
            defs.push(Instruction {
                id: num(0)? as u32,
                category,
                formats: num(2)?,
                tmpl: num(3)? as u32,
                source_operands: num(4)? as u32,
                op1: num(5)? as u32,
                op2: num(6)? as u32,
                optypes_gp: num(7)? as u16,
                optypes_scalar: num(8)? as u16,
                optypes_vector: num(9)? as u16,
                imm_kind: num(10)? as u32,
                variant: interpret_template_variants(cols[11]),
                name: cols[12].to_ascii_lowercase(),
            });
        }
        Ok(Self::from_defs(defs))
    }

    fn from_defs(defs: Vec<Instruction>) -> Self {
        let mut by_name: Vec<u32> = (0..defs.len() as u32).collect();
        by_name.sort_by(|&a, &b| defs[a as usize].name.cmp(&defs[b as usize].name));
        let mut by_id: Vec<u32> = (0..defs.len() as u32).collect();
        by_id.sort_by_key(|&i| defs[i as usize].id);
        let mut by_decode: Vec<u32> = (0..defs.len() as u32).collect();
        by_decode.sort_by_key(|&i| {
            let d = &defs[i as usize];
            (d.category, d.op1, d.op2)
        });
        Self {
            defs,
            by_name,
            by_id,
            by_decode,
        }
    }

    /// The built-in description of the standard instruction set.
    ///
    /// # Panics
    ///
    /// Never in practice: the built-in description is a compile-time
    /// constant validated by the test suite.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_csv(BUILTIN_TABLE).expect("built-in instruction description is well-formed")
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// The definition at a table index.
    #[must_use]
    pub fn get(&self, index: u32) -> &Instruction {
        &self.defs[index as usize]
    }

    /// Find a definition index by (case-insensitive) mnemonic.
    #[must_use]
    pub fn find_name(&self, name: &str) -> Option<u32> {
        let mut lowered = [0u8; 32];
        if name.len() > lowered.len() {
            return None;
        }
        let lowered = &mut lowered[..name.len()];
        lowered.copy_from_slice(name.as_bytes());
        lowered.make_ascii_lowercase();
        let lowered = core::str::from_utf8(lowered).ok()?;
        self.by_name
            .binary_search_by(|&i| self.defs[i as usize].name.as_str().cmp(lowered))
            .ok()
            .map(|pos| self.by_name[pos])
    }

    /// Find a definition index by instruction id.
    #[must_use]
    pub fn find_id(&self, id: u32) -> Option<u32> {
        self.by_id
            .binary_search_by_key(&id, |&i| self.defs[i as usize].id)
            .ok()
            .map(|pos| self.by_id[pos])
    }

    /// Find a definition by (category, op1, op2) — the disassembler's
    /// reverse lookup.
    #[must_use]
    pub fn find_decode(&self, category: Category, op1: u32, op2: u32) -> Option<&Instruction> {
        self.by_decode
            .binary_search_by_key(&(category, op1, op2), |&i| {
                let d = &self.defs[i as usize];
                (d.category, d.op1, d.op2)
            })
            .ok()
            .map(|pos| &self.defs[self.by_decode[pos] as usize])
    }

    /// Iterate all definitions.
    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.defs.iter()
    }
}

/// Interpret a decimal, hexadecimal (`0x`), binary (`0b`), or octal (`0o`)
/// number from the instruction description. Returns `None` on malformed
/// input or an empty column.
#[must_use]
pub fn interpret_number(text: &str) -> Option<u64> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let (digits, radix) = if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))
    {
        (rest, 16)
    } else if let Some(rest) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        (rest, 2)
    } else if let Some(rest) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        (rest, 8)
    } else {
        (t, 10)
    };
    u64::from_str_radix(digits, radix).ok()
}

// Built-in instruction description, 13 columns:
// id, category, formats, template, source operands, op1, op2,
// optypes gp, optypes scalar, optypes vector, immediate kind, variant, name
//
// Format bitmaps reference FORMAT_LIST in crate::format:
//   0xF3CF  = all multi-format slots (register, immediate, memory; 1-3 words)
//   0xA28C  = the memory-operand slots only
//   0x0820  = 24-bit and 32-bit direct jump offsets
//   0x0C10  = register jumps (8-bit, 16-bit, 32-bit offsets)
//   0x10C10 = register jumps plus the 32-bit-immediate compare form
//   0x10400 = combined arithmetic-and-jump forms
static BUILTIN_TABLE: &str = "\
// multi-format operations
1,       3, 0xA28C,  0, 1, 1,  0, 0x1F, 0xC0, 0x1DF, 0, M0, store
2,       3, 0xF3CF,  0, 1, 2,  0, 0x1F, 0xC0, 0x1DF, 0, ,   move
7,       3, 0xF3CF,  0, 2, 7,  0, 0x1F, 0xC0, 0x1DF, 0, ,   compare
8,       3, 0xF3CF,  0, 2, 8,  0, 0x1F, 0xC0, 0x1DF, 0, ,   add
9,       3, 0xF3CF,  0, 2, 9,  0, 0x1F, 0xC0, 0x1DF, 0, ,   sub
11,      3, 0xF3CF,  0, 2, 11, 0, 0x1F, 0xC0, 0x1DF, 0, ,   mul
16,      3, 0xF3CF,  0, 2, 16, 0, 0x1F, 0xC0, 0x1DF, 0, ,   div
17,      3, 0xF3CF,  0, 2, 17, 0, 0x0F, 0,    0x01F, 0, U0,  div_u
20,      3, 0xF3CF,  0, 2, 20, 0, 0x0F, 0,    0x01F, 0, ,   rem
21,      3, 0xF3CF,  0, 2, 21, 0, 0x0F, 0,    0x01F, 0, U0,  rem_u
22,      3, 0xF3CF,  0, 2, 22, 0, 0x1F, 0xC0, 0x1DF, 0, ,   min
24,      3, 0xF3CF,  0, 2, 24, 0, 0x1F, 0xC0, 0x1DF, 0, ,   max
28,      3, 0xF3CF,  0, 2, 28, 0, 0x1F, 0,    0x01F, 0, ,   and
30,      3, 0xF3CF,  0, 2, 30, 0, 0x1F, 0,    0x01F, 0, ,   or
31,      3, 0xF3CF,  0, 2, 31, 0, 0x1F, 0,    0x01F, 0, ,   xor
32,      3, 0xF3CF,  0, 2, 32, 0, 0x0F, 0,    0x00F, 0, ,   shift_left
34,      3, 0xF3CF,  0, 2, 34, 0, 0x0F, 0,    0x00F, 0, ,   shift_right_s
35,      3, 0xF3CF,  0, 2, 35, 0, 0x0F, 0,    0x00F, 0, U0,  shift_right_u
// direct jumps and calls
0x100000, 4, 0x0820, 0, 0, 0,  0, 0x0F, 0, 0, 0, D0, jump
0x100100, 4, 0x0820, 0, 0, 1,  0, 0x0F, 0, 0, 0, D0, call
0x100200, 4, 0x0020, 0, 0, 2,  0, 0x0F, 0, 0, 0, D0, return
0x100300, 4, 0x80000, 0, 1, 3, 0, 0x0F, 0, 0, 0, D1, jump_indirect
// conditional jumps testing one register
0x100400, 4, 0x0C10, 0, 1, 4,  0, 0x0F, 0, 0, 0, D1, jump_zero
0x100500, 4, 0x0C10, 0, 1, 5,  0, 0x0F, 0, 0, 0, D1, jump_notzero
0x100600, 4, 0x0C10, 0, 1, 6,  0, 0x0F, 0, 0, 0, D1, jump_positive
0x100700, 4, 0x0C10, 0, 1, 7,  0, 0x0F, 0, 0, 0, D1, jump_notpositive
0x100800, 4, 0x0C10, 0, 1, 8,  0, 0x0F, 0, 0, 0, D1, jump_negative
0x100900, 4, 0x0C10, 0, 1, 9,  0, 0x0F, 0, 0, 0, D1, jump_notnegative
// compare-and-jump on two operands
0x101000, 4, 0x10C10, 0, 2, 16, 0, 0x0F, 0, 0, 0, D1, jump_equal
0x101100, 4, 0x10C10, 0, 2, 17, 0, 0x0F, 0, 0, 0, D1, jump_nequal
0x101200, 4, 0x10C10, 0, 2, 18, 0, 0x0F, 0, 0, 0, D1, jump_sbelow
0x101300, 4, 0x10C10, 0, 2, 19, 0, 0x0F, 0, 0, 0, D1, jump_saboveeq
0x101400, 4, 0x10C10, 0, 2, 20, 0, 0x0F, 0, 0, 0, D1, jump_sabove
0x101500, 4, 0x10C10, 0, 2, 21, 0, 0x0F, 0, 0, 0, D1, jump_sbeloweq
0x101600, 4, 0x10C10, 0, 2, 22, 0, 0x0F, 0, 0, 0, D1U0, jump_below
0x101700, 4, 0x10C10, 0, 2, 23, 0, 0x0F, 0, 0, 0, D1U0, jump_aboveeq
0x101800, 4, 0x10C10, 0, 2, 24, 0, 0x0F, 0, 0, 0, D1U0, jump_above
0x101900, 4, 0x10C10, 0, 2, 25, 0, 0x0F, 0, 0, 0, D1U0, jump_beloweq
// combined arithmetic-and-jump
0x102000, 4, 0x10400, 0, 2, 32, 0, 0x0F, 0, 0, 0, D1, add_jump_zero
0x102100, 4, 0x10400, 0, 2, 33, 0, 0x0F, 0, 0, 0, D1, add_jump_notzero
0x102200, 4, 0x10400, 0, 2, 34, 0, 0x0F, 0, 0, 0, D1, sub_jump_zero
0x102300, 4, 0x10400, 0, 2, 35, 0, 0x0F, 0, 0, 0, D1, sub_jump_notzero
0x102400, 4, 0x10C10, 0, 2, 36, 0, 0x0F, 0, 0, 0, D1U0, increment_jump_below
0x102500, 4, 0x10C10, 0, 2, 37, 0, 0x0F, 0, 0, 0, D1U0, increment_jump_aboveeq
0x102800, 4, 0x0C10, 0, 1, 40, 0, 0x0F, 0, 0, 0, D1, sub_maxlen_jump_positive
0x102900, 4, 0x0C10, 0, 1, 41, 0, 0x0F, 0, 0, 0, D1, sub_maxlen_jump_notpositive
// tiny
0x30000, 2, 0x20000, 1, 0, 0,  0, 0, 0, 0, 0, D0, nop
0x30006, 2, 0x20000, 1, 1, 6,  0, 0x0F, 0, 0, 0, , push
0x30007, 2, 0x20000, 1, 0, 7,  0, 0x0F, 0, 0, 0, , pop
// single format
0x40001, 1, 0x40000, 0xB, 0, 57, 0, 0, 0, 0, 0, D0, breakpoint
0x40002, 1, 0x40000, 0xB, 0, 58, 0, 0, 0, 0, 0, D0, fence
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FORMAT_LIST;
    use crate::ir::{self, Category};

    #[test]
    fn builtin_parses() {
        let tab = InstructionTable::builtin();
        assert!(tab.len() > 40);
    }

    #[test]
    fn find_by_name_case_insensitive() {
        let tab = InstructionTable::builtin();
        let add = tab.find_name("ADD").expect("add exists");
        assert_eq!(tab.get(add).id, ir::II_ADD);
        assert!(tab.find_name("no_such_op").is_none());
    }

    #[test]
    fn find_by_id() {
        let tab = InstructionTable::builtin();
        let idx = tab.find_id(ir::II_JUMP_EQUAL).expect("jump_equal exists");
        assert_eq!(tab.get(idx).name, "jump_equal");
        assert_eq!(tab.get(idx).op1, ir::jump_op1(ir::II_JUMP_EQUAL));
    }

    #[test]
    fn decode_view_finds_every_definition() {
        let tab = InstructionTable::builtin();
        for def in tab.iter() {
            let found = tab
                .find_decode(def.category, def.op1, def.op2)
                .expect("decode lookup");
            assert_eq!(found.id, def.id);
        }
    }

    #[test]
    fn ids_match_op1_for_jumps() {
        let tab = InstructionTable::builtin();
        for def in tab.iter().filter(|d| d.category == Category::Jump) {
            assert_eq!(ir::jump_op1(def.id), def.op1, "{}", def.name);
            assert!(ir::is_jump_id(def.id), "{}", def.name);
        }
    }

    #[test]
    fn format_bitmaps_reference_live_formats() {
        let tab = InstructionTable::builtin();
        for def in tab.iter() {
            assert_ne!(def.formats, 0, "{} has empty format bitmap", def.name);
            for (i, f) in FORMAT_LIST.iter().enumerate() {
                if def.formats & (1 << i) != 0 {
                    assert_eq!(
                        f.category, def.category,
                        "{} references format {} of another category",
                        def.name, i
                    );
                }
            }
            // No bits past the table end.
            assert_eq!(def.formats >> FORMAT_LIST.len(), 0, "{}", def.name);
        }
    }

    #[test]
    fn invert_bit_pairs_conditions() {
        let tab = InstructionTable::builtin();
        for (a, b) in [
            ("jump_zero", "jump_notzero"),
            ("jump_equal", "jump_nequal"),
            ("jump_sbelow", "jump_saboveeq"),
            ("sub_maxlen_jump_positive", "sub_maxlen_jump_notpositive"),
        ] {
            let ia = tab.get(tab.find_name(a).unwrap()).id;
            let ib = tab.get(tab.find_name(b).unwrap()).id;
            assert_eq!(ia ^ ir::II_JUMP_INVERT, ib);
        }
    }

    #[test]
    fn interpret_number_radixes() {
        assert_eq!(interpret_number("42"), Some(42));
        assert_eq!(interpret_number("0x2A"), Some(42));
        assert_eq!(interpret_number("0b101010"), Some(42));
        assert_eq!(interpret_number("0o52"), Some(42));
        assert_eq!(interpret_number(""), None);
        assert_eq!(interpret_number("4x2"), None);
    }

    #[test]
    fn variant_parsing() {
        assert_eq!(interpret_template_variants("M0"), VARIANT_M0);
        assert_eq!(
            interpret_template_variants("D1U0"),
            VARIANT_D1 | VARIANT_U0
        );
        assert_eq!(interpret_template_variants(""), 0);
        // Unknown pairs are tolerated.
        assert_eq!(interpret_template_variants("Z9"), 0);
    }

    #[test]
    fn csv_rejects_short_lines() {
        let err = InstructionTable::from_csv("1,2,3").unwrap_err();
        assert!(matches!(err, AsmError::Syntax { .. }));
    }
}
