//! Relocatable object files.
//!
//! A compact 64-bit little-endian container in the spirit of the ELF
//! object layout: section records with read/write/execute/uninitialized
//! flags and alignment, a symbol table, and relocation records
//! (absolute, self-relative, and symbol-difference with a scale).
//! Relocations and symbols reference each other by name so the container
//! survives symbol-table compaction.
//!
//! The container is what the assembler emits and the disassembler
//! consumes; the full ELF dressing (program headers, section-header
//! string tables) belongs to an outer layer.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::error::AsmError;
use crate::symtab::{Binding, NamedRelocation, RelocKind, SymbolKind};

/// Container magic: `"FWCO"`.
pub const MAGIC: [u8; 4] = *b"FWCO";
/// Container format version.
pub const VERSION: u32 = 1;

/// One section of an object file.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectSection {
    /// Section name.
    pub name: String,
    /// `SHF_*` flag bits (see [`crate::ir`]).
    pub flags: u32,
    /// Alignment in bytes (power of two, at most 4096).
    pub align: u32,
    /// Section bytes. Empty for uninitialized sections.
    pub data: Vec<u8>,
    /// Section size; exceeds `data.len()` for uninitialized sections.
    pub size: u64,
}

/// One symbol of an object file.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectSymbol {
    /// Symbol name.
    pub name: String,
    /// 1-based section index; 0 = undefined (external).
    pub section: u32,
    /// Address relative to the section start, or constant value.
    pub value: i64,
    /// Size in bytes when known.
    pub size: u64,
    /// Linker binding.
    pub binding: Binding,
    /// What the symbol names.
    pub kind: SymbolKind,
    /// The value is a constant rather than an address.
    pub constant: bool,
}

/// A relocatable object file.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectFile {
    /// Sections in emission order. Symbol and relocation `section` fields
    /// are 1-based indices into this vector.
    pub sections: Vec<ObjectSection>,
    /// Symbol table.
    pub symbols: Vec<ObjectSymbol>,
    /// Relocation records.
    pub relocations: Vec<NamedRelocation>,
}

impl ObjectFile {
    /// Find a section index (1-based) by name.
    #[must_use]
    pub fn find_section(&self, name: &str) -> Option<u32> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32 + 1)
    }

    /// Find a symbol by name.
    #[must_use]
    pub fn find_symbol(&self, name: &str) -> Option<&ObjectSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Serialize into the container byte format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.bytes(&MAGIC);
        w.u32(VERSION);
        w.u32(self.sections.len() as u32);
        w.u32(self.symbols.len() as u32);
        w.u32(self.relocations.len() as u32);
        for s in &self.sections {
            w.str(&s.name);
            w.u32(s.flags);
            w.u32(s.align);
            w.u64(s.size);
            w.u32(s.data.len() as u32);
            w.bytes(&s.data);
        }
        for s in &self.symbols {
            w.str(&s.name);
            w.u32(s.section);
            w.u64(s.value as u64);
            w.u64(s.size);
            w.u8(match s.binding {
                Binding::Local => 0,
                Binding::Global => 1,
                Binding::Weak => 2,
            });
            w.u8(match s.kind {
                SymbolKind::None => 0,
                SymbolKind::Function => 1,
                SymbolKind::Object => 2,
                SymbolKind::Section => 3,
            });
            w.u8(u8::from(s.constant));
        }
        for r in &self.relocations {
            w.u32(r.section);
            w.u32(r.offset);
            w.str(&r.symbol);
            w.u64(r.addend as u64);
            let (tag, size, scale) = match r.kind {
                RelocKind::Abs { size } => (0u8, size, 1),
                RelocKind::Rel { size, scale } => (1, size, scale),
                RelocKind::Diff { size, scale } => (2, size, scale),
            };
            w.u8(tag);
            w.u8(size);
            w.u8(scale);
            match &r.ref_sym {
                Some(name) => {
                    w.u8(1);
                    w.str(name);
                }
                None => w.u8(0),
            }
        }
        w.buf
    }

    /// Parse the container byte format.
    ///
    /// # Errors
    ///
    /// Returns [`AsmError::BadObjectFile`] on a wrong magic, unsupported
    /// version, or truncated input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AsmError> {
        let mut r = Reader { buf: bytes, pos: 0 };
        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(AsmError::BadObjectFile {
                msg: String::from("wrong magic"),
            });
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(AsmError::BadObjectFile {
                msg: format!("unsupported version {}", version),
            });
        }
        let nsec = r.u32()? as usize;
        let nsym = r.u32()? as usize;
        let nrel = r.u32()? as usize;
        let mut out = ObjectFile::default();
        for _ in 0..nsec {
            let name = r.str()?;
            let flags = r.u32()?;
            let align = r.u32()?;
            let size = r.u64()?;
            let dlen = r.u32()? as usize;
            let data = r.take(dlen)?.to_vec();
            out.sections.push(ObjectSection {
                name,
                flags,
                align,
                data,
                size,
            });
        }
        for _ in 0..nsym {
            let name = r.str()?;
            let section = r.u32()?;
            let value = r.u64()? as i64;
            let size = r.u64()?;
            let binding = match r.u8()? {
                0 => Binding::Local,
                1 => Binding::Global,
                2 => Binding::Weak,
                other => {
                    return Err(AsmError::BadObjectFile {
                        msg: format!("unknown binding {}", other),
                    })
                }
            };
            let kind = match r.u8()? {
                0 => SymbolKind::None,
                1 => SymbolKind::Function,
                2 => SymbolKind::Object,
                3 => SymbolKind::Section,
                other => {
                    return Err(AsmError::BadObjectFile {
                        msg: format!("unknown symbol kind {}", other),
                    })
                }
            };
            let constant = r.u8()? != 0;
            out.symbols.push(ObjectSymbol {
                name,
                section,
                value,
                size,
                binding,
                kind,
                constant,
            });
        }
        for _ in 0..nrel {
            let section = r.u32()?;
            let offset = r.u32()?;
            let symbol = r.str()?;
            let addend = r.u64()? as i64;
            let tag = r.u8()?;
            let size = r.u8()?;
            let scale = r.u8()?;
            let kind = match tag {
                0 => RelocKind::Abs { size },
                1 => RelocKind::Rel { size, scale },
                2 => RelocKind::Diff { size, scale },
                other => {
                    return Err(AsmError::BadObjectFile {
                        msg: format!("unknown relocation kind {}", other),
                    })
                }
            };
            let ref_sym = if r.u8()? != 0 { Some(r.str()?) } else { None };
            out.relocations.push(NamedRelocation {
                section,
                offset,
                symbol,
                addend,
                kind,
                ref_sym,
            });
        }
        if r.pos != bytes.len() {
            return Err(AsmError::BadObjectFile {
                msg: String::from("trailing bytes after container"),
            });
        }
        Ok(out)
    }
}

// ─── Little-endian writer / reader ──────────────────────────────────────

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], AsmError> {
        if self.pos + n > self.buf.len() {
            return Err(AsmError::BadObjectFile {
                msg: String::from("truncated container"),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, AsmError> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> Result<u32, AsmError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&mut self) -> Result<u64, AsmError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
    fn str(&mut self) -> Result<String, AsmError> {
        let n = self.u32()? as usize;
        let b = self.take(n)?;
        core::str::from_utf8(b)
            .map(String::from)
            .map_err(|_| AsmError::BadObjectFile {
                msg: String::from("invalid string encoding"),
            })
    }
}
