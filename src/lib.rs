//! # fcasm — ForwardCom Assembler and Disassembler
//!
//! `fcasm` is a pure Rust assembler and matching disassembler for the
//! ForwardCom instruction set: a load-store RISC-like ISA with
//! variable-length (1–3 word) encodings, vector support, predication
//! masks, and a structured relocatable object format.
//!
//! ## Quick Start
//!
//! ```rust
//! use fcasm::assemble;
//!
//! let obj = assemble(
//!     "section code execute\n\
//!      function f: public f\n\
//!      int32 r1 = r2 + 1\n\
//!      return\n\
//!      end\n",
//! )
//! .unwrap();
//! assert_eq!(obj.sections[0].data.len(), 8); // two one-word instructions
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C dependencies, no system assembler.
//! - **Multi-pass pipeline** — tokenize, classify, generate, resolve,
//!   emit; branch sizes grow monotonically until addresses converge.
//! - **Format selection** — the smallest encoding whose operand,
//!   immediate, address, and vector constraints all hold.
//! - **High-level lowering** — `if`/`while`/`do`/`for`/`switch` desugar
//!   to labels and conditional branches, with jump tables for dense
//!   switches.
//! - **Round-trip disassembly** — object files print as assembly that
//!   re-assembles to the same bytes.
//! - **`no_std` + `alloc`** — embeddable; `std` only adds the `Error`
//!   impl.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An assembler intentionally performs many narrowing / sign-changing casts
// between integer widths (i64→u8, u32→i8, etc.) and uses dense hex
// literals without separators (0xF3CF, 0x7C00).  The lints below are
// expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::redundant_closure_for_method_calls,
    clippy::bool_to_int_with_if,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::map_unwrap_or,
    clippy::many_single_char_names,
    clippy::redundant_else,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::needless_continue
)]

extern crate alloc;

/// Pass driver: the five-pass assembly session and its public API.
pub mod assembler;
/// Disassembler: format lookup, label synthesis, pretty-printing.
pub mod disasm;
/// Encoding selection: constant fitting and format matching.
pub mod encoder;
/// Error types, source spans, and the diagnostics collector.
pub mod error;
/// Assemble-time expression evaluator.
pub mod expr;
/// Instruction formats, templates, and the decode lookup trie.
pub mod format;
/// High-level-language lowering: blocks, loops, and switches.
pub mod hll;
/// Core data model: registers, operand types, ids, line records.
pub mod ir;
/// The instruction table and its description reader.
pub mod itable;
/// Lexer and keyword/operator/register tables.
pub mod lexer;
/// Relocatable object files and their binary container.
pub mod object;
/// Local instruction optimizations (negated immediates, jump merge).
pub mod optimize;
/// Statement-level interpretation and meta directives.
pub mod parser;
/// Symbol table, name buffer, and relocation records.
pub mod symtab;

// Re-exports
pub use assembler::{Assembler, AssemblyResult, ResourceLimits};
pub use disasm::Disassembler;
pub use error::{AsmError, Diagnostics, Pass, Span};
pub use ir::{Category, OperandType, Register};
pub use itable::InstructionTable;
pub use object::{ObjectFile, ObjectSection, ObjectSymbol};
pub use symtab::{Binding, NamedRelocation, RelocKind, SymbolKind};

/// Assemble a source string into a relocatable object file.
///
/// # Errors
///
/// Returns [`AsmError`] (usually [`AsmError::Multiple`] in source order)
/// when the input contains lexical, syntactic, semantic, or encoding
/// errors.
///
/// # Examples
///
/// ```rust
/// use fcasm::assemble;
///
/// let obj = assemble("section code execute\nfunction f: public f\nreturn\nend\n").unwrap();
/// assert!(obj.find_symbol("f").is_some());
/// ```
pub fn assemble(source: &str) -> Result<ObjectFile, AsmError> {
    let mut asm = Assembler::new();
    asm.emit(source);
    Ok(asm.finish()?.into_object())
}

/// Disassemble an object file into assembly text.
///
/// The listing re-assembles to the same section bytes (comments and
/// synthesized local names aside).
///
/// # Errors
///
/// Returns [`AsmError::BadObjectFile`] for structurally broken inputs.
///
/// # Examples
///
/// ```rust
/// use fcasm::{assemble, disassemble};
///
/// let obj = assemble("section code execute\nfunction f: public f\nreturn\nend\n").unwrap();
/// let text = disassemble(&obj).unwrap();
/// assert!(text.contains("function f:"));
/// ```
pub fn disassemble(object: &ObjectFile) -> Result<alloc::string::String, AsmError> {
    disasm::disassemble(object)
}
