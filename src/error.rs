//! Error types, source span tracking, and the assembly diagnostics collector.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Source location for diagnostics.
///
/// Tracks the line, column, byte offset, and length of a token or construct
/// in the original assembly source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number (byte offset within line).
    pub col: u32,
    /// 0-based byte offset from start of source.
    pub offset: usize,
    /// Byte length of the spanned region.
    pub len: usize,
}

impl Span {
    /// Create a new span.
    #[must_use]
    pub fn new(line: u32, col: u32, offset: usize, len: usize) -> Self {
        Self {
            line,
            col,
            offset,
            len,
        }
    }

    /// A dummy span for generated/internal constructs.
    #[must_use]
    pub fn dummy() -> Self {
        Self {
            line: 0,
            col: 0,
            offset: 0,
            len: 0,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// The pass during which a diagnostic was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Pass {
    /// Pass 1 — tokenize, find section and symbol names.
    Tokenize,
    /// Pass 2 — classify lines, evaluate meta directives, resolve names.
    Classify,
    /// Pass 3 — interpret statements, select instruction formats.
    Generate,
    /// Pass 4 — resolve addresses, iterate until sizes converge.
    Resolve,
    /// Pass 5 — emit section bytes, relocations, and the object file.
    Emit,
    /// Disassembly.
    Disassemble,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Pass::Tokenize => "1",
            Pass::Classify => "2",
            Pass::Generate => "3",
            Pass::Resolve => "4",
            Pass::Emit => "5",
            Pass::Disassemble => "D",
        };
        write!(f, "pass {}", n)
    }
}

/// Assembly error with source location and descriptive message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsmError {
    /// An illegal character outside any literal.
    IllegalCharacter {
        /// The offending character.
        ch: char,
        /// Source location of the character.
        span: Span,
    },

    /// A string, character literal, or block comment without a closing
    /// delimiter.
    Unterminated {
        /// What was left open ("string", "character literal", "comment").
        what: &'static str,
        /// Source location where the construct started.
        span: Span,
    },

    /// A numeric literal that could not be interpreted.
    MalformedNumber {
        /// The literal text.
        text: String,
        /// Source location of the literal.
        span: Span,
    },

    /// Syntax error during parsing (unexpected token, stray directive, …).
    Syntax {
        /// The syntax error message.
        msg: String,
        /// Source location of the syntax error.
        span: Span,
    },

    /// An opening bracket or brace without a matching close (or vice versa).
    UnmatchedBracket {
        /// The bracket character.
        bracket: char,
        /// Source location of the bracket.
        span: Span,
    },

    /// Referenced symbol was never defined.
    UndefinedSymbol {
        /// The undefined symbol name.
        name: String,
        /// Source location of the reference.
        span: Span,
    },

    /// Symbol was defined more than once (a reference followed by a
    /// definition is legal; two definitions are not).
    DuplicateDefinition {
        /// The duplicated symbol name.
        name: String,
        /// Source location of the second definition.
        span: Span,
    },

    /// Operand types cannot be combined (e.g. float operand on an integer
    /// instruction, or a string where a register is required).
    TypeMismatch {
        /// Description of the mismatch.
        detail: String,
        /// Source location of the offending operand.
        span: Span,
    },

    /// A register of the wrong class (general purpose vs. vector vs.
    /// special) for the instruction.
    RegisterClass {
        /// Description of the mismatch.
        detail: String,
        /// Source location of the register.
        span: Span,
    },

    /// Immediate or data value exceeds the range of its declared type.
    ImmediateOverflow {
        /// The value that overflowed.
        value: i64,
        /// The declared type name.
        dtype: &'static str,
        /// Source location of the value.
        span: Span,
    },

    /// Division or modulo by zero in an assemble-time expression.
    DivisionByZero {
        /// Source location of the operator.
        span: Span,
    },

    /// Alignment request above the supported maximum (4096).
    AlignmentTooLarge {
        /// The requested alignment.
        requested: u64,
        /// Source location of the align directive.
        span: Span,
    },

    /// No instruction format accommodates the given operand combination.
    NoFormatFits {
        /// The instruction mnemonic.
        mnemonic: String,
        /// Specific cause reported by the encoding selector.
        cause: String,
        /// Source location of the instruction.
        span: Span,
    },

    /// The address-resolution pass did not converge within the allowed
    /// number of iterations (should be unreachable: sizes grow
    /// monotonically and are bounded by the largest format).
    ConvergenceLimit {
        /// Maximum number of resolution iterations allowed.
        max: usize,
    },

    /// A configurable resource limit was exceeded (defense against DoS).
    ResourceLimitExceeded {
        /// Human-readable name of the resource (e.g. "statements").
        resource: String,
        /// The configured limit that was exceeded.
        limit: usize,
    },

    /// The object file container is malformed or truncated.
    BadObjectFile {
        /// Description of the problem.
        msg: String,
    },

    /// Multiple errors collected during assembly.
    Multiple {
        /// The collected assembly errors.
        errors: Vec<AsmError>,
    },
}

impl AsmError {
    /// The span the error points at, if it carries one.
    #[must_use]
    pub fn span(&self) -> Option<Span> {
        match self {
            AsmError::IllegalCharacter { span, .. }
            | AsmError::Unterminated { span, .. }
            | AsmError::MalformedNumber { span, .. }
            | AsmError::Syntax { span, .. }
            | AsmError::UnmatchedBracket { span, .. }
            | AsmError::UndefinedSymbol { span, .. }
            | AsmError::DuplicateDefinition { span, .. }
            | AsmError::TypeMismatch { span, .. }
            | AsmError::RegisterClass { span, .. }
            | AsmError::ImmediateOverflow { span, .. }
            | AsmError::DivisionByZero { span }
            | AsmError::AlignmentTooLarge { span, .. }
            | AsmError::NoFormatFits { span, .. } => Some(*span),
            _ => None,
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::IllegalCharacter { ch, span } => {
                write!(f, "{}: illegal character '{}'", span, ch.escape_default())
            }
            AsmError::Unterminated { what, span } => {
                write!(f, "{}: unterminated {}", span, what)
            }
            AsmError::MalformedNumber { text, span } => {
                write!(f, "{}: malformed number '{}'", span, text)
            }
            AsmError::Syntax { msg, span } => {
                write!(f, "{}: {}", span, msg)
            }
            AsmError::UnmatchedBracket { bracket, span } => {
                write!(f, "{}: unmatched '{}'", span, bracket)
            }
            AsmError::UndefinedSymbol { name, span } => {
                write!(f, "{}: undefined symbol '{}'", span, name)
            }
            AsmError::DuplicateDefinition { name, span } => {
                write!(f, "{}: duplicate definition of '{}'", span, name)
            }
            AsmError::TypeMismatch { detail, span } => {
                write!(f, "{}: type mismatch: {}", span, detail)
            }
            AsmError::RegisterClass { detail, span } => {
                write!(f, "{}: register class mismatch: {}", span, detail)
            }
            AsmError::ImmediateOverflow { value, dtype, span } => {
                write!(f, "{}: value {} out of range for {}", span, value, dtype)
            }
            AsmError::DivisionByZero { span } => {
                write!(f, "{}: division by zero", span)
            }
            AsmError::AlignmentTooLarge { requested, span } => {
                write!(
                    f,
                    "{}: alignment {} exceeds maximum of 4096",
                    span, requested
                )
            }
            AsmError::NoFormatFits {
                mnemonic,
                cause,
                span,
            } => {
                write!(
                    f,
                    "{}: no format fits '{}' with these operands: {}",
                    span, mnemonic, cause
                )
            }
            AsmError::ConvergenceLimit { max } => {
                write!(
                    f,
                    "address resolution exceeded maximum of {} iterations (possible oscillation)",
                    max
                )
            }
            AsmError::ResourceLimitExceeded { resource, limit } => {
                write!(f, "resource limit exceeded: {} (limit: {})", resource, limit)
            }
            AsmError::BadObjectFile { msg } => {
                write!(f, "bad object file: {}", msg)
            }
            AsmError::Multiple { errors } => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AsmError {}

/// A collected diagnostic: the error plus the pass that raised it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    /// The underlying error.
    pub error: AsmError,
    /// The pass during which the error was raised.
    pub pass: Pass,
}

/// Default cap on collected errors.
const DEFAULT_MAX_ERRORS: usize = 50;

/// Collector for assembly diagnostics.
///
/// Errors are appended as passes run; a line-level error marks the line as
/// failed but assembly of the remaining lines continues. When the cap is
/// reached, further errors are dropped (a counter still tracks them) so a
/// pathological input cannot flood the caller.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
    /// Total errors seen, including those dropped past the cap.
    seen: usize,
    max_errors: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Create an empty collector with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: Vec::new(),
            seen: 0,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }

    /// Override the error cap.
    pub fn set_max_errors(&mut self, max: usize) {
        self.max_errors = max;
    }

    /// Record an error raised in the given pass.
    pub fn report(&mut self, error: AsmError, pass: Pass) {
        self.seen += 1;
        if self.list.len() < self.max_errors {
            self.list.push(Diagnostic { error, pass });
        }
    }

    /// Number of errors recorded (capped).
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether any error was seen at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen == 0
    }

    /// Total errors seen, including those past the cap.
    #[must_use]
    pub fn total(&self) -> usize {
        self.seen
    }

    /// The collected diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.list
    }

    /// Consume the collector, returning `Err` in source order if any error
    /// was recorded, else `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`AsmError::Multiple`] wrapping every collected error when at
    /// least one was reported.
    pub fn into_result(mut self) -> Result<(), AsmError> {
        if self.seen == 0 {
            return Ok(());
        }
        // Source order, not discovery order: later passes may report errors
        // on earlier lines.
        self.list
            .sort_by_key(|d| d.error.span().map_or((0, 0), |s| (s.offset, s.len)));
        Err(AsmError::Multiple {
            errors: self.list.into_iter().map(|d| d.error).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_display() {
        let span = Span::new(3, 12, 45, 5);
        assert_eq!(format!("{}", span), "3:12");
    }

    #[test]
    fn span_dummy() {
        let span = Span::dummy();
        assert_eq!(span.line, 0);
        assert_eq!(span.col, 0);
    }

    #[test]
    fn error_undefined_symbol_display() {
        let err = AsmError::UndefinedSymbol {
            name: "my_label".into(),
            span: Span::new(10, 1, 100, 8),
        };
        assert_eq!(format!("{}", err), "10:1: undefined symbol 'my_label'");
    }

    #[test]
    fn error_immediate_overflow_display() {
        let err = AsmError::ImmediateOverflow {
            value: 1000,
            dtype: "int8",
            span: Span::new(5, 10, 50, 4),
        };
        assert_eq!(format!("{}", err), "5:10: value 1000 out of range for int8");
    }

    #[test]
    fn error_no_format_fits_display() {
        let err = AsmError::NoFormatFits {
            mnemonic: "add".into(),
            cause: "mask register not supported by any candidate".into(),
            span: Span::new(1, 1, 0, 3),
        };
        let s = format!("{}", err);
        assert!(s.contains("no format fits 'add'"));
        assert!(s.contains("mask register"));
    }

    #[test]
    fn diagnostics_cap() {
        let mut diags = Diagnostics::new();
        diags.set_max_errors(2);
        for i in 0..5 {
            diags.report(
                AsmError::DivisionByZero {
                    span: Span::new(i, 1, i as usize, 1),
                },
                Pass::Generate,
            );
        }
        assert_eq!(diags.len(), 2);
        assert_eq!(diags.total(), 5);
    }

    #[test]
    fn diagnostics_source_order() {
        let mut diags = Diagnostics::new();
        diags.report(
            AsmError::DivisionByZero {
                span: Span::new(9, 1, 90, 1),
            },
            Pass::Resolve,
        );
        diags.report(
            AsmError::DivisionByZero {
                span: Span::new(2, 1, 10, 1),
            },
            Pass::Generate,
        );
        let err = diags.into_result().unwrap_err();
        match err {
            AsmError::Multiple { errors } => {
                assert_eq!(errors[0].span().unwrap().offset, 10);
                assert_eq!(errors[1].span().unwrap().offset, 90);
            }
            other => panic!("expected Multiple, got {:?}", other),
        }
    }

    #[test]
    fn diagnostics_empty_ok() {
        assert!(Diagnostics::new().into_result().is_ok());
    }
}
