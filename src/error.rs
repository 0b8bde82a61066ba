//! Error types for the flapc compiler

use thiserror::Error;

/// Compiler errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Frontend errors
    /// Lexical error in the source text
    ///
    /// **Triggered by:** malformed tokens (unterminated string, bad number)
    #[error("{file}:{line}:{col}: lex error: {message}")]
    Lex {
        /// Source file name
        file: String,
        /// Line number where the error occurred
        line: usize,
        /// Column number where the error occurred
        col: usize,
        /// Error description
        message: String,
    },

    /// Syntax error during parsing
    #[error("{file}:{line}:{col}: parse error: {message}")]
    Parse {
        /// Source file name
        file: String,
        /// Line number where the error occurred
        line: usize,
        /// Column number where the error occurred
        col: usize,
        /// Error description
        message: String,
    },

    /// Unexpected end of file during parsing
    #[error("unexpected end of file")]
    UnexpectedEof,

    // Semantic errors
    /// Symbol not found in user code or imports
    ///
    /// **Triggered by:** calling or reading a name that is neither a local,
    /// a user function, a builtin, nor a resolved dynamic import
    #[error("{file}:{line}:{col}: unresolved symbol `{name}`{}", suggestion.as_deref().map(|s| format!(" ({s})")).unwrap_or_default())]
    UnresolvedSymbol {
        /// Source file name
        file: String,
        /// Line number of the reference
        line: usize,
        /// Column number of the reference
        col: usize,
        /// The unresolved name
        name: String,
        /// Optional hint shown after the message
        suggestion: Option<String>,
    },

    /// Signature violation at an FFI call site
    #[error("{file}:{line}:{col}: type mismatch calling `{name}`: {message}")]
    TypeMismatch {
        /// Source file name
        file: String,
        /// Line number of the call
        line: usize,
        /// Column number of the call
        col: usize,
        /// Imported function name
        name: String,
        /// What was violated
        message: String,
    },

    /// A match produced a value on some arm but carries no `~>` default
    #[error("{file}:{line}:{col}: match used as an expression requires a `~>` default arm")]
    MissingDefaultArm {
        /// Source file name
        file: String,
        /// Line number of the match
        line: usize,
        /// Column number of the match
        col: usize,
    },

    /// A well-formed program that breaks a compilation rule
    ///
    /// **Triggered by:** `break`/`continue` outside a loop, wrong builtin
    /// or channel-operation arity, an uncallable callee, an invalid
    /// atomic target
    #[error("{file}:{line}:{col}: {message}")]
    Semantic {
        /// Source file name
        file: String,
        /// Line number of the offending construct
        line: usize,
        /// Column number of the offending construct
        col: usize,
        /// The rule that was violated
        message: String,
    },

    // Backend errors
    /// A relocation displacement does not fit its field
    ///
    /// **Triggered by:** a branch or PC-relative reference whose distance
    /// exceeds the field width (rel32, BL26, JAL21)
    #[error("relocation overflow: {kind} displacement {disp:#x} exceeds {bits}-bit field")]
    RelocationOverflow {
        /// Relocation kind name
        kind: &'static str,
        /// The displacement that did not fit
        disp: i64,
        /// Width of the target field in bits
        bits: u8,
    },

    /// Spill slots exceeded the stack-frame budget
    #[error("stack frame overflow: {needed} bytes of spill slots exceed the {budget}-byte budget")]
    StackFrameOverflow {
        /// Bytes the frame would need
        needed: usize,
        /// Configured frame budget
        budget: usize,
    },

    /// Requested target is not fully supported
    #[error("unsupported target: {0}")]
    Unsupported(String),

    /// Invariant violation inside the compiler; always fatal
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure reading source or writing the image
    #[error("i/o error on {path}: {message}")]
    Io {
        /// Path involved in the failure
        path: String,
        /// OS error text
        message: String,
    },
}

/// Exit-code classification per the CLI contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// User-caused error (exit code 1)
    User,
    /// Compiler-internal error (exit code 2)
    Internal,
}

impl Error {
    /// Create an internal error with a message
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an unsupported-target error with a message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Classify this error for the process exit code
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::Internal(_) | Error::Io { .. } => ErrorClass::Internal,
            _ => ErrorClass::User,
        }
    }

    /// Exit code mandated by the CLI contract
    pub fn exit_code(&self) -> i32 {
        match self.classify() {
            ErrorClass::User => 1,
            ErrorClass::Internal => 2,
        }
    }
}

/// Result type for flapc operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_exit_one() {
        let err = Error::Parse {
            file: "t.flap".into(),
            line: 3,
            col: 7,
            message: "expected `)`".into(),
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().starts_with("t.flap:3:7"));
    }

    #[test]
    fn internal_errors_exit_two() {
        assert_eq!(Error::internal("sealed section written").exit_code(), 2);
    }

    #[test]
    fn semantic_errors_exit_one_with_position() {
        let err = Error::Semantic {
            file: "t.flap".into(),
            line: 4,
            col: 2,
            message: "`break` outside a loop".into(),
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().starts_with("t.flap:4:2"));
    }

    #[test]
    fn unresolved_symbol_carries_suggestion() {
        let err = Error::UnresolvedSymbol {
            file: "t.flap".into(),
            line: 1,
            col: 1,
            name: "prinltn".into(),
            suggestion: Some("did you mean `println`?".into()),
        };
        assert!(err.to_string().contains("did you mean"));
    }
}
