use std::{borrow::Cow, fmt};

use crate::parse::CodeRange;

/// Errors raised while compiling a module to a class file.
///
/// Semantic errors abort the whole module's compilation with a source
/// position; nothing is written to the output artifact once one is raised.
/// Internal errors indicate defects in the compiler itself (unresolved label
/// patches, slot double-frees) and should never occur from valid input.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// Error in syntax, reported by the front-end parser.
    Syntax {
        msg: Cow<'static, str>,
        position: CodeRange,
    },
    /// Illegal name use or structure: reserved-name assignment, late `global`
    /// declarations, valued `return` inside a generator, `break`/`continue`
    /// outside a loop, scoping violations.
    Semantic {
        msg: Cow<'static, str>,
        position: CodeRange,
    },
    /// Missing feature we hope to implement in the future.
    /// Message gets prefixed with "the javelin compiler does not yet support ".
    NotImplemented {
        msg: Cow<'static, str>,
        position: CodeRange,
    },
    /// A generated method exceeded the class format's per-method code limit.
    /// Recoverable only through the precompiled-blob fallback.
    Capacity { msg: Cow<'static, str> },
    /// A defect in the code generator itself, not a user-facing diagnostic.
    Internal { msg: Cow<'static, str> },
}

impl CompileError {
    pub(crate) fn syntax(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::Syntax {
            msg: msg.into(),
            position,
        }
    }

    pub(crate) fn semantic(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::Semantic {
            msg: msg.into(),
            position,
        }
    }

    pub(crate) fn not_implemented(msg: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::NotImplemented {
            msg: msg.into(),
            position,
        }
    }

    pub(crate) fn capacity(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Capacity { msg: msg.into() }
    }

    pub(crate) fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal { msg: msg.into() }
    }

    /// True for per-method size overflows, which the compiler can recover
    /// from when a precompiled fallback body is available.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }

    /// Returns the source position this error points at, when it has one.
    #[must_use]
    pub fn position(&self) -> Option<CodeRange> {
        match self {
            Self::Syntax { position, .. } | Self::Semantic { position, .. } | Self::NotImplemented { position, .. } => {
                Some(*position)
            }
            Self::Capacity { .. } | Self::Internal { .. } => None,
        }
    }

    /// Returns the error message without location or category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Syntax { msg, .. }
            | Self::Semantic { msg, .. }
            | Self::NotImplemented { msg, .. }
            | Self::Capacity { msg }
            | Self::Internal { msg } => msg,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { msg, position } => write!(f, "syntax error: {msg} (line {})", position.start().line),
            Self::Semantic { msg, position } => write!(f, "{msg} (line {})", position.start().line),
            Self::NotImplemented { msg, position } => write!(
                f,
                "the javelin compiler does not yet support {msg} (line {})",
                position.start().line
            ),
            Self::Capacity { msg } => write!(f, "{msg}"),
            Self::Internal { msg } => write!(f, "internal compiler error: {msg}"),
        }
    }
}

impl std::error::Error for CompileError {}
