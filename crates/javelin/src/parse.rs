//! Front-end seam: parsing and source positions.
//!
//! The compiler consumes the ruff AST directly and never re-parses text.
//! This module wraps `ruff_python_parser` and converts byte-offset
//! `TextRange`s into line/column `CodeRange`s for diagnostics and the
//! line-number tables of generated methods.

use std::fmt;

use ruff_python_ast::ModModule;
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange, TextSize};

use crate::error::CompileError;

/// A line/column location in the source, both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A source span used in diagnostics and line-number tables.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    start: CodeLoc,
    end: CodeLoc,
}

/// Custom Debug implementation to make displaying spans much less verbose.
impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeRange{{{}..{}}}", self.start, self.end)
    }
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> CodeLoc {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> CodeLoc {
        self.end
    }
}

/// Maps byte offsets from the ruff AST to line/column positions.
///
/// Built once per compilation from the source text; the scope resolver and
/// code generator share one instance.
#[derive(Debug)]
pub struct SourceMap {
    /// Byte offset of the start of each line, first entry always 0.
    line_starts: Vec<u32>,
}

impl SourceMap {
    #[must_use]
    pub fn new(code: &str) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in code.bytes().enumerate() {
            if b == b'\n' {
                // Truncation is impossible: ruff rejects sources over 4 GiB
                // long before we get here.
                line_starts.push(u32::try_from(i + 1).unwrap_or(u32::MAX));
            }
        }
        Self { line_starts }
    }

    /// Converts a byte offset to a 1-based line/column location.
    #[must_use]
    pub fn loc(&self, offset: TextSize) -> CodeLoc {
        let offset = offset.to_u32();
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        // Safe u32 casts: line_starts has at most one entry per source byte.
        CodeLoc {
            line: line_idx as u32 + 1,
            column: offset - self.line_starts[line_idx] + 1,
        }
    }

    /// Converts a ruff `TextRange` to a `CodeRange`.
    #[must_use]
    pub fn range(&self, range: TextRange) -> CodeRange {
        CodeRange {
            start: self.loc(range.start()),
            end: self.loc(range.end()),
        }
    }
}

/// Parses one module of Python source.
///
/// Returns the ruff syntax tree together with the source map needed to turn
/// its byte offsets into line/column positions.
pub fn parse(code: &str) -> Result<(ModModule, SourceMap), CompileError> {
    let map = SourceMap::new(code);
    let parsed = parse_module(code).map_err(|e| CompileError::syntax(e.to_string(), map.range(e.range())))?;
    Ok((parsed.into_syntax(), map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_map_locations() {
        let map = SourceMap::new("a = 1\nbb = 2\n");
        assert_eq!(map.loc(TextSize::new(0)), CodeLoc { line: 1, column: 1 });
        assert_eq!(map.loc(TextSize::new(4)), CodeLoc { line: 1, column: 5 });
        assert_eq!(map.loc(TextSize::new(6)), CodeLoc { line: 2, column: 1 });
        assert_eq!(map.loc(TextSize::new(11)), CodeLoc { line: 2, column: 6 });
    }

    #[test]
    fn test_parse_ok() {
        let (module, _) = parse("x = 1\n").unwrap();
        assert_eq!(module.body.len(), 1);
    }

    #[test]
    fn test_parse_syntax_error() {
        let err = parse("def f(:\n    pass\n").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }
}
