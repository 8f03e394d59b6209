//! Structured compiler diagnostics
//!
//! Every compile error or warning is a `Diagnostic`: a stable code, a
//! severity, a message, the span it points at, and an optional fix hint
//! ("did you mean?"). The compiler collects diagnostics across all
//! phases and never stops at the first one, so a single run reports
//! everything it can find.

use crate::span::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// DIAGNOSTIC CODES
// ============================================================================

/// Stable diagnostic codes.
///
/// Codes are grouped by pipeline phase: `E01xx` lexer, `E02xx` parser,
/// `E03xx` analyzer, `E04xx` normalizer, `W04xx` warnings. The string
/// form (`E0305`) is part of the tool's contract and never changes
/// meaning across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagCode {
    // Lexer
    UnterminatedString,
    UnterminatedComment,
    InvalidCharacter,
    InvalidNumber,

    // Parser
    ParseError,
    FatalParseError,

    // Analyzer
    DuplicateDeclaration,
    UndefinedEntity,
    UndefinedRelation,
    UndefinedField,
    UndefinedJob,
    UndefinedMessage,
    UndefinedAction,
    UndefinedView,
    InvalidType,
    CycleInRelations,

    // Normalizer
    TableNameCollision,
    InvalidDefault,

    // Warnings
    EntityWithoutAccess,
    UnusedMessage,
}

impl DiagCode {
    /// The stable string form of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagCode::UnterminatedString => "E0101",
            DiagCode::UnterminatedComment => "E0102",
            DiagCode::InvalidCharacter => "E0103",
            DiagCode::InvalidNumber => "E0104",

            DiagCode::ParseError => "E0201",
            DiagCode::FatalParseError => "E0202",

            DiagCode::DuplicateDeclaration => "E0300",
            DiagCode::UndefinedEntity => "E0301",
            DiagCode::UndefinedRelation => "E0302",
            DiagCode::UndefinedField => "E0303",
            DiagCode::UndefinedJob => "E0304",
            DiagCode::UndefinedMessage => "E0305",
            DiagCode::UndefinedAction => "E0306",
            DiagCode::UndefinedView => "E0307",
            DiagCode::InvalidType => "E0308",
            DiagCode::CycleInRelations => "E0309",

            DiagCode::TableNameCollision => "E0401",
            DiagCode::InvalidDefault => "E0402",

            DiagCode::EntityWithoutAccess => "W0401",
            DiagCode::UnusedMessage => "W0402",
        }
    }

    /// Default severity for this code.
    pub fn severity(&self) -> Severity {
        match self {
            DiagCode::EntityWithoutAccess | DiagCode::UnusedMessage => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

// ============================================================================
// FIX HINTS
// ============================================================================

/// A suggested fix attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixHint {
    /// The closest defined name, when one is within edit distance.
    pub did_you_mean: Option<String>,
    /// The defined names of the referenced kind, listed when the set is
    /// small enough to be useful.
    pub available: Vec<String>,
}

// ============================================================================
// DIAGNOSTIC
// ============================================================================

/// A single compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagCode,
    pub severity: Severity,
    pub message: String,
    /// Path of the source file the span points into.
    pub file: String,
    pub span: Span,
    /// Secondary span, e.g. the first definition site for a duplicate.
    pub related_span: Option<Span>,
    pub hint: Option<FixHint>,
}

impl Diagnostic {
    /// Create a diagnostic with the code's default severity.
    pub fn new(code: DiagCode, message: impl Into<String>, file: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
            file: file.into(),
            span,
            related_span: None,
            hint: None,
        }
    }

    pub fn with_related(mut self, span: Span) -> Self {
        self.related_span = Some(span);
        self
    }

    pub fn with_hint(mut self, hint: FixHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}] at {}:{}:{}",
            match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            },
            self.message,
            self.code,
            self.file,
            self.span.line,
            self.span.column,
        )?;
        if let Some(hint) = &self.hint {
            if let Some(suggestion) = &hint.did_you_mean {
                write!(f, " (did you mean '{}'?)", suggestion)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// DIAGNOSTIC COLLECTION
// ============================================================================

/// Accumulator the pipeline phases push into.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    /// True when at least one error-severity diagnostic is present.
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }

    /// Sorted render order: by file, then source position.
    pub fn sorted(mut self) -> Self {
        self.items
            .sort_by(|a, b| (a.file.as_str(), a.span.start).cmp(&(b.file.as_str(), b.span.start)));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(DiagCode::UndefinedMessage.as_str(), "E0305");
        assert_eq!(DiagCode::DuplicateDeclaration.as_str(), "E0300");
        assert_eq!(DiagCode::UnterminatedString.as_str(), "E0101");
        assert_eq!(DiagCode::EntityWithoutAccess.as_str(), "W0401");
    }

    #[test]
    fn test_warning_severity() {
        assert_eq!(DiagCode::UnusedMessage.severity(), Severity::Warning);
        assert_eq!(DiagCode::UndefinedEntity.severity(), Severity::Error);
    }

    #[test]
    fn test_has_errors_ignores_warnings() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::new(
            DiagCode::UnusedMessage,
            "message 'X' is never emitted",
            "app.forge",
            Span::default(),
        ));
        assert!(!diags.has_errors());

        diags.push(Diagnostic::new(
            DiagCode::UndefinedEntity,
            "entity 'Nope' is not defined",
            "app.forge",
            Span::default(),
        ));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_sorted_by_position() {
        let mut diags = Diagnostics::new();
        let later = Span {
            start: 50,
            end: 55,
            line: 4,
            column: 1,
        };
        let earlier = Span {
            start: 10,
            end: 15,
            line: 2,
            column: 3,
        };
        diags.push(Diagnostic::new(DiagCode::ParseError, "b", "a.forge", later));
        diags.push(Diagnostic::new(DiagCode::ParseError, "a", "a.forge", earlier));
        let sorted = diags.sorted();
        let positions: Vec<usize> = sorted.iter().map(|d| d.span.start).collect();
        assert_eq!(positions, vec![10, 50]);
    }
}
