#![forbid(unsafe_code)]

use miette::Diagnostic;
use sable_ast::{Capability, Span};
use thiserror::Error;

/// What went wrong, in checker terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Declared vs. required capability incompatible at a call or
    /// assignment site.
    CapabilityMismatch,
    /// Freeze or isolation recovery attempted while the sharing-set
    /// precondition fails.
    SharingViolation,
    /// An independent parameter's capability leaked into a stored,
    /// non-covariant position.
    IllegalReification,
    /// A member signature violates the declared variance, capability
    /// included.
    VarianceViolation,
    /// Two declarations differ only by capability.
    OverloadOnCapability,
    /// A binding used after move or invalidation.
    UseAfterInvalidate,
    /// A name the tree refers to but never declares. Indicates a
    /// malformed input tree rather than a capability problem.
    UnknownBinding,
}

impl ErrorKind {
    pub fn display(&self) -> &'static str {
        match self {
            ErrorKind::CapabilityMismatch => "capability mismatch",
            ErrorKind::SharingViolation => "sharing violation",
            ErrorKind::IllegalReification => "illegal reification",
            ErrorKind::VarianceViolation => "variance violation",
            ErrorKind::OverloadOnCapability => "overload on capability",
            ErrorKind::UseAfterInvalidate => "use after invalidation",
            ErrorKind::UnknownBinding => "unknown binding",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn display(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// A single checker diagnostic. Carries the capability/sharing state
/// that produced it so the caller can render more than the message.
#[derive(Clone, Debug, Error, Diagnostic)]
#[error("{}: {message}", kind.display())]
#[diagnostic(code(sable::check))]
pub struct CheckDiagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    #[label]
    pub span: Span,
    /// Capability the site observed, when relevant.
    pub observed: Option<Capability>,
    /// Capability the site required, when relevant.
    pub required: Option<Capability>,
    /// Names of the live sharing-set members that blocked the
    /// operation, when relevant.
    pub sharers: Vec<String>,
}

impl CheckDiagnostic {
    pub fn new(kind: ErrorKind, span: Span, message: String) -> Self {
        CheckDiagnostic {
            kind,
            severity: Severity::Error,
            message,
            span,
            observed: None,
            required: None,
            sharers: Vec::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_caps(mut self, observed: Capability, required: Capability) -> Self {
        self.observed = Some(observed);
        self.required = Some(required);
        self
    }

    pub fn with_sharers(mut self, sharers: Vec<String>) -> Self {
        self.sharers = sharers;
        self
    }
}

/// Accumulates diagnostics for a whole pass. Diagnostics are
/// best-effort: the checker records and continues, so one run surfaces
/// as many problems as possible.
#[derive(Debug, Default)]
pub struct Reporter {
    diagnostics: Vec<CheckDiagnostic>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, diagnostic: CheckDiagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn diagnostics(&self) -> &[CheckDiagnostic] {
        &self.diagnostics
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    /// Diagnostics in source order, for deterministic output.
    pub fn into_sorted(mut self) -> Vec<CheckDiagnostic> {
        self.diagnostics
            .sort_by_key(|d| (d.span.offset(), d.span.len()));
        self.diagnostics
    }
}
