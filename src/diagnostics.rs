use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// A message about one operation (or transfer), identified by its location.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub loc: String,
    pub message: String,
}

/// Receives diagnostics from the search and rewrite passes.
///
/// Passed explicitly to every call which may report something; there is no global
/// diagnostic context.
#[auto_impl(&mut, Box)]
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);

    fn note(&mut self, loc: &str, message: &str) {
        self.report(Diagnostic::new(Severity::Note, loc, message));
    }

    fn warn(&mut self, loc: &str, message: &str) {
        self.report(Diagnostic::new(Severity::Warning, loc, message));
    }

    fn error(&mut self, loc: &str, message: &str) {
        self.report(Diagnostic::new(Severity::Error, loc, message));
    }
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Diagnostic {
    pub fn new(severity: Severity, loc: &str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity,
            loc: loc.to_owned(),
            message: message.into(),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {}: {}", self.loc, level, self.message)
    }
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

impl DiagnosticSink for LogSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Note => log::debug!("{}", diagnostic),
            Severity::Warning => log::warn!("{}", diagnostic),
            Severity::Error => log::error!("{}", diagnostic),
        }
    }
}

impl DiagnosticSink for NullSink {
    fn report(&mut self, _: Diagnostic) {}
}
