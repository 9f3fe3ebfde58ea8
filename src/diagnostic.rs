use std::fmt;

/// A compiler diagnostic (warning or informational note).
///
/// Fatal conditions use [`crate::error::CompileError`]; diagnostics carry
/// the non-fatal channel: skipped optimization passes, importer warnings,
/// capacity headroom notes.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub notes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Note,
}

impl Diagnostic {
    pub fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            notes: Vec::new(),
        }
    }

    pub fn note(message: String) -> Self {
        Self {
            severity: Severity::Note,
            message,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Note => "note",
        };
        write!(f, "{}: {}", tag, self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {}", note)?;
        }
        Ok(())
    }
}

/// Render a list of diagnostics to stderr.
pub fn render_diagnostics(diagnostics: &[Diagnostic]) {
    for diag in diagnostics {
        eprintln!("{}", diag);
    }
}
