//! User-facing diagnostics.
//!
//! Parse-time problems are recoverable: the offending statement gets a zero
//! value substituted and assembly continues, so they are *reported* rather
//! than returned. The sink counts errors and warnings separately; the final
//! exit status and the decision whether to keep the output file are derived
//! from these counters.

use crate::source::SourceLoc;
use crate::source::SourceMap;

/// Severity of a reported diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Problem that still allows a correct output file.
    Warning,
    /// Problem that makes the output file unusable.
    Error,
}

/// One recorded diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// How bad it is.
    pub severity: Severity,
    /// Where it was detected.
    pub loc: SourceLoc,
    /// Rendered message text.
    pub message: String,
}

/// Collects diagnostics and keeps the error/warning counters that drive the
/// process exit status.
#[derive(Debug, Default)]
pub struct Diagnostics {
    reports: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
    /// Suppress warning output entirely.
    pub no_warn: bool,
    /// Treat warnings as errors.
    pub fatal_warnings: bool,
    /// Echo diagnostics to stderr as they are reported.
    pub echo: bool,
}

impl Diagnostics {
    /// Create a new sink that echoes to stderr.
    pub fn new() -> Self {
        Self {
            echo: true,
            ..Default::default()
        }
    }

    /// Create a silent sink, for tests that inspect the reports directly.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Report an error at `loc`.
    pub fn error(&mut self, loc: SourceLoc, message: impl Into<String>) {
        let message = message.into();
        log::debug!("error: {message}");
        self.errors += 1;
        self.push(Severity::Error, loc, message);
    }

    /// Report a warning at `loc`. Honors `no_warn` and `fatal_warnings`.
    pub fn warn(&mut self, loc: SourceLoc, message: impl Into<String>) {
        if self.fatal_warnings {
            self.error(loc, message);
            return;
        }
        if self.no_warn {
            return;
        }
        let message = message.into();
        log::debug!("warning: {message}");
        self.warnings += 1;
        self.push(Severity::Warning, loc, message);
    }

    fn push(&mut self, severity: Severity, loc: SourceLoc, message: String) {
        if self.echo {
            let tag = match severity {
                Severity::Warning => "Warning",
                Severity::Error => "Error",
            };
            eprintln!("{loc}: {tag}: {message}");
        }
        self.reports.push(Diagnostic {
            severity,
            loc,
            message,
        });
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Number of warnings reported so far.
    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    /// True if any error was reported.
    pub fn had_errors(&self) -> bool {
        self.errors != 0
    }

    /// All diagnostics reported so far, in order.
    pub fn reports(&self) -> &[Diagnostic] {
        &self.reports
    }

    /// Render every recorded diagnostic with file names from `map`.
    pub fn render(&self, map: &SourceMap) -> Vec<String> {
        self.reports
            .iter()
            .map(|d| {
                let tag = match d.severity {
                    Severity::Warning => "Warning",
                    Severity::Error => "Error",
                };
                format!("{}: {tag}: {}", map.describe(d.loc), d.message)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let mut d = Diagnostics::silent();
        d.warn(SourceLoc::default(), "w");
        d.error(SourceLoc::default(), "e");
        d.error(SourceLoc::default(), "e2");
        assert_eq!(d.warning_count(), 1);
        assert_eq!(d.error_count(), 2);
        assert!(d.had_errors());
    }

    #[test]
    fn fatal_warnings_promote() {
        let mut d = Diagnostics::silent();
        d.fatal_warnings = true;
        d.warn(SourceLoc::default(), "w");
        assert_eq!(d.error_count(), 1);
        assert_eq!(d.warning_count(), 0);
    }

    #[test]
    fn no_warn_suppresses() {
        let mut d = Diagnostics::silent();
        d.no_warn = true;
        d.warn(SourceLoc::default(), "w");
        assert_eq!(d.warning_count(), 0);
        assert!(d.reports().is_empty());
    }
}
