//! Active-line instrumentation for submitted source code.
//!
//! Generic subprocess output carries no structural information, so the
//! engine rewrites submitted code to announce each top-level line before it
//! executes: a marker print is inserted ahead of every executable
//! statement, and the assembler later strips those markers back out of the
//! visible output. Instrumentation must never change what the program
//! does or prints; every rewriter here is conservative, preferring a
//! missing marker over a marker inside a string literal, a comment, or the
//! middle of a multi-line statement.

pub mod javascript;
pub mod python;
pub mod shell;

pub use javascript::JavascriptInstrumentor;
pub use python::PythonInstrumentor;
pub use shell::ShellInstrumentor;

use crate::config::InstrumentKind;
use crate::markers::MarkerToken;

/// Rewrites source so each top-level executable line announces itself.
pub trait Instrumentor: Send + Sync {
    /// Return instrumented source. Line numbers in emitted markers are
    /// 1-based and refer to the original source; a multi-line statement
    /// reports the line of its opening token.
    fn instrument(&self, code: &str, token: &MarkerToken) -> String;
}

/// The instrumentor for a configured instrumentation kind, if any.
pub fn instrumentor_for(kind: InstrumentKind) -> Option<Box<dyn Instrumentor>> {
    match kind {
        InstrumentKind::Python => Some(Box::new(PythonInstrumentor)),
        InstrumentKind::Shell => Some(Box::new(ShellInstrumentor)),
        InstrumentKind::Javascript => Some(Box::new(JavascriptInstrumentor)),
        InstrumentKind::None => None,
    }
}

/// Instrument `code` for `kind`, passing it through untouched when the
/// language opts out of line tracking.
pub fn instrument(kind: InstrumentKind, code: &str, token: &MarkerToken) -> String {
    match instrumentor_for(kind) {
        Some(instrumentor) => instrumentor.instrument(code, token),
        None => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_kind_passes_code_through() {
        let token = MarkerToken::generate();
        let code = "anything at all";
        assert_eq!(instrument(InstrumentKind::None, code, &token), code);
    }

    #[test]
    fn test_known_kinds_have_instrumentors() {
        assert!(instrumentor_for(InstrumentKind::Python).is_some());
        assert!(instrumentor_for(InstrumentKind::Shell).is_some());
        assert!(instrumentor_for(InstrumentKind::Javascript).is_some());
        assert!(instrumentor_for(InstrumentKind::None).is_none());
    }
}
