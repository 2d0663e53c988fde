//! Ordered error accumulation.
//!
//! The engine records defects instead of throwing: one render surfaces every
//! problem it can find.  Entries are formatted strings of the shape
//! `"<message> at line <N> near <<kind>> '<text>'"`, or without the
//! near-clause when no token context is available.

use crate::lex::Token;

/// Ordered list of recorded template errors for one render.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Vec<String>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error with line and token context.
    pub fn record(&mut self, message: impl std::fmt::Display, line: u32, near: Option<&Token>) {
        let entry = match near {
            Some(t) => format!(
                "{message} at line {line} near <{}> '{}'",
                t.kind.name(),
                t.text
            ),
            None => format!("{message} at line {line}"),
        };
        tracing::debug!(error = %entry, "template error recorded");
        self.entries.push(entry);
    }

    /// Record an error with no positional context (file-level problems).
    pub fn record_plain(&mut self, message: impl Into<String>) {
        let entry = message.into();
        tracing::debug!(error = %entry, "template error recorded");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::TokenKind;

    #[test]
    fn formats_with_token_context() {
        let mut log = ErrorLog::new();
        let t = Token {
            kind: TokenKind::Operator,
            text: "+".to_owned(),
            line: 3,
            column: 7,
        };
        log.record("unexpected token", 3, Some(&t));
        assert_eq!(
            log.entries(),
            ["unexpected token at line 3 near <operator> '+'"]
        );
    }

    #[test]
    fn formats_without_token_context() {
        let mut log = ErrorLog::new();
        log.record("division by zero", 12, None);
        assert_eq!(log.entries(), ["division by zero at line 12"]);
    }

    #[test]
    fn preserves_order() {
        let mut log = ErrorLog::new();
        log.record_plain("first");
        log.record_plain("second");
        assert_eq!(log.entries(), ["first", "second"]);
        assert_eq!(log.len(), 2);
        log.clear();
        assert!(log.is_empty());
    }
}
