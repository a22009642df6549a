//! Source-location-anchored diagnostics, rendered as
//! `<path>:<line>:<column>: <message>` per spec §6
//!
//! Grounded on the teacher's `impl fmt::Display for assembler::Error` and
//! its `underline_spans` helper (`src/assembler.rs`), generalized from
//! the teacher's line-based underline to a single-point [Span].

use std::fmt;
use std::rc::Rc;

use colored::Colorize;

use crate::token::Span;

/// A single diagnostic: where it happened, and what went wrong
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub path: Rc<str>,
    pub span: Span,
    pub message: String,
}

impl Diagnostic {
    pub fn new(path: Rc<str>, span: Span, message: impl Into<String>) -> Diagnostic {
        Diagnostic { path, span, message: message.into() }
    }

    /// Print this diagnostic to stderr in the uniform
    /// `<path>:<line>:<column>: <message>` format, with the `error:`
    /// marker colored the way the teacher's `logging::error` colors it.
    pub fn report(&self) {
        eprintln!(
            "{}:{}:{}: {} {}",
            self.path,
            self.span.line,
            self.span.column,
            "error:".red().bold(),
            self.message
        );
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.path, self.span.line, self.span.column, self.message)
    }
}
