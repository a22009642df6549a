//! Macro table — captured token sequences for `!name` expansion (spec §4.2)
//!
//! No teacher or `original_source` precedent implements macro expansion
//! (`Emitter.h` declares a `MacroArray` field but the kept `Emitter.c`
//! never reads it), so this module follows spec §4.2 directly: a macro
//! definition captures its body verbatim, uninterpreted, between the
//! parentheses; expansion is a pure token substitution handled by the
//! assembler's look-ahead deque.

use std::collections::HashMap;

use crate::token::Token;

/// Maps macro name to its captured, unexpanded token body
#[derive(Default)]
pub struct MacroTable {
    macros: HashMap<String, Vec<Token>>,
}

impl MacroTable {
    pub fn new() -> MacroTable {
        MacroTable::default()
    }

    pub fn define(&mut self, name: String, body: Vec<Token>) {
        self.macros.insert(name, body);
    }

    pub fn lookup(&self, name: &str) -> Option<Vec<Token>> {
        self.macros.get(name).cloned()
    }
}
