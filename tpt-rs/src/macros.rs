//! User-defined macro storage.
//!
//! A macro is recorded at `@macro` definition time: its parameter names, the
//! raw unparsed body text (braces included), and the line the body starts on
//! so re-parsing reports positions in the defining template.  The body is
//! tokenized fresh on every call.

use std::collections::HashMap;

/// A user-defined macro.
#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
    /// Unparsed `{…}` body text.
    pub body: String,
    /// Line the body starts on in the defining source.
    pub line: u32,
}

/// Name → macro table, shared by all nested interpreter activations of one
/// render.
#[derive(Debug, Default)]
pub struct MacroTable {
    macros: HashMap<String, Macro>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a macro.
    pub fn define(&mut self, mac: Macro) {
        self.macros.insert(mac.name.clone(), mac);
    }

    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    /// Remove a macro by name.  Returns `true` if it existed.
    pub fn undefine(&mut self, name: &str) -> bool {
        self.macros.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
