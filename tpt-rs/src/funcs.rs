//! Native function table.
//!
//! Hosts extend the template language by registering callbacks under a
//! name; `@name(args)` in a template then invokes the callback with the
//! output sink and the evaluated argument values.  A callback signals
//! failure by returning `Err`; the interpreter downgrades that to a recorded
//! error and keeps going, so a broken callback can never unwind a render.

use std::collections::HashMap;
use std::io::Write;

use crate::value::Value;

/// A host-provided native function.
pub type NativeFn = Box<dyn Fn(&mut dyn Write, &[Value]) -> Result<(), String> + Send + Sync>;

/// Name → native callback table, shared by all nested interpreter
/// activations of one render.
#[derive(Default)]
pub struct FunctionTable {
    funcs: HashMap<String, NativeFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a native function.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut dyn Write, &[Value]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.funcs.insert(name.into(), Box::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&NativeFn> {
        self.funcs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    /// Remove a function by name.  Returns `true` if it existed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.funcs.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("funcs", &names).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
