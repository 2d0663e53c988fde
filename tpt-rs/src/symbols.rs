//! Hierarchical symbol table with path resolution.
//!
//! All template symbols live under one root hash.  A *path* addresses a slot
//! in that tree: `.` descends into hashes, `[expr]` indexes arrays (the
//! expression is evaluated as a nested integer expression), and embedded
//! `$name` / `${path}` segments compose names dynamically by splicing in the
//! referenced scalar before the path is resolved.  The literal path `.`
//! names the current `@foreach` loop variable and bypasses traversal.
//!
//! Reads of missing slots return `Ok(None)` and callers substitute an empty
//! scalar; writes auto-vivify every intermediate node, so a write only fails
//! on malformed path syntax or an out-of-range index.

use indexmap::IndexMap;

use crate::lex::{str2num, Lex, Token, TokenKind};
use crate::value::{Value, MAX_ARRAY_INDEX};

/// One resolved step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Key(String),
    Index(usize),
}

/// The symbol table: a root hash plus path-resolution logic.
#[derive(Debug, Default)]
pub struct Symbols {
    root: IndexMap<String, Value>,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to the root hash (host seeding, iteration).
    pub fn root(&self) -> &IndexMap<String, Value> {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut IndexMap<String, Value> {
        &mut self.root
    }

    /// Resolve `path` for reading.  `Ok(None)` means the slot does not
    /// exist; `Err` means the path is malformed or typed wrong along the
    /// way (indexing a scalar, dotting into an array, …).
    pub fn get(&self, path: &str) -> Result<Option<&Value>, String> {
        let segs = self.parse_path(path)?;
        let mut iter = segs.into_iter();
        let Some(first) = iter.next() else {
            return Err(format!("malformed symbol path '{path}'"));
        };
        let mut cur = match first {
            Seg::Key(k) => match self.root.get(&k) {
                Some(v) => v,
                None => return Ok(None),
            },
            Seg::Index(_) => {
                return Err(format!("cannot index the symbol table root in '{path}'"))
            }
        };
        for seg in iter {
            match seg {
                Seg::Key(k) => match cur {
                    Value::Hash(h) => match h.get(&k) {
                        Some(v) => cur = v,
                        None => return Ok(None),
                    },
                    other => {
                        return Err(format!(
                            "expected hash, found {} in path '{path}'",
                            other.kind_name()
                        ))
                    }
                },
                Seg::Index(i) => match cur {
                    Value::Array(a) => match a.get(i) {
                        Some(v) => cur = v,
                        None => return Ok(None),
                    },
                    other => {
                        return Err(format!(
                            "expected array, found {} in path '{path}'",
                            other.kind_name()
                        ))
                    }
                },
            }
        }
        Ok(Some(cur))
    }

    /// Like [`Symbols::get`], returning an owned copy.
    pub fn get_copy(&self, path: &str) -> Result<Option<Value>, String> {
        Ok(self.get(path)?.cloned())
    }

    /// `true` when the path resolves to an existing slot.
    pub fn exists(&self, path: &str) -> bool {
        matches!(self.get(path), Ok(Some(_)))
    }

    /// Resolve `path` for writing and store `value` there, auto-vivifying
    /// intermediate nodes.  Token values collapse to scalars on insert.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), String> {
        let slot = self.resolve_for_write(path)?;
        *slot = value.into().into_stored();
        Ok(())
    }

    /// Remove the slot at `path`.  Removing a missing slot is a no-op.
    pub fn unset(&mut self, path: &str) -> Result<(), String> {
        let segs = self.parse_path(path)?;
        let (last, parents) = match segs.split_last() {
            Some(x) => x,
            None => return Err(format!("malformed symbol path '{path}'")),
        };

        if parents.is_empty() {
            if let Seg::Key(k) = last {
                self.root.shift_remove(k);
                return Ok(());
            }
            return Err(format!("cannot index the symbol table root in '{path}'"));
        }

        let Some(parent) = self.walk_mut_existing(parents) else {
            return Ok(());
        };
        match (last, parent) {
            (Seg::Key(k), Value::Hash(h)) => {
                h.shift_remove(k);
                Ok(())
            }
            (Seg::Index(i), Value::Array(a)) => {
                if *i < a.len() {
                    a.remove(*i);
                }
                Ok(())
            }
            (_, other) => Err(format!(
                "expected container, found {} in path '{path}'",
                other.kind_name()
            )),
        }
    }

    /// Append an owned copy of `value` to the array at `path`, creating the
    /// array when the slot is missing or holds an empty scalar.
    pub fn push(&mut self, path: &str, value: impl Into<Value>) -> Result<(), String> {
        let slot = self.resolve_for_write(path)?;
        let stored = value.into().into_stored();
        match slot {
            Value::Array(a) => {
                if a.len() >= MAX_ARRAY_INDEX {
                    return Err(format!("array at '{path}' is full"));
                }
                a.push(stored);
                Ok(())
            }
            Value::Scalar(s) if s.is_empty() => {
                *slot = Value::Array(vec![stored]);
                Ok(())
            }
            other => Err(format!(
                "expected array, found {} at '{path}'",
                other.kind_name()
            )),
        }
    }

    /// Pop the last element of the array at `path`.  An empty or missing
    /// array yields `Ok(None)`.
    pub fn pop(&mut self, path: &str) -> Result<Option<Value>, String> {
        let segs = self.parse_path(path)?;
        let Some(slot) = self.walk_mut_existing(&segs) else {
            return Ok(None);
        };
        match slot {
            Value::Array(a) => Ok(a.pop()),
            Value::Scalar(s) if s.is_empty() => Ok(None),
            other => Err(format!(
                "expected array, found {} at '{path}'",
                other.kind_name()
            )),
        }
    }

    // ── Write-path walking ────────────────────────────────────────────────────

    /// Walk to the slot named by `path`, creating hashes/arrays along the
    /// way.  An intermediate node of the wrong kind is replaced by the
    /// container the path requires, so read-modify-write paths cannot fail.
    fn resolve_for_write(&mut self, path: &str) -> Result<&mut Value, String> {
        let segs = self.parse_path(path)?;
        let mut iter = segs.into_iter();
        let Some(first) = iter.next() else {
            return Err(format!("malformed symbol path '{path}'"));
        };
        let mut cur = match first {
            Seg::Key(k) => self.root.entry(k).or_default(),
            Seg::Index(_) => {
                return Err(format!("cannot index the symbol table root in '{path}'"))
            }
        };
        for seg in iter {
            match seg {
                Seg::Key(k) => {
                    if !matches!(cur, Value::Hash(_)) {
                        *cur = Value::Hash(IndexMap::new());
                    }
                    let Value::Hash(h) = cur else { unreachable!() };
                    cur = h.entry(k).or_default();
                }
                Seg::Index(i) => {
                    if i > MAX_ARRAY_INDEX {
                        return Err(format!("array index {i} out of range in '{path}'"));
                    }
                    if !matches!(cur, Value::Array(_)) {
                        *cur = Value::Array(Vec::new());
                    }
                    let Value::Array(a) = cur else { unreachable!() };
                    if a.len() <= i {
                        a.resize_with(i + 1, Value::default);
                    }
                    cur = &mut a[i];
                }
            }
        }
        Ok(cur)
    }

    /// Walk pre-parsed segments without vivifying; `None` when any step is
    /// missing or typed wrong.
    fn walk_mut_existing(&mut self, segs: &[Seg]) -> Option<&mut Value> {
        let mut iter = segs.iter();
        let mut cur = match iter.next()? {
            Seg::Key(k) => self.root.get_mut(k)?,
            Seg::Index(_) => return None,
        };
        for seg in iter {
            match seg {
                Seg::Key(k) => match cur {
                    Value::Hash(h) => cur = h.get_mut(k)?,
                    _ => return None,
                },
                Seg::Index(i) => match cur {
                    Value::Array(a) => cur = a.get_mut(*i)?,
                    _ => return None,
                },
            }
        }
        Some(cur)
    }

    // ── Path parsing ──────────────────────────────────────────────────────────

    /// Parse a path into segments: expand embedded `$` references outside of
    /// brackets, then split on `.` and evaluate `[expr]` spans.
    ///
    /// A `$` anywhere in a path — including at the start — is dynamic name
    /// composition.  Callers holding a `$name`/`${path}` *token* strip that
    /// outer decoration (see [`strip_sigil`]) before resolving.
    fn parse_path(&self, path: &str) -> Result<Vec<Seg>, String> {
        if path.is_empty() {
            return Err("empty symbol path".to_owned());
        }
        let literal = self.expand_refs(path)?;
        let mut segs = Vec::new();
        let mut chars = literal.chars().peekable();

        // A leading dot addresses the foreach loop variable.
        if chars.peek() == Some(&'.') {
            chars.next();
            segs.push(Seg::Key(".".to_owned()));
            if chars.peek().is_none() {
                return Ok(segs);
            }
        }

        let mut name = String::new();
        loop {
            match chars.next() {
                None => {
                    if !name.is_empty() {
                        segs.push(Seg::Key(std::mem::take(&mut name)));
                    } else if segs.is_empty() {
                        return Err(format!("malformed symbol path '{path}'"));
                    }
                    return Ok(segs);
                }
                Some('.') => {
                    if name.is_empty() {
                        return Err(format!("malformed symbol path '{path}'"));
                    }
                    segs.push(Seg::Key(std::mem::take(&mut name)));
                }
                Some('[') => {
                    if !name.is_empty() {
                        segs.push(Seg::Key(std::mem::take(&mut name)));
                    }
                    if segs.is_empty() {
                        return Err(format!("malformed symbol path '{path}'"));
                    }
                    let expr = capture_bracket(&mut chars, path)?;
                    let idx = self.eval_index_expr(&expr)?;
                    if idx < 0 {
                        return Err(format!("negative array index in '{path}'"));
                    }
                    segs.push(Seg::Index(idx as usize));
                    // Only `.`, another `[`, or the end may follow.
                    match chars.peek() {
                        None | Some('.') | Some('[') => {
                            if chars.peek() == Some(&'.') {
                                chars.next();
                                // A name must follow the dot.
                                if chars.peek().is_none() {
                                    return Err(format!("malformed symbol path '{path}'"));
                                }
                            }
                        }
                        Some(_) => {
                            return Err(format!("malformed symbol path '{path}'"));
                        }
                    }
                }
                Some(c) => name.push(c),
            }
        }
    }

    /// Splice embedded `$name` / `${path}` references (outside brackets)
    /// into literal text.  The referenced slot must hold a scalar; a missing
    /// slot splices as empty.
    fn expand_refs(&self, path: &str) -> Result<String, String> {
        if !path.contains('$') {
            return Ok(path.to_owned());
        }
        let mut out = String::with_capacity(path.len());
        let mut chars = path.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '$' => {
                    let inner = match chars.peek() {
                        Some('{') => {
                            chars.next();
                            let mut depth = 1u32;
                            let mut inner = String::new();
                            for c in chars.by_ref() {
                                match c {
                                    '{' => depth += 1,
                                    '}' => {
                                        depth -= 1;
                                        if depth == 0 {
                                            break;
                                        }
                                    }
                                    _ => {}
                                }
                                if depth > 0 {
                                    inner.push(c);
                                }
                            }
                            if depth != 0 {
                                return Err(format!("unterminated '${{' in path '{path}'"));
                            }
                            inner
                        }
                        _ => {
                            let mut inner = String::new();
                            while let Some(&c) = chars.peek() {
                                if c.is_alphanumeric() || c == '_' {
                                    inner.push(c);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                            if inner.is_empty() {
                                return Err(format!("dangling '$' in path '{path}'"));
                            }
                            inner
                        }
                    };
                    match self.get(&inner)? {
                        Some(v) => out.push_str(v.to_text().map_err(|e| {
                            format!("{e} for '${inner}' in path '{path}'")
                        })?),
                        None => {}
                    }
                }
                '[' => {
                    // Bracket contents are evaluated later, not spliced.
                    out.push('[');
                    let mut depth = 1u32;
                    for c in chars.by_ref() {
                        match c {
                            '[' => depth += 1,
                            ']' => depth -= 1,
                            _ => {}
                        }
                        out.push(c);
                        if depth == 0 {
                            break;
                        }
                    }
                    if depth != 0 {
                        return Err(format!("unterminated '[' in path '{path}'"));
                    }
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    // ── Bracket index expressions ─────────────────────────────────────────────

    /// Evaluate a bracket index expression: integer arithmetic over
    /// literals, parentheses, and variable references (resolved through
    /// this table and converted with [`str2num`]).
    fn eval_index_expr(&self, src: &str) -> Result<i64, String> {
        let mut lex = Lex::from_str(src);
        let first = lex.get_strict_token();
        let (value, term) = self.idx_additive(first, &mut lex)?;
        if term.kind != TokenKind::Eof {
            return Err(format!(
                "unexpected '{}' in index expression '{src}'",
                term.text
            ));
        }
        Ok(value)
    }

    fn idx_additive(&self, first: Token, lex: &mut Lex) -> Result<(i64, Token), String> {
        let (mut left, mut op) = self.idx_multiplicative(first, lex)?;
        while op.kind == TokenKind::Operator && (op.text == "+" || op.text == "-") {
            let next = lex.get_strict_token();
            let (right, term) = self.idx_multiplicative(next, lex)?;
            left = if op.text == "+" {
                left.wrapping_add(right)
            } else {
                left.wrapping_sub(right)
            };
            op = term;
        }
        Ok((left, op))
    }

    fn idx_multiplicative(&self, first: Token, lex: &mut Lex) -> Result<(i64, Token), String> {
        let mut left = self.idx_factor(first, lex)?;
        loop {
            let op = lex.get_strict_token();
            match (op.kind, op.text.as_str()) {
                (TokenKind::Operator, "*") => {
                    let next = lex.get_strict_token();
                    left = left.wrapping_mul(self.idx_factor(next, lex)?);
                }
                (TokenKind::Operator, "/") => {
                    let next = lex.get_strict_token();
                    let rhs = self.idx_factor(next, lex)?;
                    if rhs == 0 {
                        return Err("division by zero in index expression".to_owned());
                    }
                    left = left.wrapping_div(rhs);
                }
                (TokenKind::Operator, "%") => {
                    let next = lex.get_strict_token();
                    let rhs = self.idx_factor(next, lex)?;
                    if rhs == 0 {
                        return Err("modulo by zero in index expression".to_owned());
                    }
                    left = left.wrapping_rem(rhs);
                }
                _ => return Ok((left, op)),
            }
        }
    }

    fn idx_factor(&self, t: Token, lex: &mut Lex) -> Result<i64, String> {
        match t.kind {
            TokenKind::Integer => Ok(str2num(&t.text)),
            TokenKind::Str => Ok(str2num(&t.text)),
            TokenKind::Id => {
                let name = strip_sigil(&t.text);
                match self.get(name)? {
                    Some(v) => Ok(str2num(v.to_text().map_err(|e| e.to_string())?)),
                    None => Ok(0),
                }
            }
            TokenKind::Operator if t.text == "-" => {
                let next = lex.get_strict_token();
                Ok(self.idx_factor(next, lex)?.wrapping_neg())
            }
            TokenKind::Operator if t.text == "+" => {
                let next = lex.get_strict_token();
                self.idx_factor(next, lex)
            }
            TokenKind::OpenParen => {
                let first = lex.get_strict_token();
                let (v, term) = self.idx_additive(first, lex)?;
                if term.kind != TokenKind::CloseParen {
                    return Err("unmatched parenthesis in index expression".to_owned());
                }
                Ok(v)
            }
            _ => Err(format!(
                "unexpected <{}> '{}' in index expression",
                t.kind.name(),
                t.text
            )),
        }
    }
}

/// Strip the `$` / `${…}` decoration from an id token's text.
pub fn strip_sigil(text: &str) -> &str {
    if let Some(inner) = text.strip_prefix("${") {
        inner.strip_suffix('}').unwrap_or(inner)
    } else {
        text.strip_prefix('$').unwrap_or(text)
    }
}

/// Capture a balanced bracket span; the opening `[` is already consumed.
fn capture_bracket(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    path: &str,
) -> Result<String, String> {
    let mut depth = 1u32;
    let mut out = String::new();
    for c in chars.by_ref() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(out);
                }
            }
            _ => {}
        }
        out.push(c);
    }
    Err(format!("unterminated '[' in path '{path}'"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Symbols {
        Symbols::new()
    }

    #[test]
    fn simple_set_get() {
        let mut syms = table();
        syms.set("name", "value").unwrap();
        assert_eq!(syms.get("name").unwrap(), Some(&Value::scalar("value")));
    }

    #[test]
    fn missing_is_none() {
        let syms = table();
        assert_eq!(syms.get("nope").unwrap(), None);
        assert!(!syms.exists("nope"));
    }

    #[test]
    fn nested_hash_autovivifies() {
        let mut syms = table();
        syms.set("a.b.c", "deep").unwrap();
        assert_eq!(syms.get("a.b.c").unwrap(), Some(&Value::scalar("deep")));
        assert!(syms.get("a").unwrap().unwrap().is_hash());
    }

    #[test]
    fn array_write_extends_with_empty_scalars() {
        let mut syms = table();
        syms.set("arr[3]", "x").unwrap();
        let arr = syms.get("arr").unwrap().unwrap().as_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], Value::scalar(""));
        assert_eq!(arr[3], Value::scalar("x"));
    }

    #[test]
    fn array_index_bound() {
        let mut syms = table();
        assert!(syms.set("arr[999999]", "x").is_err());
        assert!(syms.set("arr[65535]", "x").is_ok());
    }

    #[test]
    fn negative_index_is_error() {
        let mut syms = table();
        syms.set("arr[0]", "x").unwrap();
        assert!(syms.get("arr[0-1]").is_err());
    }

    #[test]
    fn out_of_bounds_read_is_none() {
        let mut syms = table();
        syms.set("arr[1]", "x").unwrap();
        assert_eq!(syms.get("arr[5]").unwrap(), None);
    }

    #[test]
    fn index_expression_arithmetic() {
        let mut syms = table();
        syms.set("arr[6]", "six").unwrap();
        assert_eq!(syms.get("arr[2*3]").unwrap(), Some(&Value::scalar("six")));
        assert_eq!(
            syms.get("arr[(2+1)*2]").unwrap(),
            Some(&Value::scalar("six"))
        );
    }

    #[test]
    fn index_expression_with_variable() {
        let mut syms = table();
        syms.set("i", "2").unwrap();
        syms.set("arr[2]", "two").unwrap();
        assert_eq!(syms.get("arr[$i]").unwrap(), Some(&Value::scalar("two")));
        assert_eq!(syms.get("arr[i]").unwrap(), Some(&Value::scalar("two")));
        assert_eq!(syms.get("arr[$i+1]").unwrap(), None);
    }

    #[test]
    fn dynamic_name_composition() {
        let mut syms = table();
        syms.set("which", "color").unwrap();
        syms.set("color", "red").unwrap();
        assert_eq!(syms.get("$which").unwrap(), Some(&Value::scalar("red")));
    }

    #[test]
    fn dynamic_name_splices_into_longer_name() {
        let mut syms = table();
        syms.set("n", "2").unwrap();
        syms.set("row2", "second").unwrap();
        assert_eq!(syms.get("row$n").unwrap(), Some(&Value::scalar("second")));
        assert_eq!(syms.get("row${n}").unwrap(), Some(&Value::scalar("second")));
    }

    #[test]
    fn dynamic_name_miss_splices_empty() {
        let mut syms = table();
        syms.set("row", "bare").unwrap();
        assert_eq!(syms.get("row$nope").unwrap(), Some(&Value::scalar("bare")));
    }

    #[test]
    fn loop_variable_path() {
        let mut syms = table();
        syms.set(".", "current").unwrap();
        assert_eq!(syms.get(".").unwrap(), Some(&Value::scalar("current")));
    }

    #[test]
    fn loop_variable_subpath() {
        let mut syms = table();
        syms.set(".", Value::Hash(IndexMap::new())).unwrap();
        syms.set(".name", "inner").unwrap();
        assert_eq!(syms.get(".name").unwrap(), Some(&Value::scalar("inner")));
    }

    #[test]
    fn leading_dollar_is_indirection_not_decoration() {
        let mut syms = table();
        syms.set("x", "1").unwrap();
        // "$x" as a *path* dereferences twice: the value of x names the slot.
        assert_eq!(syms.get("$x").unwrap(), None);
        syms.set("1", "one").unwrap();
        assert_eq!(syms.get("$x").unwrap(), Some(&Value::scalar("one")));
    }

    #[test]
    fn unset_removes() {
        let mut syms = table();
        syms.set("gone", "x").unwrap();
        syms.unset("gone").unwrap();
        assert!(!syms.exists("gone"));
        // Unsetting again is a no-op.
        syms.unset("gone").unwrap();
    }

    #[test]
    fn unset_nested() {
        let mut syms = table();
        syms.set("h.a", "1").unwrap();
        syms.set("h.b", "2").unwrap();
        syms.unset("h.a").unwrap();
        assert!(!syms.exists("h.a"));
        assert!(syms.exists("h.b"));
    }

    #[test]
    fn push_and_pop() {
        let mut syms = table();
        syms.push("stack", "a").unwrap();
        syms.push("stack", "b").unwrap();
        assert_eq!(syms.pop("stack").unwrap(), Some(Value::scalar("b")));
        assert_eq!(syms.pop("stack").unwrap(), Some(Value::scalar("a")));
        assert_eq!(syms.pop("stack").unwrap(), None);
    }

    #[test]
    fn push_onto_scalar_is_error() {
        let mut syms = table();
        syms.set("s", "occupied").unwrap();
        assert!(syms.push("s", "x").is_err());
    }

    #[test]
    fn dotting_into_scalar_is_error_on_read() {
        let mut syms = table();
        syms.set("s", "flat").unwrap();
        assert!(syms.get("s.sub").is_err());
    }

    #[test]
    fn write_replaces_wrong_kind_intermediate() {
        let mut syms = table();
        syms.set("node", "scalar").unwrap();
        syms.set("node.child", "x").unwrap();
        assert_eq!(syms.get("node.child").unwrap(), Some(&Value::scalar("x")));
    }

    #[test]
    fn malformed_paths() {
        let syms = table();
        assert!(syms.get("").is_err());
        assert!(syms.get("a..b").is_err());
        assert!(syms.get("a[1").is_err());
        assert!(syms.get("a[1]b").is_err());
    }

    #[test]
    fn token_value_collapses_on_set() {
        use crate::lex::TokenKind;
        let mut syms = table();
        let tok = Token {
            kind: TokenKind::Integer,
            text: "42".to_owned(),
            line: 1,
            column: 1,
        };
        syms.set("n", Value::Token(tok)).unwrap();
        assert_eq!(syms.get("n").unwrap(), Some(&Value::scalar("42")));
    }

    #[test]
    fn strip_sigil_forms() {
        assert_eq!(strip_sigil("$x"), "x");
        assert_eq!(strip_sigil("${a.b}"), "a.b");
        assert_eq!(strip_sigil("plain"), "plain");
    }
}
