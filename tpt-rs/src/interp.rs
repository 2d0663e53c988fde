//! Template interpreter.
//!
//! The [`Interpreter`] owns the shared render state — symbol table, macro
//! table, native function table, include search path, error list, RNG — and
//! executes templates against an output sink.  Statements are dispatched
//! straight off the token stream; no AST is kept, and loop bodies are
//! re-tokenized from source on every iteration by seeking the lexer back to
//! a bookmark.
//!
//! Template defects are recorded in the error list and rendering continues
//! best-effort; only unreadable include files and malformed macro
//! declarations abort a render.  Sink I/O failures surface as `io::Error`.
//!
//! ```rust
//! use tpt::Interpreter;
//!
//! let mut interp = Interpreter::new();
//! interp.symbols_mut().set("who", "world").unwrap();
//! let mut out = Vec::new();
//! let had_errors = interp.run_str("hello ${who}", &mut out).unwrap();
//! assert!(!had_errors);
//! assert_eq!(out, b"hello world");
//! ```

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::buffer::Buffer;
use crate::error::ErrorLog;
use crate::funcs::FunctionTable;
use crate::lex::{num2str, str2num, Lex, Token, TokenKind};
use crate::macros::{Macro, MacroTable};
use crate::symbols::{strip_sigil, Symbols};
use crate::value::Value;

// ── Interpreter ───────────────────────────────────────────────────────────────

/// One template engine instance.
///
/// Hosts create one per render context, pre-seed [`Interpreter::symbols_mut`],
/// register native functions, and call [`Interpreter::run_str`] or
/// [`Interpreter::run_file`].  Symbols and macros persist between runs; the
/// error list is cleared per run.
#[derive(Debug, Default)]
pub struct Interpreter {
    symbols: Symbols,
    macros: MacroTable,
    funcs: FunctionTable,
    include_paths: Vec<PathBuf>,
    errors: ErrorLog,
    rng: u64,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut Symbols {
        &mut self.symbols
    }

    pub fn macros(&self) -> &MacroTable {
        &self.macros
    }

    pub fn functions_mut(&mut self) -> &mut FunctionTable {
        &mut self.funcs
    }

    /// Register a native function callable as `@name(args)`.
    pub fn register_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut dyn Write, &[Value]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.funcs.register(name, f);
    }

    /// Append a directory to the ordered include search path.
    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    /// Errors recorded by the most recent run, in order.
    pub fn errors(&self) -> &[String] {
        self.errors.entries()
    }

    /// Render a template string into `out`.  Returns `true` when template
    /// errors were recorded.
    pub fn run_str(&mut self, src: &str, out: &mut dyn Write) -> io::Result<bool> {
        tracing::debug!(bytes = src.len(), "render from string");
        self.run_lex(Lex::from_str(src), out)
    }

    /// Render a template file into `out`.  Returns `true` when template
    /// errors were recorded; an unreadable top-level file is an `io::Error`.
    pub fn run_file(&mut self, path: impl AsRef<Path>, out: &mut dyn Write) -> io::Result<bool> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "render from file");
        let buf = Buffer::from_file(path)?;
        self.run_lex(Lex::new(buf), out)
    }

    fn run_lex(&mut self, lex: Lex, out: &mut dyn Write) -> io::Result<bool> {
        self.errors.clear();
        let mut exec = Exec {
            lex,
            syms: &mut self.symbols,
            macros: &mut self.macros,
            funcs: &mut self.funcs,
            includes: &self.include_paths,
            errors: &mut self.errors,
            rng: &mut self.rng,
            out,
            loop_depth: 0,
            block_level: 0,
            flag_next: false,
            flag_last: false,
            fatal: false,
        };
        exec.parse_main()?;
        if !self.errors.is_empty() {
            tracing::debug!(errors = self.errors.len(), "render finished with errors");
        }
        Ok(!self.errors.is_empty())
    }
}

// ── Exec ──────────────────────────────────────────────────────────────────────

/// One interpreter activation: a lexer over one source (top-level template,
/// include file, macro body, `@eval` text) plus borrows of the shared render
/// state.  Nested activations share everything but the lexer and flags.
pub(crate) struct Exec<'a> {
    pub(crate) lex: Lex,
    pub(crate) syms: &'a mut Symbols,
    pub(crate) macros: &'a mut MacroTable,
    pub(crate) funcs: &'a mut FunctionTable,
    pub(crate) includes: &'a [PathBuf],
    pub(crate) errors: &'a mut ErrorLog,
    pub(crate) rng: &'a mut u64,
    pub(crate) out: &'a mut dyn Write,
    /// Nesting depth of `@foreach`/`@while` bodies; `@next`/`@last` are only
    /// legal above zero.
    pub(crate) loop_depth: u32,
    /// `{}` nesting depth; `@macro` is only legal at zero.
    pub(crate) block_level: u32,
    /// Out-of-band loop signals, consulted after each statement.
    pub(crate) flag_next: bool,
    pub(crate) flag_last: bool,
    /// Hard abort: stop this render, keep what was written.
    pub(crate) fatal: bool,
}

impl Exec<'_> {
    // ── Error helpers ─────────────────────────────────────────────────────────

    pub(crate) fn record(&mut self, message: impl std::fmt::Display, near: &Token) {
        self.errors.record(message, near.line, Some(near));
    }

    pub(crate) fn record_line(&mut self, message: impl std::fmt::Display, line: u32) {
        self.errors.record(message, line, None);
    }

    fn emit(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())
    }

    // ── Statement loop ────────────────────────────────────────────────────────

    /// Top-level statement loop: runs to end of input.
    pub(crate) fn parse_main(&mut self) -> io::Result<()> {
        loop {
            let t = self.lex.get_loose_token();
            if t.kind == TokenKind::Eof {
                return Ok(());
            }
            self.dispatch(t)?;
            if self.fatal {
                return Ok(());
            }
        }
    }

    /// Execute one `{…}` block.  Returns `false` (after recording) when no
    /// block follows.  Consults the loop flags after every statement so
    /// `@next`/`@last` stop execution mid-block; the remainder is then
    /// skipped lexically.
    pub(crate) fn parse_block(&mut self) -> io::Result<bool> {
        let mut t = self.lex.get_loose_token();
        while t.kind == TokenKind::Whitespace {
            t = self.lex.get_loose_token();
        }
        if t.kind != TokenKind::OpenBrace {
            self.record("expected '{'", &t);
            self.lex.unget(t);
            return Ok(false);
        }

        self.block_level += 1;
        let mut stray = 0u32;
        loop {
            let t = self.lex.get_loose_token();
            match t.kind {
                TokenKind::Eof => {
                    self.record_line("unexpected end of template in block", t.line);
                    break;
                }
                TokenKind::CloseBrace if stray == 0 => break,
                TokenKind::CloseBrace => {
                    stray -= 1;
                    self.emit(&t.text)?;
                }
                TokenKind::OpenBrace => {
                    stray += 1;
                    self.emit(&t.text)?;
                }
                _ => self.dispatch(t)?,
            }
            if self.flag_next || self.flag_last || self.fatal {
                if let Err(e) = self.lex.consume_block_rest(stray + 1) {
                    let line = self.lex.line();
                    self.record_line(e, line);
                }
                break;
            }
        }
        self.block_level -= 1;
        Ok(true)
    }

    /// A loop body block: identical to [`Exec::parse_block`]; named for the
    /// call sites that run under an active loop.
    fn parse_loopblock(&mut self) -> io::Result<bool> {
        self.parse_block()
    }

    /// Execute one loose token: emit it, or dispatch a statement.
    fn dispatch(&mut self, t: Token) -> io::Result<()> {
        match t.kind {
            TokenKind::Eof => Ok(()),
            TokenKind::Comment | TokenKind::JoinLine => Ok(()),
            TokenKind::Error => {
                self.record("lexical error", &t);
                Ok(())
            }
            TokenKind::Text
            | TokenKind::Whitespace
            | TokenKind::Escape
            | TokenKind::OpenBrace
            | TokenKind::CloseBrace
            | TokenKind::Integer
            | TokenKind::Str
            | TokenKind::Operator
            | TokenKind::RelOp
            | TokenKind::OpenParen
            | TokenKind::CloseParen
            | TokenKind::Comma => self.emit(&t.text),
            TokenKind::Id => self.interpolate(&t),
            TokenKind::If => self.stmt_if(),
            TokenKind::Elsif => {
                self.record("'@elsif' without '@if'", &t);
                self.skip_paren_group();
                self.skip_block();
                Ok(())
            }
            TokenKind::Else => {
                self.record("'@else' without '@if'", &t);
                self.skip_block();
                Ok(())
            }
            TokenKind::Foreach => self.stmt_foreach(),
            TokenKind::While => self.stmt_while(),
            TokenKind::Macro => self.stmt_macro_def(&t),
            TokenKind::Set => self.stmt_set(false),
            TokenKind::SetIf => self.stmt_set(true),
            TokenKind::Unset => self.stmt_unset(),
            TokenKind::Push => self.stmt_push(),
            TokenKind::Pop => self.stmt_pop(),
            TokenKind::Keys => self.stmt_keys(),
            TokenKind::Include => self.stmt_include(&t),
            TokenKind::IncludeText => self.stmt_includetext(&t),
            TokenKind::Next => {
                if self.loop_depth == 0 {
                    self.record("'@next' outside of loop", &t);
                } else {
                    self.flag_next = true;
                }
                Ok(())
            }
            TokenKind::Last => {
                if self.loop_depth == 0 {
                    self.record("'@last' outside of loop", &t);
                } else {
                    self.flag_last = true;
                }
                Ok(())
            }
            TokenKind::Using => {
                self.record("'@using' is not supported", &t);
                self.skip_paren_group();
                Ok(())
            }
            TokenKind::UserMacro => self.call_statement(&t),
            k if k.is_pseudo_func() => self.call_statement(&t),
            // All kinds are covered above; keep the compiler satisfied.
            _ => Ok(()),
        }
    }

    /// `$name` / `${path}` in output position.
    fn interpolate(&mut self, t: &Token) -> io::Result<()> {
        let name = strip_sigil(&t.text);
        match self.syms.get_copy(name) {
            Ok(Some(v)) => match v.to_text() {
                Ok(s) => return self.emit(s),
                Err(e) => self.record(format!("{e} for '{}'", t.text), t),
            },
            Ok(None) => {}
            Err(e) => self.record(e, t),
        }
        Ok(())
    }

    // ── @if / @elsif / @else ──────────────────────────────────────────────────

    fn stmt_if(&mut self) -> io::Result<()> {
        let cond = self.parse_condition()?;
        if cond {
            self.parse_block()?;
            if self.flag_next || self.flag_last || self.fatal {
                // The enclosing block skip will swallow any trailing clauses.
                return Ok(());
            }
            // Exactly one branch runs: skip the remaining clauses lexically.
            loop {
                let t = self.lex.get_strict_token();
                match t.kind {
                    TokenKind::Elsif => {
                        self.skip_paren_group();
                        self.skip_block();
                    }
                    TokenKind::Else => self.skip_block(),
                    TokenKind::Eof => break,
                    _ => {
                        self.lex.unget(t);
                        break;
                    }
                }
            }
            Ok(())
        } else {
            self.skip_block();
            let t = self.lex.get_strict_token();
            match t.kind {
                // An @elsif restarts the state machine with its own test.
                TokenKind::Elsif => self.stmt_if(),
                TokenKind::Else => {
                    self.parse_block()?;
                    Ok(())
                }
                TokenKind::Eof => Ok(()),
                _ => {
                    self.lex.unget(t);
                    Ok(())
                }
            }
        }
    }

    /// Skip a `{…}` block, recording when there is none to skip.
    fn skip_block(&mut self) {
        if let Err(e) = self.lex.ignore_block() {
            let line = self.lex.line();
            self.record_line(e, line);
        }
    }

    /// Lexically skip a balanced `(...)` group without evaluating it (used
    /// for untaken `@elsif` tests).  Leaves the stream untouched when no
    /// group follows.
    pub(crate) fn skip_paren_group(&mut self) {
        let t = self.lex.get_strict_token();
        if t.kind != TokenKind::OpenParen {
            self.lex.unget(t);
            return;
        }
        let mut depth = 1u32;
        loop {
            let t = self.lex.get_strict_token();
            match t.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                TokenKind::Eof => {
                    self.record_line("unexpected end of template in '(…)'", t.line);
                    return;
                }
                _ => {}
            }
        }
    }

    // ── @foreach ──────────────────────────────────────────────────────────────

    fn stmt_foreach(&mut self) -> io::Result<()> {
        let mut t = self.lex.get_strict_token();
        let var = if t.kind == TokenKind::Id {
            let name = strip_sigil(&t.text).to_owned();
            t = self.lex.get_strict_token();
            name
        } else {
            ".".to_owned()
        };
        self.lex.unget(t);

        let args = self.parse_paren_list()?;
        let mut items: Vec<Value> = Vec::new();
        for arg in args {
            match arg {
                Value::Array(elems) => items.extend(elems),
                Value::Hash(map) => items.extend(map.into_values()),
                other => items.push(other.into_stored()),
            }
        }

        if items.is_empty() {
            // An empty list never opens the block.
            self.skip_block();
            return Ok(());
        }

        let mark = self.lex.index();
        let mark_line = self.lex.line();
        let saved = self.syms.get_copy(&var).unwrap_or(None);

        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.lex.seek(mark);
                self.lex.set_line(mark_line);
            }
            if let Err(e) = self.syms.set(&var, item) {
                self.record_line(e, mark_line);
                break;
            }
            self.loop_depth += 1;
            self.flag_next = false;
            let found = self.parse_loopblock()?;
            self.loop_depth -= 1;
            if !found || self.fatal {
                break;
            }
            if self.flag_last {
                self.flag_last = false;
                break;
            }
        }
        self.flag_next = false;

        self.restore_binding(&var, saved, mark_line);
        Ok(())
    }

    /// Re-install (or remove) a shadowed binding after a loop or macro call.
    fn restore_binding(&mut self, name: &str, saved: Option<Value>, line: u32) {
        let result = match saved {
            Some(v) => self.syms.set(name, v),
            None => self.syms.unset(name),
        };
        if let Err(e) = result {
            self.record_line(e, line);
        }
    }

    // ── @while ────────────────────────────────────────────────────────────────

    fn stmt_while(&mut self) -> io::Result<()> {
        let mark = self.lex.index();
        let mark_line = self.lex.line();
        loop {
            self.lex.seek(mark);
            self.lex.set_line(mark_line);
            let cond = self.parse_condition()?;
            if self.fatal {
                break;
            }
            if !cond {
                self.skip_block();
                break;
            }
            self.loop_depth += 1;
            self.flag_next = false;
            let found = self.parse_loopblock()?;
            self.loop_depth -= 1;
            if !found || self.fatal {
                break;
            }
            if self.flag_last {
                self.flag_last = false;
                break;
            }
        }
        self.flag_next = false;
        Ok(())
    }

    // ── @macro ────────────────────────────────────────────────────────────────

    fn stmt_macro_def(&mut self, kw: &Token) -> io::Result<()> {
        if self.block_level > 0 {
            self.record("'@macro' is only allowed at the top level", kw);
            self.skip_paren_group();
            self.skip_block();
            return Ok(());
        }

        // A malformed declaration is a hard abort: record, then stop.
        let open = self.lex.get_strict_token();
        if open.kind != TokenKind::OpenParen {
            self.record("malformed '@macro' declaration", &open);
            self.fatal = true;
            return Ok(());
        }
        let name_tok = self.lex.get_strict_token();
        if name_tok.kind != TokenKind::Id {
            self.record("expected macro name", &name_tok);
            self.fatal = true;
            return Ok(());
        }
        let name = strip_sigil(&name_tok.text).to_owned();

        let mut params = Vec::new();
        loop {
            let t = self.lex.get_strict_token();
            match t.kind {
                TokenKind::CloseParen => break,
                TokenKind::Comma => {
                    let p = self.lex.get_strict_token();
                    if p.kind != TokenKind::Id {
                        self.record("expected parameter name", &p);
                        self.fatal = true;
                        return Ok(());
                    }
                    params.push(strip_sigil(&p.text).to_owned());
                }
                _ => {
                    self.record("malformed '@macro' declaration", &t);
                    self.fatal = true;
                    return Ok(());
                }
            }
        }

        match self.lex.get_block() {
            Ok(block) => {
                tracing::trace!(name = %name, params = params.len(), "macro defined");
                self.macros.define(Macro {
                    name,
                    params,
                    body: block.text,
                    line: block.line,
                });
            }
            Err(e) => {
                let line = self.lex.line();
                self.record_line(format!("'@macro': {e}"), line);
                self.fatal = true;
            }
        }
        Ok(())
    }

    // ── @set / @setif / @unset ────────────────────────────────────────────────

    fn stmt_set(&mut self, only_if_unset: bool) -> io::Result<()> {
        let Some((name, name_line)) = self.parse_paren_name()? else {
            self.skip_paren_group();
            return Ok(());
        };
        let values = self.parse_paren_list()?;

        if only_if_unset {
            match self.syms.get(&name) {
                Ok(Some(v)) if !v.is_empty() => return Ok(()),
                Err(e) => {
                    self.record_line(e, name_line);
                    return Ok(());
                }
                _ => {}
            }
        }

        let value = assemble_value(values);
        if let Err(e) = self.syms.set(&name, value) {
            self.record_line(e, name_line);
        }
        Ok(())
    }

    fn stmt_unset(&mut self) -> io::Result<()> {
        let Some((name, line)) = self.parse_paren_name()? else {
            return Ok(());
        };
        if let Err(e) = self.syms.unset(&name) {
            self.record_line(e, line);
        }
        Ok(())
    }

    // ── @push / @pop / @keys ──────────────────────────────────────────────────

    fn stmt_push(&mut self) -> io::Result<()> {
        let Some((name, line)) = self.parse_paren_name()? else {
            self.skip_paren_group();
            return Ok(());
        };
        let values = self.parse_paren_list()?;
        for v in values {
            if let Err(e) = self.syms.push(&name, v.into_stored()) {
                self.record_line(e, line);
                break;
            }
        }
        Ok(())
    }

    fn stmt_pop(&mut self) -> io::Result<()> {
        // @pop(dest, src) — one group, two names.
        let open = self.lex.get_strict_token();
        if open.kind != TokenKind::OpenParen {
            self.record("expected '('", &open);
            self.lex.unget(open);
            return Ok(());
        }
        let dest_tok = self.lex.get_strict_token();
        let comma = self.lex.get_strict_token();
        let src_tok = self.lex.get_strict_token();
        let close = self.lex.get_strict_token();
        if dest_tok.kind != TokenKind::Id
            || comma.kind != TokenKind::Comma
            || src_tok.kind != TokenKind::Id
            || close.kind != TokenKind::CloseParen
        {
            self.record("'@pop' expects (destination, array)", &dest_tok);
            return Ok(());
        }
        let dest = strip_sigil(&dest_tok.text).to_owned();
        let src = strip_sigil(&src_tok.text).to_owned();

        match self.syms.pop(&src) {
            Ok(popped) => {
                let v = popped.unwrap_or_default();
                if let Err(e) = self.syms.set(&dest, v) {
                    self.record(e, &dest_tok);
                }
            }
            Err(e) => self.record(e, &src_tok),
        }
        Ok(())
    }

    fn stmt_keys(&mut self) -> io::Result<()> {
        let Some((dest, line)) = self.parse_paren_name()? else {
            self.skip_paren_group();
            return Ok(());
        };
        let args = self.parse_paren_list()?;
        match args.first() {
            Some(Value::Hash(map)) => {
                let keys: Vec<Value> = map.keys().map(Value::scalar).collect();
                if let Err(e) = self.syms.set(&dest, Value::Array(keys)) {
                    self.record_line(e, line);
                }
            }
            Some(other) => {
                self.record_line(
                    format!("'@keys' expects a hash, found {}", other.kind_name()),
                    line,
                );
            }
            None => self.record_line("'@keys' expects a hash argument", line),
        }
        Ok(())
    }

    // ── @include / @includetext ───────────────────────────────────────────────

    fn stmt_include(&mut self, kw: &Token) -> io::Result<()> {
        let Some(name) = self.parse_file_arg(kw)? else {
            return Ok(());
        };
        let path = self.resolve_include(&name);
        let buf = match Buffer::from_file(&path) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "include failed");
                self.record(format!("unable to read include file '{name}': {e}"), kw);
                self.fatal = true;
                return Ok(());
            }
        };
        tracing::debug!(file = %path.display(), "include");

        let mut child = Exec {
            lex: Lex::new(buf),
            syms: &mut *self.syms,
            macros: &mut *self.macros,
            funcs: &mut *self.funcs,
            includes: self.includes,
            errors: &mut *self.errors,
            rng: &mut *self.rng,
            out: &mut *self.out,
            loop_depth: 0,
            block_level: 0,
            flag_next: false,
            flag_last: false,
            fatal: false,
        };
        child.parse_main()?;
        if child.fatal {
            self.fatal = true;
        }
        Ok(())
    }

    fn stmt_includetext(&mut self, kw: &Token) -> io::Result<()> {
        let Some(name) = self.parse_file_arg(kw)? else {
            return Ok(());
        };
        let path = self.resolve_include(&name);
        match std::fs::read(&path) {
            Ok(bytes) => self.out.write_all(&bytes),
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "includetext failed");
                self.record(format!("unable to read include file '{name}': {e}"), kw);
                self.fatal = true;
                Ok(())
            }
        }
    }

    fn parse_file_arg(&mut self, kw: &Token) -> io::Result<Option<String>> {
        let args = self.parse_paren_list()?;
        match args.first().map(|v| v.to_text().map(str::to_owned)) {
            Some(Ok(name)) if !name.is_empty() => Ok(Some(name)),
            Some(Ok(_)) | None => {
                self.record("expected file name", kw);
                Ok(None)
            }
            Some(Err(e)) => {
                self.record(format!("{e} for include file name"), kw);
                Ok(None)
            }
        }
    }

    /// Search the ordered include path, then fall back to the literal name.
    fn resolve_include(&self, name: &str) -> PathBuf {
        for dir in self.includes {
            let candidate = dir.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(name)
    }

    // ── Calls in statement position ───────────────────────────────────────────

    /// `@name(args)` or a pseudo-function used inline: the produced text goes
    /// straight to the output sink.
    fn call_statement(&mut self, tok: &Token) -> io::Result<()> {
        if tok.kind.is_pseudo_func() {
            let args = self.parse_paren_list()?;
            match self.call_pseudo(tok.kind, &args) {
                Ok(v) => match v.to_text() {
                    Ok(s) => return self.emit(s),
                    Err(e) => self.record(e, tok),
                },
                Err(e) => self.record(e, tok),
            }
            return Ok(());
        }

        let name = tok.text[1..].to_owned();
        if name == "eval" {
            let args = self.parse_paren_list()?;
            let rendered = self.eval_template_arg(&args, tok)?;
            return self.emit(&rendered);
        }
        if crate::builtins::is_builtin(&name) {
            let args = self.parse_paren_list()?;
            match crate::builtins::call_builtin(&name, &args) {
                Some(Ok(v)) => match v.to_text() {
                    Ok(s) => return self.emit(s),
                    Err(e) => self.record(e, tok),
                },
                Some(Err(e)) => self.record(e, tok),
                None => self.record(format!("undefined macro or function '@{name}'"), tok),
            }
            return Ok(());
        }
        if self.macros.contains(&name) {
            let args = self.parse_paren_list()?;
            self.invoke_macro(tok, &args, false)?;
            return Ok(());
        }
        if self.funcs.contains(&name) {
            let args = self.parse_paren_list()?;
            self.call_native(tok, &args, false)?;
            return Ok(());
        }

        self.record(format!("undefined macro or function '@{name}'"), tok);
        self.skip_paren_group();
        Ok(())
    }

    /// Dispatch one of the expression pseudo-functions.
    pub(crate) fn call_pseudo(&mut self, kind: TokenKind, args: &[Value]) -> Result<Value, String> {
        match kind {
            TokenKind::Compare => crate::builtins::compare(args),
            TokenKind::Empty => crate::builtins::empty(args),
            TokenKind::Size => crate::builtins::size(args),
            TokenKind::IsArray => crate::builtins::is_array(args),
            TokenKind::IsHash => crate::builtins::is_hash(args),
            TokenKind::IsScalar => crate::builtins::is_scalar(args),
            TokenKind::Rand => self.builtin_rand(args),
            other => Err(format!("'@{}' is not a function", other.name())),
        }
    }

    /// `@rand(limit)` — xorshift64 over per-interpreter state.
    fn builtin_rand(&mut self, args: &[Value]) -> Result<Value, String> {
        let limit = match args.first() {
            Some(v) => str2num(v.to_text().map_err(|e| format!("@rand: {e}"))?),
            None => 0,
        };
        if limit <= 0 {
            return Err("@rand: positive limit required".to_owned());
        }
        Ok(Value::scalar(num2str(
            (self.rand_next() % limit as u64) as i64,
        )))
    }

    /// Advance the interpreter's PRNG, seeding it lazily from wall-clock
    /// time and the process id.  Not cryptographic; template-visible
    /// randomness only.
    fn rand_next(&mut self) -> u64 {
        let mut s = *self.rng;
        if s == 0 {
            s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9e37_79b9_7f4a_7c15)
                ^ ((std::process::id() as u64) << 32);
            if s == 0 {
                s = 0x9e37_79b9_7f4a_7c15;
            }
        }
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        *self.rng = s;
        s
    }

    /// `@eval(text)` — render the argument as a nested template sharing the
    /// caller's state; the rendered output is the result.
    pub(crate) fn eval_template_arg(
        &mut self,
        args: &[Value],
        tok: &Token,
    ) -> io::Result<String> {
        let src = match args.first().map(|v| v.to_text().map(str::to_owned)) {
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                self.record(format!("@eval: {e}"), tok);
                return Ok(String::new());
            }
            None => {
                self.record("@eval: missing argument", tok);
                return Ok(String::new());
            }
        };
        self.render_nested(Lex::from_str(&src), false)
    }

    /// Run a nested activation over `lex`, capturing its output.  With
    /// `as_block` the source is a brace-wrapped macro body.
    pub(crate) fn render_nested(&mut self, lex: Lex, as_block: bool) -> io::Result<String> {
        let mut buf: Vec<u8> = Vec::new();
        let fatal = {
            let mut child = Exec {
                lex,
                syms: &mut *self.syms,
                macros: &mut *self.macros,
                funcs: &mut *self.funcs,
                includes: self.includes,
                errors: &mut *self.errors,
                rng: &mut *self.rng,
                out: &mut buf,
                loop_depth: 0,
                block_level: 0,
                flag_next: false,
                flag_last: false,
                fatal: false,
            };
            if as_block {
                child.parse_block()?;
            } else {
                child.parse_main()?;
            }
            child.fatal
        };
        if fatal {
            self.fatal = true;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Invoke a user macro: bind parameters dynamically in the shared symbol
    /// table (saving shadowed bindings), re-parse the stored body, restore.
    /// With `capture` the body's output is returned instead of written.
    pub(crate) fn invoke_macro(
        &mut self,
        tok: &Token,
        args: &[Value],
        capture: bool,
    ) -> io::Result<Option<String>> {
        let name = &tok.text[1..];
        let Some(mac) = self.macros.get(name).cloned() else {
            self.record(format!("undefined macro '@{name}'"), tok);
            return Ok(None);
        };
        tracing::trace!(name = %mac.name, args = args.len(), capture, "macro call");

        if args.len() != mac.params.len() {
            self.record(
                format!(
                    "wrong number of parameters for macro '@{name}' (expected {}, got {})",
                    mac.params.len(),
                    args.len()
                ),
                tok,
            );
        }

        // Dynamic scoping: shadow frame of saved bindings, restored below.
        let mut frame: Vec<(String, Option<Value>)> = Vec::with_capacity(mac.params.len());
        for (i, param) in mac.params.iter().enumerate() {
            let old = self.syms.get_copy(param).unwrap_or(None);
            frame.push((param.clone(), old));
            let v = args
                .get(i)
                .cloned()
                .map(Value::into_stored)
                .unwrap_or_default();
            if let Err(e) = self.syms.set(param, v) {
                self.record(e, tok);
            }
        }

        let mut lex = Lex::from_str(&mac.body);
        lex.set_line(mac.line);
        let result = if capture {
            Some(self.render_nested(lex, true)?)
        } else {
            let fatal = {
                let mut child = Exec {
                    lex,
                    syms: &mut *self.syms,
                    macros: &mut *self.macros,
                    funcs: &mut *self.funcs,
                    includes: self.includes,
                    errors: &mut *self.errors,
                    rng: &mut *self.rng,
                    out: &mut *self.out,
                    loop_depth: 0,
                    block_level: 0,
                    flag_next: false,
                    flag_last: false,
                    fatal: false,
                };
                child.parse_block()?;
                child.fatal
            };
            if fatal {
                self.fatal = true;
            }
            None
        };

        for (param, old) in frame.into_iter().rev() {
            let restored = match old {
                Some(v) => self.syms.set(&param, v),
                None => self.syms.unset(&param),
            };
            if let Err(e) = restored {
                self.record(e, tok);
            }
        }
        Ok(result)
    }

    /// Call a native function; `Err` from the callback is downgraded to a
    /// recorded error.  With `capture` its output is returned instead of
    /// written.
    pub(crate) fn call_native(
        &mut self,
        tok: &Token,
        args: &[Value],
        capture: bool,
    ) -> io::Result<Option<String>> {
        let name = &tok.text[1..];
        let Some(f) = self.funcs.get(name) else {
            self.record(format!("undefined function '@{name}'"), tok);
            return Ok(None);
        };
        if capture {
            let mut buf: Vec<u8> = Vec::new();
            let result = f(&mut buf, args);
            if let Err(msg) = result {
                self.record(format!("function '@{name}' failed: {msg}"), tok);
            }
            Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
        } else {
            let result = f(&mut *self.out, args);
            if let Err(msg) = result {
                self.record(format!("function '@{name}' failed: {msg}"), tok);
            }
            Ok(None)
        }
    }

    // ── Small parsers shared by the statement handlers ────────────────────────

    /// `(name)` — a single identifier in parentheses.  Returns the bare
    /// symbol path and the line it appeared on.
    fn parse_paren_name(&mut self) -> io::Result<Option<(String, u32)>> {
        let open = self.lex.get_strict_token();
        if open.kind != TokenKind::OpenParen {
            self.record("expected '('", &open);
            self.lex.unget(open);
            return Ok(None);
        }
        let name_tok = self.lex.get_strict_token();
        if name_tok.kind != TokenKind::Id {
            self.record("expected identifier", &name_tok);
            self.skip_to_close_paren();
            return Ok(None);
        }
        let close = self.lex.get_strict_token();
        if close.kind != TokenKind::CloseParen {
            self.record("expected ')'", &close);
            self.skip_to_close_paren();
        }
        Ok(Some((
            strip_sigil(&name_tok.text).to_owned(),
            name_tok.line,
        )))
    }

    /// Recovery: consume strict tokens until the current paren group closes.
    pub(crate) fn skip_to_close_paren(&mut self) {
        let mut depth = 1u32;
        loop {
            let t = self.lex.get_strict_token();
            match t.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                TokenKind::Eof => return,
                _ => {}
            }
        }
    }
}

/// Collapse an argument list into the stored form: none → empty scalar, one
/// → that value, several → an array.
fn assemble_value(values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::default(),
        1 => values
            .into_iter()
            .next()
            .map(Value::into_stored)
            .unwrap_or_default(),
        _ => Value::Array(values.into_iter().map(Value::into_stored).collect()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn render(src: &str) -> (String, Vec<String>) {
        let mut interp = Interpreter::new();
        let mut out = Vec::new();
        interp.run_str(src, &mut out).expect("sink io");
        (
            String::from_utf8(out).expect("utf8 output"),
            interp.errors().to_vec(),
        )
    }

    fn render_ok(src: &str) -> String {
        let (out, errors) = render(src);
        assert_eq!(errors, Vec::<String>::new(), "unexpected errors");
        out
    }

    #[test]
    fn passthrough_text() {
        assert_eq!(render_ok("plain text, nothing special"), "plain text, nothing special");
    }

    #[test]
    fn interpolation() {
        let mut interp = Interpreter::new();
        interp.symbols_mut().set("name", "Ada").unwrap();
        let mut out = Vec::new();
        interp.run_str("hi ${name} ($name)", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hi Ada (Ada)");
    }

    #[test]
    fn unset_variable_renders_empty() {
        let (out, errors) = render("[${missing}]");
        assert_eq!(out, "[]");
        assert_eq!(errors, Vec::<String>::new());
    }

    #[test]
    fn escape_renders_escaped_char() {
        assert_eq!(render_ok("\\$x"), "$x");
        assert_eq!(render_ok("\\@if"), "@if");
    }

    #[test]
    fn joinline_renders_nothing() {
        assert_eq!(render_ok("a\\\nb"), "ab");
    }

    #[test]
    fn comment_is_dropped() {
        assert_eq!(render_ok("a@# gone\nb"), "a\nb");
        assert_eq!(render_ok("@# whole line comment\nb"), "b");
    }

    #[test]
    fn set_and_interpolate() {
        assert_eq!(render_ok("@set(x)(\"hello\")${x}"), "hello");
    }

    #[test]
    fn set_multiple_makes_array() {
        let src = "@set(a)(1, 2, 3)@size($a)";
        assert_eq!(render_ok(src), "3");
    }

    #[test]
    fn setif_only_when_unset() {
        assert_eq!(render_ok("@set(x)(\"v\")@setif(x)(\"w\")${x}"), "v");
        assert_eq!(render_ok("@setif(y)(\"w\")${y}"), "w");
    }

    #[test]
    fn unset_removes_symbol() {
        let (out, errors) = render("@set(x)(1)@unset(x)[${x}]");
        assert_eq!(out, "[]");
        assert_eq!(errors, Vec::<String>::new());
    }

    #[test]
    fn if_true_branch() {
        assert_eq!(render_ok("@if(1){A}@elsif(1){B}@else{C}"), "A");
    }

    #[test]
    fn if_elsif_branch() {
        assert_eq!(render_ok("@if(0){A}@elsif(1){B}@else{C}"), "B");
    }

    #[test]
    fn if_else_branch() {
        assert_eq!(render_ok("@if(0){A}@else{C}"), "C");
    }

    #[test]
    fn elsif_chain_skipped_after_taken_branch() {
        assert_eq!(render_ok("@if(1){A}@elsif(1){B}@elsif(1){C}@else{D}x"), "Ax");
    }

    #[test]
    fn if_condition_expression() {
        assert_eq!(render_ok("@if(2 + 2 == 4){yes}@else{no}"), "yes");
        assert_eq!(render_ok("@set(x)(5)@if($x > 3){big}@else{small}"), "big");
    }

    #[test]
    fn untaken_branches_not_evaluated() {
        // The skipped branch references an undefined macro; no error may
        // surface because skipped blocks are only scanned for braces.
        let (out, errors) = render("@if(1){ok}@else{@nosuch(1)}");
        assert_eq!(out, "ok");
        assert_eq!(errors, Vec::<String>::new());
    }

    #[test]
    fn foreach_iterates() {
        assert_eq!(
            render_ok("@set(l)(1,2,3)@foreach x($l){<${x}>}"),
            "<1><2><3>"
        );
    }

    #[test]
    fn foreach_default_loop_variable() {
        assert_eq!(render_ok("@set(l)(\"a\",\"b\")@foreach($l){[${.}]}"), "[a][b]");
    }

    #[test]
    fn foreach_empty_list_never_opens_block() {
        let (out, errors) = render("@foreach x(){@nosuch()}done");
        assert_eq!(out, "done");
        assert_eq!(errors, Vec::<String>::new());
    }

    #[test]
    fn foreach_scalar_args_iterate_once_each() {
        assert_eq!(render_ok("@foreach v(1, 2){${v};}"), "1;2;");
    }

    #[test]
    fn foreach_restores_shadowed_binding() {
        assert_eq!(
            render_ok("@set(x)(9)@foreach x(1,2){${x}}${x}"),
            "129"
        );
    }

    #[test]
    fn foreach_next_skips_rest_of_iteration() {
        let src = "@set(l)(1,2,3)@foreach x($l){a@if($x == 2){@next}b}";
        assert_eq!(render_ok(src), "abaab");
    }

    #[test]
    fn foreach_last_aborts_loop() {
        let src = "@set(l)(1,2,3)@foreach x($l){${x}@if($x == 2){@last}}";
        assert_eq!(render_ok(src), "12");
    }

    #[test]
    fn while_loop_counts() {
        let src = "@set(i)(0)@while($i < 3){${i}@set(i)($i + 1)}";
        assert_eq!(render_ok(src), "012");
    }

    #[test]
    fn while_false_never_opens_block() {
        assert_eq!(render_ok("@while(0){@nosuch()}after"), "after");
    }

    #[test]
    fn while_last_exits() {
        let src = "@set(i)(0)@while(1){@set(i)($i + 1)${i}@if($i == 2){@last}}";
        assert_eq!(render_ok(src), "12");
    }

    #[test]
    fn nested_loops_with_last() {
        let src = "@foreach a(1,2){@foreach b(8,9){${a}${b}@last}}";
        assert_eq!(render_ok(src), "1828");
    }

    #[test]
    fn next_outside_loop_is_error() {
        let (_, errors) = render("@next");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'@next' outside of loop"));
    }

    #[test]
    fn macro_definition_and_call() {
        let src = "@macro(hi, who){Hello, ${who}!}@hi(\"Ada\")";
        assert_eq!(render_ok(src), "Hello, Ada!");
    }

    #[test]
    fn macro_parameter_shadowing_restored() {
        let src = "@set(x)(1)@macro(m, x){@set(x)(2)}@m(9)${x}";
        assert_eq!(render_ok(src), "1");
    }

    #[test]
    fn macro_mutates_caller_symbols() {
        // Dynamic scoping: anything that is not a parameter is shared.
        let src = "@set(g)(1)@macro(m){@set(g)(2)}@m()${g}";
        assert_eq!(render_ok(src), "2");
    }

    #[test]
    fn macro_wrong_arity_records_error() {
        let (out, errors) = render("@macro(m, a, b){${a}${b}}@m(1)x");
        assert_eq!(out, "1x");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("wrong number of parameters"));
    }

    #[test]
    fn macro_only_at_top_level() {
        let (_, errors) = render("@if(1){@macro(m){x}}");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("top level"));
    }

    #[test]
    fn malformed_macro_is_fatal() {
        let (out, errors) = render("@macro(m{x}after");
        assert!(!errors.is_empty());
        assert!(!out.contains("after"));
    }

    #[test]
    fn push_pop_keys() {
        assert_eq!(
            render_ok("@push(a)(1)@push(a)(2)@pop(v, a)${v}@size($a)"),
            "21"
        );
        let src = "@set(h.x)(1)@set(h.y)(2)@keys(k)($h)@foreach n($k){${n};}";
        assert_eq!(render_ok(src), "x;y;");
    }

    #[test]
    fn pop_empty_array_yields_empty_scalar() {
        let (out, errors) = render("@pop(v, nothing)[${v}]");
        assert_eq!(out, "[]");
        assert_eq!(errors, Vec::<String>::new());
    }

    #[test]
    fn keys_on_scalar_is_error() {
        let (_, errors) = render("@set(s)(1)@keys(k)($s)");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("expects a hash"));
    }

    #[test]
    fn nested_paths() {
        let src = "@set(user.name)(\"Ada\")@set(user.id)(7)${user.name}:${user.id}";
        assert_eq!(render_ok(src), "Ada:7");
    }

    #[test]
    fn array_paths_and_dynamic_index() {
        let src = "@set(a[0])(\"x\")@set(a[1])(\"y\")@set(i)(1)${a[$i]}";
        assert_eq!(render_ok(src), "y");
    }

    #[test]
    fn dynamic_name_composition() {
        let src = "@set(which)(\"color\")@set(color)(\"red\")${$which}";
        assert_eq!(render_ok(src), "red");
    }

    #[test]
    fn array_or_hash_in_output_is_error() {
        let (out, errors) = render("@set(a)(1,2)[$a]");
        assert_eq!(out, "[]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("expected scalar"));
    }

    #[test]
    fn builtin_calls_in_statement_position() {
        assert_eq!(render_ok("@concat(\"a\",\"b\")"), "ab");
        assert_eq!(render_ok("@size(\"x\")"), "1");
        assert_eq!(render_ok("@uc(\"abc\")@lc(\"DEF\")"), "ABCdef");
        assert_eq!(render_ok("@lpad(\"7\", 3, \"0\")"), "007");
        assert_eq!(render_ok("@repeat(\"ab\", 2)"), "abab");
        assert_eq!(render_ok("@length(\"hello\")"), "5");
        assert_eq!(render_ok("@substr(\"template\", 1, 3)"), "emp");
        assert_eq!(render_ok("@sum(1, 2, 3)@avg(2, 4)"), "63");
        assert_eq!(render_ok("@compare(\"a\",\"b\")"), "-1");
    }

    #[test]
    fn set_with_builtin_result() {
        assert_eq!(render_ok("@set(x)(@concat(\"a\",\"b\"))${x}"), "ab");
    }

    #[test]
    fn size_of_hash_doubles() {
        let src = "@set(h.a)(1)@set(h.b)(2)@size($h)";
        assert_eq!(render_ok(src), "4");
    }

    #[test]
    fn isarray_ishash_isscalar() {
        let src = "@set(a)(1,2)@set(h.k)(1)@set(s)(1)\
@isarray($a)@ishash($h)@isscalar($s)@isarray($s)";
        assert_eq!(render_ok(src), "1110");
    }

    #[test]
    fn empty_builtin() {
        assert_eq!(render_ok("@empty($nothing)@set(x)(1)@empty($x)"), "10");
    }

    #[test]
    fn rand_within_limit() {
        let out = render_ok("@rand(10)");
        let n: i64 = out.parse().expect("number");
        assert!((0..10).contains(&n));
    }

    #[test]
    fn rand_without_limit_is_error() {
        let (_, errors) = render("@rand()");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("@rand"));
    }

    #[test]
    fn eval_renders_argument() {
        let src = "@set(x)(\"${y}\")@set(y)(\"deep\")@eval($x)";
        assert_eq!(render_ok(src), "deep");
    }

    #[test]
    fn native_function_call() {
        let mut interp = Interpreter::new();
        interp.register_function("shout", |out, args| {
            let s = args
                .first()
                .and_then(|v| v.to_text().ok())
                .unwrap_or_default()
                .to_uppercase();
            write!(out, "{s}!").map_err(|e| e.to_string())
        });
        let mut out = Vec::new();
        let had_errors = interp.run_str("@shout(\"hey\")", &mut out).unwrap();
        assert!(!had_errors);
        assert_eq!(String::from_utf8(out).unwrap(), "HEY!");
    }

    #[test]
    fn native_function_error_is_recorded_not_thrown() {
        let mut interp = Interpreter::new();
        interp.register_function("boom", |_out, _args| Err("kaboom".to_owned()));
        let mut out = Vec::new();
        let had_errors = interp.run_str("a@boom()b", &mut out).unwrap();
        assert!(had_errors);
        assert_eq!(String::from_utf8(out).unwrap(), "ab");
        assert!(interp.errors()[0].contains("kaboom"));
    }

    #[test]
    fn undefined_macro_is_recorded() {
        let (out, errors) = render("x@nosuch(1)y");
        assert_eq!(out, "xy");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("undefined macro or function '@nosuch'"));
    }

    #[test]
    fn using_is_recorded() {
        let (_, errors) = render("@using(something)");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'@using'"));
    }

    #[test]
    fn errors_carry_line_and_token_context() {
        let (_, errors) = render("line one\n@nosuch()");
        assert_eq!(errors.len(), 1);
        assert!(
            errors[0].ends_with("at line 2 near <usermacro> '@nosuch'"),
            "got: {}",
            errors[0]
        );
    }

    #[test]
    fn errors_cleared_between_runs() {
        let mut interp = Interpreter::new();
        let mut out = Vec::new();
        assert!(interp.run_str("@nosuch()", &mut out).unwrap());
        out.clear();
        assert!(!interp.run_str("fine", &mut out).unwrap());
        assert!(interp.errors().is_empty());
    }

    #[test]
    fn symbols_persist_between_runs() {
        let mut interp = Interpreter::new();
        let mut out = Vec::new();
        interp.run_str("@set(x)(41)", &mut out).unwrap();
        out.clear();
        interp.run_str("${x}", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "41");
    }

    #[test]
    fn stray_braces_pass_through() {
        assert_eq!(render_ok("a { b } c"), "a { b } c");
    }

    #[test]
    fn macro_with_loop_and_conditional() {
        let src = "\
@macro(list, items){@foreach i($items){@if($i == 2){two}@else{${i}}|}}\
@set(l)(1,2,3)@list($l)";
        assert_eq!(render_ok(src), "1|two|3|");
    }
}
