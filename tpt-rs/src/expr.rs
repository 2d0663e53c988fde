//! Recursive-descent expression evaluator.
//!
//! Expressions are evaluated directly off the token stream, tokens in and
//! tokens out: each precedence level takes the already-read left operand
//! token, reduces it in place, and returns the terminating token (the next
//! operator or the closing `)`/`,`) for its caller.
//!
//! Precedence, loosest first:
//!
//!   L0 argument list `(e1, e2, …)` →
//!   L1 logical `&& || ^^` (both sides always evaluated, no short-circuit) →
//!   L2 relational `== != < > <= >=` →
//!   L3 additive `+ -` →
//!   L4 multiplicative `* / %` →
//!   L5 unary `+ - !` →
//!   L6 parenthesized sub-expression →
//!   L7 leaf: literal, identifier, pseudo-function, macro/function call
//!
//! All arithmetic converts scalar text to a wrapping signed 64-bit integer,
//! operates, and converts back to text.  Relationals compare numerically
//! only when both sides are integer-kind tokens, otherwise by string.
//! Defective expressions record an error and yield an empty result; the
//! statement above proceeds best-effort.

use std::io;

use crate::interp::Exec;
use crate::lex::{num2str, str2num, Token, TokenKind};
use crate::symbols::strip_sigil;
use crate::value::Value;

/// Integer-looking text produces an integer-kind token (so relational
/// operators compare it numerically).
fn is_integer_text(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Replace a token in place with a computed result.
fn set_result(t: &mut Token, text: String, kind: TokenKind) {
    t.kind = kind;
    t.text = text;
}

fn set_int_result(t: &mut Token, n: i64) {
    set_result(t, num2str(n), TokenKind::Integer);
}

fn set_bool_result(t: &mut Token, b: bool) {
    set_result(t, if b { "1" } else { "0" }.to_owned(), TokenKind::Integer);
}

impl Exec<'_> {
    /// Build a result token from computed text, classifying integer-looking
    /// results so later relational operators compare them numerically.
    fn value_token(&self, text: String, like: &Token) -> Token {
        let kind = if is_integer_text(&text) {
            TokenKind::Integer
        } else {
            TokenKind::Str
        };
        Token {
            kind,
            text,
            line: like.line,
            column: like.column,
        }
    }

    // ── L0: argument lists ────────────────────────────────────────────────────

    /// Parse a parenthesized argument list.  A lone identifier argument
    /// resolves to its full [`Value`] (arrays and hashes survive); any other
    /// argument is evaluated to a scalar result token.
    pub(crate) fn parse_paren_list(&mut self) -> io::Result<Vec<Value>> {
        let open = self.lex.get_strict_token();
        if open.kind != TokenKind::OpenParen {
            self.record("expected '('", &open);
            self.lex.unget(open);
            return Ok(Vec::new());
        }

        let mut args = Vec::new();
        let first = self.lex.get_strict_token();
        if first.kind == TokenKind::CloseParen {
            return Ok(args);
        }
        self.lex.unget(first);

        loop {
            let (value, term) = self.parse_arg()?;
            args.push(value);
            match term.kind {
                TokenKind::Comma => continue,
                TokenKind::CloseParen => break,
                TokenKind::Eof => {
                    self.record("unexpected end of template in argument list", &term);
                    break;
                }
                _ => {
                    self.record("unexpected token in argument list", &term);
                    self.skip_to_close_paren();
                    break;
                }
            }
        }
        Ok(args)
    }

    /// One argument: lone-identifier detection, then the precedence chain.
    fn parse_arg(&mut self) -> io::Result<(Value, Token)> {
        let mut tok = self.lex.get_strict_token();

        if tok.kind == TokenKind::Id {
            let term = self.lex.get_strict_token();
            if matches!(
                term.kind,
                TokenKind::Comma | TokenKind::CloseParen | TokenKind::Eof
            ) {
                // A lone reference keeps its full shape.
                let name = strip_sigil(&tok.text);
                let value = match self.syms.get_copy(name) {
                    Ok(Some(v)) => v,
                    Ok(None) => Value::default(),
                    Err(e) => {
                        self.record(e, &tok);
                        Value::default()
                    }
                };
                return Ok((value, term));
            }
            // Not lone: reduce the identifier to its scalar and feed the
            // pending operator into the precedence chain.
            self.resolve_leaf(&mut tok)?;
            let term = self.chain_up(&mut tok, term)?;
            return Ok((Value::Token(tok), term));
        }

        let term = self.parse_level1(&mut tok)?;
        Ok((Value::Token(tok), term))
    }

    /// Continue the operator chain above an already-reduced leaf, starting
    /// from a pending operator token.
    fn chain_up(&mut self, left: &mut Token, pending: Token) -> io::Result<Token> {
        let t = self.level4_chain(left, pending)?;
        let t = self.level3_chain(left, t)?;
        let t = self.level2_chain(left, t)?;
        self.level1_chain(left, t)
    }

    /// Parse `(expr)` for statement headers (`@if`, `@while`): exactly one
    /// scalar expression.
    pub(crate) fn parse_paren_scalar(&mut self) -> io::Result<Token> {
        let open = self.lex.get_strict_token();
        if open.kind != TokenKind::OpenParen {
            self.record("expected '('", &open);
            let empty = self.value_token(String::new(), &open);
            self.lex.unget(open);
            return Ok(empty);
        }

        let mut left = self.lex.get_strict_token();
        if left.kind == TokenKind::CloseParen {
            self.record("empty expression", &left);
            set_result(&mut left, String::new(), TokenKind::Str);
            return Ok(left);
        }
        let term = self.parse_level1(&mut left)?;
        if term.kind != TokenKind::CloseParen {
            self.record("unmatched parenthesis", &term);
            if term.kind != TokenKind::Eof {
                self.skip_to_close_paren();
            }
        }
        Ok(left)
    }

    /// Statement-condition helper: `(expr)` → truthiness.
    pub(crate) fn parse_condition(&mut self) -> io::Result<bool> {
        let t = self.parse_paren_scalar()?;
        Ok(str2num(&t.text) != 0)
    }

    // ── L1: logical ───────────────────────────────────────────────────────────

    pub(crate) fn parse_level1(&mut self, left: &mut Token) -> io::Result<Token> {
        let op = self.parse_level2(left)?;
        self.level1_chain(left, op)
    }

    fn level1_chain(&mut self, left: &mut Token, mut op: Token) -> io::Result<Token> {
        while op.kind == TokenKind::Operator
            && matches!(op.text.as_str(), "&&" | "||" | "^^")
        {
            let mut right = self.lex.get_strict_token();
            let next = self.parse_level2(&mut right)?;
            // Both sides are always evaluated; no short-circuit.
            let l = str2num(&left.text) != 0;
            let r = str2num(&right.text) != 0;
            let v = match op.text.as_str() {
                "&&" => l && r,
                "||" => l || r,
                _ => l != r,
            };
            set_bool_result(left, v);
            op = next;
        }
        Ok(op)
    }

    // ── L2: relational ────────────────────────────────────────────────────────

    fn parse_level2(&mut self, left: &mut Token) -> io::Result<Token> {
        let op = self.parse_level3(left)?;
        self.level2_chain(left, op)
    }

    fn level2_chain(&mut self, left: &mut Token, mut op: Token) -> io::Result<Token> {
        while op.kind == TokenKind::RelOp {
            let mut right = self.lex.get_strict_token();
            let next = self.parse_level3(&mut right)?;
            let ordering = if left.kind == TokenKind::Integer && right.kind == TokenKind::Integer
            {
                str2num(&left.text).cmp(&str2num(&right.text))
            } else {
                left.text.as_str().cmp(right.text.as_str())
            };
            let v = match op.text.as_str() {
                "==" | "=" => ordering.is_eq(),
                "!=" => ordering.is_ne(),
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                ">=" => ordering.is_ge(),
                other => {
                    self.record(format!("unknown relational operator '{other}'"), &op);
                    false
                }
            };
            set_bool_result(left, v);
            op = next;
        }
        Ok(op)
    }

    // ── L3: additive ──────────────────────────────────────────────────────────

    fn parse_level3(&mut self, left: &mut Token) -> io::Result<Token> {
        let op = self.parse_level4(left)?;
        self.level3_chain(left, op)
    }

    fn level3_chain(&mut self, left: &mut Token, mut op: Token) -> io::Result<Token> {
        while op.kind == TokenKind::Operator && matches!(op.text.as_str(), "+" | "-") {
            let mut right = self.lex.get_strict_token();
            let next = self.parse_level4(&mut right)?;
            let l = str2num(&left.text);
            let r = str2num(&right.text);
            let v = if op.text == "+" {
                l.wrapping_add(r)
            } else {
                l.wrapping_sub(r)
            };
            set_int_result(left, v);
            op = next;
        }
        Ok(op)
    }

    // ── L4: multiplicative ────────────────────────────────────────────────────

    fn parse_level4(&mut self, left: &mut Token) -> io::Result<Token> {
        let op = self.parse_level5(left)?;
        self.level4_chain(left, op)
    }

    fn level4_chain(&mut self, left: &mut Token, mut op: Token) -> io::Result<Token> {
        while op.kind == TokenKind::Operator && matches!(op.text.as_str(), "*" | "/" | "%") {
            let mut right = self.lex.get_strict_token();
            let next = self.parse_level5(&mut right)?;
            let l = str2num(&left.text);
            let r = str2num(&right.text);
            let v = match op.text.as_str() {
                "*" => l.wrapping_mul(r),
                "/" => {
                    if r == 0 {
                        self.record("division by zero", &op);
                        0
                    } else {
                        l.wrapping_div(r)
                    }
                }
                _ => {
                    if r == 0 {
                        self.record("modulo by zero", &op);
                        0
                    } else {
                        l.wrapping_rem(r)
                    }
                }
            };
            set_int_result(left, v);
            op = next;
        }
        Ok(op)
    }

    // ── L5: unary ─────────────────────────────────────────────────────────────

    fn parse_level5(&mut self, left: &mut Token) -> io::Result<Token> {
        if left.kind == TokenKind::Operator && matches!(left.text.as_str(), "+" | "-" | "!") {
            let op_text = std::mem::take(&mut left.text);
            let mut operand = self.lex.get_strict_token();
            let term = self.parse_level5(&mut operand)?;
            let n = str2num(&operand.text);
            let v = match op_text.as_str() {
                "-" => n.wrapping_neg(),
                "+" => n,
                _ => i64::from(n == 0),
            };
            set_int_result(left, v);
            return Ok(term);
        }
        self.parse_level6(left)
    }

    // ── L6: parenthesization ──────────────────────────────────────────────────

    fn parse_level6(&mut self, left: &mut Token) -> io::Result<Token> {
        if left.kind == TokenKind::OpenParen {
            let mut inner = self.lex.get_strict_token();
            if inner.kind == TokenKind::CloseParen {
                self.record("empty expression", &inner);
                set_result(left, String::new(), TokenKind::Str);
                return Ok(self.lex.get_strict_token());
            }
            let term = self.parse_level1(&mut inner)?;
            if term.kind != TokenKind::CloseParen {
                self.record("unmatched parenthesis", &term);
                *left = inner;
                return Ok(term);
            }
            *left = inner;
            return Ok(self.lex.get_strict_token());
        }
        self.parse_level7(left)
    }

    // ── L7: leaf resolution ───────────────────────────────────────────────────

    fn parse_level7(&mut self, left: &mut Token) -> io::Result<Token> {
        self.resolve_leaf(left)?;
        Ok(self.lex.get_strict_token())
    }

    /// Reduce a leaf token to a value token in place.
    fn resolve_leaf(&mut self, t: &mut Token) -> io::Result<()> {
        match t.kind {
            TokenKind::Integer | TokenKind::Str => Ok(()),

            TokenKind::Id => {
                let name = strip_sigil(&t.text).to_owned();
                let text = match self.syms.get_copy(&name) {
                    Ok(Some(v)) => match v.to_text() {
                        Ok(s) => s.to_owned(),
                        Err(e) => {
                            self.record(format!("{e} for '{}'", t.text), t);
                            String::new()
                        }
                    },
                    Ok(None) => String::new(),
                    Err(e) => {
                        self.record(e, t);
                        String::new()
                    }
                };
                // Symbol values enter expressions as strings, whatever they
                // look like; only literals and computed results are
                // integer-kind.
                set_result(t, text, TokenKind::Str);
                Ok(())
            }

            kind if kind.is_pseudo_func() => {
                let args = self.parse_paren_list()?;
                match self.call_pseudo(kind, &args) {
                    Ok(v) => {
                        let text = v.to_text().unwrap_or_default().to_owned();
                        *t = self.value_token(text, t);
                    }
                    Err(e) => {
                        self.record(e, t);
                        set_result(t, String::new(), TokenKind::Str);
                    }
                }
                Ok(())
            }

            TokenKind::UserMacro => {
                let call = t.clone();
                *t = self.call_in_expr(&call)?;
                Ok(())
            }

            TokenKind::Eof => {
                self.record("unexpected end of expression", t);
                set_result(t, String::new(), TokenKind::Str);
                Ok(())
            }

            _ => {
                self.record("unexpected token in expression", t);
                set_result(t, String::new(), TokenKind::Str);
                Ok(())
            }
        }
    }

    /// `@name(args)` in expression position: built-in, user macro, or native
    /// function.  Macro/native output is captured and becomes the value.
    fn call_in_expr(&mut self, tok: &Token) -> io::Result<Token> {
        let name = tok.text[1..].to_owned();

        if name == "eval" {
            let args = self.parse_paren_list()?;
            let rendered = self.eval_template_arg(&args, tok)?;
            return Ok(self.value_token(rendered, tok));
        }
        if crate::builtins::is_builtin(&name) {
            let args = self.parse_paren_list()?;
            return Ok(match crate::builtins::call_builtin(&name, &args) {
                Some(Ok(v)) => {
                    let text = v.to_text().unwrap_or_default().to_owned();
                    self.value_token(text, tok)
                }
                Some(Err(e)) => {
                    self.record(e, tok);
                    self.value_token(String::new(), tok)
                }
                None => {
                    self.record(format!("undefined macro or function '@{name}'"), tok);
                    self.value_token(String::new(), tok)
                }
            });
        }
        if self.macros.contains(&name) {
            let args = self.parse_paren_list()?;
            let captured = self.invoke_macro(tok, &args, true)?.unwrap_or_default();
            return Ok(self.value_token(captured, tok));
        }
        if self.funcs.contains(&name) {
            let args = self.parse_paren_list()?;
            let captured = self.call_native(tok, &args, true)?.unwrap_or_default();
            return Ok(self.value_token(captured, tok));
        }

        self.record(format!("undefined macro or function '@{name}'"), tok);
        self.skip_paren_group();
        Ok(self.value_token(String::new(), tok))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
