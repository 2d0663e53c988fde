//! Built-in template functions.
//!
//! Each function receives already-evaluated argument [`Value`]s and returns
//! `Result<Value, String>`.  The dispatcher is called from the interpreter
//! for `@name(…)` tokens before user macros and native functions are
//! consulted.  `@eval` and `@rand` need interpreter state (nested rendering,
//! the RNG) and are handled there; everything here is pure.
//!
//! The expression pseudo-functions (`@compare`, `@empty`, `@size`,
//! `@isarray`, `@ishash`, `@isscalar`) have their own token kinds and their
//! own entry points below.

use crate::lex::{num2str, str2num};
use crate::value::Value;

/// `true` when `name` is one of the named built-in functions dispatched by
/// [`call_builtin`] (plus `eval`, which the interpreter handles itself).
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "sum" | "avg"
            | "concat"
            | "eval"
            | "length"
            | "substr"
            | "uc"
            | "lc"
            | "lpad"
            | "rpad"
            | "repeat"
    )
}

/// Dispatch a named built-in function call.
///
/// Returns `None` if the name is not a built-in handled here (the caller
/// then tries user macros and the native function table).
pub fn call_builtin(name: &str, args: &[Value]) -> Option<Result<Value, String>> {
    // Inner function returns Result<Option<Value>, String>:
    //   Ok(None)    → not handled here
    //   Ok(Some(v)) → success
    //   Err(e)      → builtin call failed
    // `.transpose()` converts that to Option<Result<Value, String>>.
    fn inner(name: &str, args: &[Value]) -> Result<Option<Value>, String> {
        Ok(Some(match name {
            // ── Arithmetic over lists ────────────────────────────────────────
            "sum" => {
                let mut total: i64 = 0;
                for text in flatten_texts(args, name)? {
                    total = total.wrapping_add(str2num(text));
                }
                Value::scalar(num2str(total))
            }
            "avg" => {
                let texts = flatten_texts(args, name)?;
                if texts.is_empty() {
                    Value::scalar("0")
                } else {
                    let mut total: i64 = 0;
                    for text in &texts {
                        total = total.wrapping_add(str2num(text));
                    }
                    Value::scalar(num2str(total.wrapping_div(texts.len() as i64)))
                }
            }

            // ── String functions ─────────────────────────────────────────────
            "concat" => {
                let mut out = String::new();
                for text in flatten_texts(args, name)? {
                    out.push_str(text);
                }
                Value::scalar(out)
            }
            "length" => {
                let s = get_text(args, 0, name)?;
                Value::scalar(num2str(s.chars().count() as i64))
            }
            "substr" => {
                let s = get_text(args, 0, name)?;
                let pos = get_int(args, 1, name)?.max(0) as usize;
                let len = match args.get(2) {
                    Some(v) => Some(str2num(v.to_text().map_err(|e| arg_err(name, 2, e))?)),
                    None => None,
                };
                let chars: Vec<char> = s.chars().collect();
                let start = pos.min(chars.len());
                let end = match len {
                    Some(n) if n < 0 => start,
                    Some(n) => (start + n as usize).min(chars.len()),
                    None => chars.len(),
                };
                Value::scalar(chars[start..end].iter().collect::<String>())
            }
            "uc" => Value::scalar(get_text(args, 0, name)?.to_uppercase()),
            "lc" => Value::scalar(get_text(args, 0, name)?.to_lowercase()),
            "lpad" => {
                let (s, width, pad) = pad_args(args, name)?;
                let count = s.chars().count();
                if count >= width {
                    Value::scalar(s)
                } else {
                    let mut out = pad.to_string().repeat(width - count);
                    out.push_str(&s);
                    Value::scalar(out)
                }
            }
            "rpad" => {
                let (s, width, pad) = pad_args(args, name)?;
                let count = s.chars().count();
                let mut out = s;
                if count < width {
                    out.extend(std::iter::repeat(pad).take(width - count));
                }
                Value::scalar(out)
            }
            "repeat" => {
                let s = get_text(args, 0, name)?;
                let n = get_int(args, 1, name)?.max(0) as usize;
                Value::scalar(s.repeat(n))
            }

            _ => return Ok(None),
        }))
    }
    inner(name, args).transpose()
}

// ── Expression pseudo-functions ───────────────────────────────────────────────

/// `@compare(a,b)` — string comparison, −1 / 0 / 1.
pub fn compare(args: &[Value]) -> Result<Value, String> {
    let a = get_text(args, 0, "compare")?;
    let b = get_text(args, 1, "compare")?;
    let n = match a.cmp(b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    Ok(Value::scalar(num2str(n)))
}

/// `@empty(x)` — 1 for an empty scalar or empty container, else 0.
pub fn empty(args: &[Value]) -> Result<Value, String> {
    let v = args.first().cloned().unwrap_or_default();
    Ok(flag(v.is_empty()))
}

/// `@size(x)` — scalar → 1, array → element count, hash → 2 × entry count
/// (the historical key+value doubling rule).
pub fn size(args: &[Value]) -> Result<Value, String> {
    let n = match args.first() {
        None => 0,
        Some(Value::Scalar(_)) | Some(Value::Token(_)) => 1,
        Some(Value::Array(a)) => a.len() as i64,
        Some(Value::Hash(h)) => 2 * h.len() as i64,
    };
    Ok(Value::scalar(num2str(n)))
}

/// `@isarray(x)`
pub fn is_array(args: &[Value]) -> Result<Value, String> {
    Ok(flag(matches!(args.first(), Some(Value::Array(_)))))
}

/// `@ishash(x)`
pub fn is_hash(args: &[Value]) -> Result<Value, String> {
    Ok(flag(matches!(args.first(), Some(Value::Hash(_)))))
}

/// `@isscalar(x)`
pub fn is_scalar(args: &[Value]) -> Result<Value, String> {
    Ok(flag(matches!(
        args.first(),
        Some(Value::Scalar(_)) | Some(Value::Token(_)) | None
    )))
}

fn flag(b: bool) -> Value {
    Value::scalar(if b { "1" } else { "0" })
}

// ── Argument helpers ──────────────────────────────────────────────────────────

fn arg_err(name: &str, idx: usize, e: impl std::fmt::Display) -> String {
    format!("@{name}: argument {}: {e}", idx + 1)
}

fn get_text<'a>(args: &'a [Value], idx: usize, name: &str) -> Result<&'a str, String> {
    match args.get(idx) {
        Some(v) => v.to_text().map_err(|e| arg_err(name, idx, e)),
        None => Err(format!("@{name}: missing argument {}", idx + 1)),
    }
}

fn get_int(args: &[Value], idx: usize, name: &str) -> Result<i64, String> {
    get_text(args, idx, name).map(str2num)
}

/// Flatten scalar arguments and the elements of array arguments into one
/// list of texts.  Hashes are rejected.
fn flatten_texts<'a>(args: &'a [Value], name: &str) -> Result<Vec<&'a str>, String> {
    let mut out = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Value::Array(items) => {
                for item in items {
                    out.push(item.to_text().map_err(|e| arg_err(name, i, e))?);
                }
            }
            other => out.push(other.to_text().map_err(|e| arg_err(name, i, e))?),
        }
    }
    Ok(out)
}

fn pad_args(args: &[Value], name: &str) -> Result<(String, usize, char), String> {
    let s = get_text(args, 0, name)?.to_owned();
    let width = get_int(args, 1, name)?.max(0) as usize;
    let pad = match args.get(2) {
        Some(v) => v
            .to_text()
            .map_err(|e| arg_err(name, 2, e))?
            .chars()
            .next()
            .unwrap_or(' '),
        None => ' ',
    };
    Ok((s, width, pad))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
