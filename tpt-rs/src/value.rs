//! Runtime value type for template symbols and expression results.
//!
//! Every symbol slot and every evaluated expression is a [`Value`]: a scalar
//! string, an ordered array, an insertion-ordered hash, or a raw token that
//! has not yet been committed to the symbol table.  The engine is
//! dynamically typed at the template level, but variant access from Rust is
//! checked: asking an array for its scalar is a [`TypeMismatch`], which call
//! sites turn into a recorded template error.
//!
//! Containers always store owned copies.  Assigning a value into an array or
//! hash clones it; nothing in the symbol table aliases anything else.

use indexmap::IndexMap;
use thiserror::Error;

use crate::lex::Token;

/// Upper bound for explicit array indexes; writes past this are refused so a
/// stray `$a[999999999]` cannot balloon the heap.
pub const MAX_ARRAY_INDEX: usize = 65535;

/// Variant mismatch on a checked accessor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {found}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

/// A template runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    Array(Vec<Value>),
    Hash(IndexMap<String, Value>),
    /// A raw expression-result token awaiting coercion.
    Token(Token),
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(String::new())
    }
}

impl Value {
    /// Build a scalar value.
    pub fn scalar(s: impl Into<String>) -> Self {
        Value::Scalar(s.into())
    }

    /// Name of the active variant, as used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
            Value::Token(_) => "token",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Scalar(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_hash(&self) -> bool {
        matches!(self, Value::Hash(_))
    }

    fn mismatch(&self, expected: &'static str) -> TypeMismatch {
        TypeMismatch {
            expected,
            found: self.kind_name(),
        }
    }

    /// The scalar string; fails on any other variant.
    pub fn as_scalar(&self) -> Result<&str, TypeMismatch> {
        match self {
            Value::Scalar(s) => Ok(s),
            other => Err(other.mismatch("scalar")),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], TypeMismatch> {
        match self {
            Value::Array(v) => Ok(v),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Value>, TypeMismatch> {
        match self {
            Value::Array(v) => Ok(v),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_hash(&self) -> Result<&IndexMap<String, Value>, TypeMismatch> {
        match self {
            Value::Hash(h) => Ok(h),
            other => Err(other.mismatch("hash")),
        }
    }

    pub fn as_hash_mut(&mut self) -> Result<&mut IndexMap<String, Value>, TypeMismatch> {
        match self {
            Value::Hash(h) => Ok(h),
            other => Err(other.mismatch("hash")),
        }
    }

    pub fn as_token(&self) -> Result<&Token, TypeMismatch> {
        match self {
            Value::Token(t) => Ok(t),
            other => Err(other.mismatch("token")),
        }
    }

    /// Scalar text of a scalar or token value; containers fail.  This is the
    /// read most of the interpreter wants: token results behave like the
    /// scalar they will become on insert.
    pub fn to_text(&self) -> Result<&str, TypeMismatch> {
        match self {
            Value::Scalar(s) => Ok(s),
            Value::Token(t) => Ok(&t.text),
            other => Err(other.mismatch("scalar")),
        }
    }

    /// Coerce into the form stored in the symbol table: tokens collapse to
    /// scalars, containers pass through.
    pub fn into_stored(self) -> Value {
        match self {
            Value::Token(t) => Value::Scalar(t.text),
            other => other,
        }
    }

    /// `true` for an empty scalar, empty array, or empty hash.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(s) => s.is_empty(),
            Value::Array(v) => v.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Token(t) => t.text.is_empty(),
        }
    }
}

/// A token coerces to a scalar carrying its text.
impl From<Token> for Value {
    fn from(t: Token) -> Self {
        Value::Scalar(t.text)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(s.to_owned())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
