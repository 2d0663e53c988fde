//! tpt — a template-processing language engine.
//!
//! A Rust rewrite of the libtpt template language: a small interpreted
//! language with its own tokenizer, 8-level operator-precedence expression
//! grammar, control flow (`@if`/`@elsif`/`@else`, `@foreach`, `@while`),
//! user-defined macros with dynamic scoping, and a path-addressable symbol
//! table of nested scalars, arrays, and hashes.
//!
//! The engine records template defects in an ordered error list and keeps
//! rendering best-effort, so one pass over a template surfaces every
//! problem instead of stopping at the first.
//!
//! # Quick start
//!
//! ```rust
//! use tpt::Interpreter;
//!
//! let mut interp = Interpreter::new();
//! interp.symbols_mut().set("user.name", "Ada").unwrap();
//! interp.symbols_mut().set("count", "3").unwrap();
//!
//! let mut out = Vec::new();
//! let template = "Hello ${user.name}! @if($count > 1){You have ${count} items.}";
//! let had_errors = interp.run_str(template, &mut out).unwrap();
//!
//! assert!(!had_errors);
//! assert_eq!(out, b"Hello Ada! You have 3 items.");
//! ```
//!
//! Hosts embed the engine by pre-seeding [`Interpreter::symbols_mut`],
//! adding include-search directories, and registering native callbacks via
//! [`Interpreter::register_function`]; see the module docs of [`interp`]
//! for the full contract.

pub mod buffer;
pub mod builtins;
pub mod cli;
pub mod error;
pub mod expr;
pub mod funcs;
pub mod interp;
pub mod lex;
pub mod macros;
pub mod symbols;
pub mod value;

// Re-exports for convenience.
pub use buffer::Buffer;
pub use funcs::FunctionTable;
pub use interp::Interpreter;
pub use lex::{Lex, Token, TokenKind};
pub use macros::{Macro, MacroTable};
pub use symbols::Symbols;
pub use value::{TypeMismatch, Value};
