//! Property tests: the lexer must never panic and must account for every
//! input character in loose mode; the expression evaluator must agree with
//! a model interpreter on randomly generated arithmetic.

use proptest::prelude::*;

use tpt::lex::{num2str, str2num, Lex, TokenKind};
use tpt::Interpreter;

// ── Expression model ──────────────────────────────────────────────────────────

/// A randomly generated arithmetic expression together with the value the
/// engine must produce for it (wrapping 64-bit, `/`/`%` never by zero).
#[derive(Debug, Clone)]
struct Arith {
    src: String,
    expected: i64,
}

fn arith_leaf() -> impl Strategy<Value = Arith> {
    (0i64..=9999).prop_map(|n| Arith {
        src: num2str(n),
        expected: n,
    })
}

fn arith_tree() -> impl Strategy<Value = Arith> {
    arith_leaf().prop_recursive(4, 32, 2, |inner| {
        (inner.clone(), inner, 0usize..5).prop_map(|(a, b, op)| match op {
            0 => Arith {
                src: format!("{} + {}", a.src, b.src),
                expected: a.expected.wrapping_add(b.expected),
            },
            1 => Arith {
                src: format!("({}) - ({})", a.src, b.src),
                expected: a.expected.wrapping_sub(b.expected),
            },
            2 => Arith {
                src: format!("({}) * ({})", a.src, b.src),
                expected: a.expected.wrapping_mul(b.expected),
            },
            3 => {
                // Divisor is a positive literal derived from b.
                let divisor = b.expected.rem_euclid(99) + 1;
                Arith {
                    src: format!("({}) / {divisor}", a.src),
                    expected: a.expected.wrapping_div(divisor),
                }
            }
            _ => Arith {
                src: format!("-({})", a.src),
                expected: a.expected.wrapping_neg(),
            },
        })
    })
}

proptest! {
    /// Engine arithmetic matches the model for every generated expression.
    #[test]
    fn arithmetic_matches_model(expr in arith_tree()) {
        let mut interp = Interpreter::new();
        let mut out = Vec::new();
        let src = format!("@set(r)({})${{r}}", expr.src);
        interp.run_str(&src, &mut out).expect("sink io");
        prop_assert_eq!(interp.errors(), &[] as &[String]);
        let rendered = String::from_utf8(out).expect("utf8");
        prop_assert_eq!(rendered, num2str(expr.expected));
    }
}

proptest! {
    /// The lexer terminates and never panics on arbitrary input.
    #[test]
    fn lexer_does_not_panic(s in "\\PC{0,200}") {
        let mut lex = Lex::from_str(&s);
        for _ in 0..1000 {
            if lex.get_loose_token().kind == TokenKind::Eof {
                break;
            }
        }
    }
}

proptest! {
    /// Over an alphabet with no escapes, comments, or references, loose
    /// tokens reconstruct their input exactly.
    #[test]
    fn loose_tokens_reconstruct_plain_input(
        s in "[a-zA-Z0-9 \t\n(){},.+*/%<>=-]{0,200}"
    ) {
        let mut lex = Lex::from_str(&s);
        let mut rebuilt = String::new();
        loop {
            let t = lex.get_loose_token();
            if t.kind == TokenKind::Eof {
                break;
            }
            rebuilt.push_str(&t.text);
        }
        prop_assert_eq!(rebuilt, s);
    }
}

proptest! {
    /// Rendering arbitrary input never panics and I/O never fails on a
    /// memory sink (errors are recorded, not thrown).
    #[test]
    fn render_does_not_panic(s in "\\PC{0,120}") {
        let mut interp = Interpreter::new();
        let mut out = Vec::new();
        let _ = interp.run_str(&s, &mut out).expect("sink io");
    }
}

proptest! {
    /// num2str → str2num is the identity for every i64.
    #[test]
    fn numeric_roundtrip(n in any::<i64>()) {
        prop_assert_eq!(str2num(&num2str(n)), n);
    }
}
