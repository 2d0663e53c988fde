//! Lexical analyzer for the template language.
//!
//! The lexer runs over a [`Buffer`] and hands out tokens in two modes:
//!
//! - **loose** ([`Lex::get_loose_token`]): every byte of the template is
//!   accounted for — raw text, whitespace and comments come back as tokens so
//!   the interpreter can copy them to the output verbatim.
//! - **strict** ([`Lex::get_strict_token`]): whitespace and comments are
//!   skipped; used inside expressions and statement headers.
//!
//! Tokens carry their starting line/column for error reporting.  The lexer
//! also provides token-aware block extraction ([`Lex::get_block`] /
//! [`Lex::ignore_block`]) with brace-depth counting that is immune to braces
//! inside string literals and comments, plus `index`/`seek` bookmarks used to
//! re-run loop bodies from source.

use crate::buffer::Buffer;

// ── Token ─────────────────────────────────────────────────────────────────────

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    /// Lexically malformed input (bad string, stray `|`/`&`/`^`, …).
    Error,
    /// Raw template text.
    Text,
    /// Spaces/tabs, possibly followed by line ends.
    Whitespace,
    /// `@# …` comment (also `#!` on line one and mode directives).
    Comment,
    /// `\x` — carries the escaped character.
    Escape,
    /// Backslash-newline continuation; renders as nothing.
    JoinLine,
    OpenBrace,
    CloseBrace,
    OpenParen,
    CloseParen,
    Comma,
    /// `+ - * / % || && ^^ !`
    Operator,
    /// `== != < > <= >= =`
    RelOp,
    Integer,
    Str,
    /// Variable reference / path: `$name`, `${path}`, or a bare identifier
    /// in expression context.
    Id,
    /// `@name` where `name` is not reserved — user macro or native function.
    UserMacro,

    // Statement keywords.
    If,
    Elsif,
    Else,
    Foreach,
    While,
    Macro,
    Set,
    SetIf,
    Unset,
    Push,
    Pop,
    Keys,
    Include,
    IncludeText,
    Next,
    Last,
    Using,

    // Expression pseudo-functions.
    Compare,
    Empty,
    Size,
    Rand,
    IsArray,
    IsHash,
    IsScalar,
}

impl TokenKind {
    /// Stable lowercase name used in recorded error messages.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Eof => "eof",
            TokenKind::Error => "error",
            TokenKind::Text => "text",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Escape => "escape",
            TokenKind::JoinLine => "joinline",
            TokenKind::OpenBrace => "openbrace",
            TokenKind::CloseBrace => "closebrace",
            TokenKind::OpenParen => "openparen",
            TokenKind::CloseParen => "closeparen",
            TokenKind::Comma => "comma",
            TokenKind::Operator => "operator",
            TokenKind::RelOp => "relop",
            TokenKind::Integer => "integer",
            TokenKind::Str => "string",
            TokenKind::Id => "id",
            TokenKind::UserMacro => "usermacro",
            TokenKind::If => "if",
            TokenKind::Elsif => "elsif",
            TokenKind::Else => "else",
            TokenKind::Foreach => "foreach",
            TokenKind::While => "while",
            TokenKind::Macro => "macro",
            TokenKind::Set => "set",
            TokenKind::SetIf => "setif",
            TokenKind::Unset => "unset",
            TokenKind::Push => "push",
            TokenKind::Pop => "pop",
            TokenKind::Keys => "keys",
            TokenKind::Include => "include",
            TokenKind::IncludeText => "includetext",
            TokenKind::Next => "next",
            TokenKind::Last => "last",
            TokenKind::Using => "using",
            TokenKind::Compare => "compare",
            TokenKind::Empty => "empty",
            TokenKind::Size => "size",
            TokenKind::Rand => "rand",
            TokenKind::IsArray => "isarray",
            TokenKind::IsHash => "ishash",
            TokenKind::IsScalar => "isscalar",
        }
    }

    /// `true` for the expression pseudo-function kinds.
    pub fn is_pseudo_func(self) -> bool {
        matches!(
            self,
            TokenKind::Compare
                | TokenKind::Empty
                | TokenKind::Size
                | TokenKind::Rand
                | TokenKind::IsArray
                | TokenKind::IsHash
                | TokenKind::IsScalar
        )
    }
}

/// A lexical token.  Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
}

impl Token {
    fn new(kind: TokenKind, line: u32, column: u32) -> Self {
        Token {
            kind,
            text: String::new(),
            line,
            column,
        }
    }
}

// ── Numeric helpers ───────────────────────────────────────────────────────────

/// Parse a base-10 signed 64-bit integer the way the engine always has:
/// optional leading whitespace and sign, digits until the first non-digit,
/// wrapping accumulation, no overflow detection, anything unparsable is 0.
pub fn str2num(s: &str) -> i64 {
    let mut chars = s.chars().peekable();
    while matches!(chars.peek(), Some(c) if c.is_ascii_whitespace()) {
        chars.next();
    }
    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };
    let mut n: i64 = 0;
    while let Some(&c) = chars.peek() {
        let Some(d) = c.to_digit(10) else { break };
        chars.next();
        n = n.wrapping_mul(10).wrapping_add(d as i64);
    }
    if negative {
        n.wrapping_neg()
    } else {
        n
    }
}

/// Format a 64-bit integer as decimal text.
pub fn num2str(n: i64) -> String {
    n.to_string()
}

// ── Lex ───────────────────────────────────────────────────────────────────────

/// Extracted `{…}` block: verbatim text (braces included) and the line the
/// block body starts on.
#[derive(Debug, Clone)]
pub struct Block {
    pub text: String,
    pub line: u32,
}

/// Tokenizer over a [`Buffer`].
pub struct Lex {
    buf: Buffer,
    line: u32,
    column: u32,
    ignore_indent: bool,
    ignore_blankline: bool,
    last_start: usize,
}

impl Lex {
    pub fn new(buf: Buffer) -> Self {
        Lex {
            buf,
            line: 1,
            column: 1,
            ignore_indent: false,
            ignore_blankline: false,
            last_start: 0,
        }
    }

    /// Convenience constructor over an in-memory string.
    pub fn from_str(src: &str) -> Self {
        Self::new(Buffer::from_str(src))
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Override the current line counter (used when re-parsing a stored
    /// macro body at its original location).
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    /// Current buffer offset.
    pub fn index(&self) -> usize {
        self.buf.offset()
    }

    /// Seek to an absolute offset.
    pub fn seek(&mut self, index: usize) -> bool {
        self.buf.seek(index)
    }

    /// Put the most recent token back by rewinding the buffer to its start.
    /// The token is re-lexed by the next read — in whichever mode the reader
    /// then uses, so a strict look-ahead can be re-read loosely.
    pub fn unget(&mut self, token: Token) {
        self.buf.seek(self.last_start);
        self.line = token.line;
        self.column = token.column;
    }

    // ── Character-level primitives ────────────────────────────────────────────

    fn safeget(&mut self) -> Option<char> {
        let c = self.buf.get();
        if c.is_some() {
            self.column += 1;
        }
        c
    }

    fn safeunget(&mut self) {
        self.buf.unget();
        self.column = self.column.saturating_sub(1);
    }

    fn newline(&mut self) {
        self.column = 1;
        self.line += 1;
    }

    /// Consume a line end starting at `c`, appending it to `out`.  Handles
    /// `\n`, `\r`, and `\r\n`.  Returns `true` if `c` started a line end.
    fn get_return(&mut self, c: char, out: &mut String) -> bool {
        if c == '\n' {
            out.push(c);
            true
        } else if c == '\r' {
            out.push(c);
            match self.safeget() {
                Some('\n') => out.push('\n'),
                Some(_) => self.safeunget(),
                None => {}
            }
            true
        } else {
            false
        }
    }

    // ── Token readers ─────────────────────────────────────────────────────────

    /// Next token, preserving literal text, whitespace and comments.
    pub fn get_loose_token(&mut self) -> Token {
        self.last_start = self.buf.offset();

        let Some(c) = self.safeget() else {
            return Token::new(TokenKind::Eof, self.line, self.column);
        };

        // #! on the first line is swallowed as a comment.
        if self.line == 1 && self.column == 2 && c == '#' {
            if let Some(t) = self.try_shebang() {
                return t;
            }
        }

        match c {
            // The special-token reader owns these; avoid duplicate logic.
            ' ' | '\t' | '\n' | '\r' | '\\' | '@' | '$' | '{' | '}' => {
                self.safeunget();
                self.get_special_token()
            }
            _ => {
                let mut t = Token::new(TokenKind::Text, self.line, self.column - 1);
                t.text.push(c);
                self.build_raw_text(&mut t.text);
                t
            }
        }
    }

    /// Next token, skipping whitespace and comments.
    pub fn get_strict_token(&mut self) -> Token {
        loop {
            let t = self.get_special_token();
            if !matches!(t.kind, TokenKind::Whitespace | TokenKind::Comment) {
                return t;
            }
        }
    }

    /// Shared reader for all non-raw-text tokens.
    fn get_special_token(&mut self) -> Token {
        self.last_start = self.buf.offset();

        let col = self.column;
        let start_line = self.line;
        let mut t = Token::new(TokenKind::Error, start_line, col);

        let Some(c) = self.safeget() else {
            t.kind = TokenKind::Eof;
            return t;
        };

        // #! on the first line.
        if self.line == 1 && col == 1 && c == '#' {
            if let Some(t) = self.try_shebang() {
                return t;
            }
        }

        t.text.push(c);

        match c {
            '{' => {
                t.kind = TokenKind::OpenBrace;
                self.handle_brace_ignore(&mut t);
            }
            '}' => {
                t.kind = TokenKind::CloseBrace;
                self.handle_brace_ignore(&mut t);
            }
            '(' => t.kind = TokenKind::OpenParen,
            ')' => t.kind = TokenKind::CloseParen,
            ',' => t.kind = TokenKind::Comma,
            '+' | '-' | '*' | '/' | '%' => t.kind = TokenKind::Operator,
            '|' | '&' | '^' => {
                // Only the doubled forms ||, &&, ^^ exist; a single one is a
                // lexical error token.
                match self.safeget() {
                    Some(c2) if c2 == c => {
                        t.kind = TokenKind::Operator;
                        t.text.push(c2);
                    }
                    Some(_) => self.safeunget(),
                    None => {}
                }
            }
            ' ' | '\t' => self.read_whitespace_run(&mut t, col),
            '\n' | '\r' => {
                t.kind = TokenKind::Whitespace;
                t.text.clear();
                self.get_return_into(c, &mut t.text);
                self.newline();
                if self.ignore_blankline && col == 1 {
                    t.text.clear();
                }
            }
            '"' => self.get_string(&mut t, '"'),
            '\'' => self.get_string(&mut t, '\''),
            '\\' => {
                t.text.clear();
                match self.safeget() {
                    Some(c2) => {
                        if self.get_return(c2, &mut t.text) {
                            self.newline();
                            t.kind = TokenKind::JoinLine;
                        } else {
                            t.kind = TokenKind::Escape;
                            t.text.clear();
                            t.text.push(c2);
                        }
                    }
                    None => t.kind = TokenKind::Escape,
                }
            }
            '@' => self.read_at(&mut t),
            '$' => self.get_closed_id_name(&mut t),
            '!' => match self.safeget() {
                Some('=') => {
                    t.kind = TokenKind::RelOp;
                    t.text.push('=');
                }
                Some(_) => {
                    t.kind = TokenKind::Operator;
                    self.safeunget();
                }
                None => t.kind = TokenKind::Operator,
            },
            '>' | '<' | '=' => {
                t.kind = TokenKind::RelOp;
                match self.safeget() {
                    Some('=') => t.text.push('='),
                    Some(_) => self.safeunget(),
                    None => {}
                }
            }
            _ => {}
        }

        // Tokens built from character sets: numbers and identifiers.
        if t.kind == TokenKind::Error {
            if c.is_ascii_digit() {
                t.kind = TokenKind::Integer;
                self.build_number(&mut t.text);
            } else if c.is_alphanumeric() || c == '_' || c == '.' {
                self.get_id_name(&mut t);
            }
        }

        t
    }

    /// Consume the rest of a `#!` line.  Returns `None` when the next
    /// character is not `!` (the `#` is then left for normal processing).
    fn try_shebang(&mut self) -> Option<Token> {
        match self.safeget() {
            Some('!') => {
                let mut t = Token::new(TokenKind::Comment, self.line, self.column);
                let mut junk = String::new();
                while let Some(c) = self.safeget() {
                    if self.get_return(c, &mut junk) {
                        self.newline();
                        break;
                    }
                }
                t.text.clear();
                Some(t)
            }
            Some(_) => {
                self.safeunget();
                None
            }
            None => None,
        }
    }

    /// Whitespace-run reader for tokens starting with space or tab.
    fn read_whitespace_run(&mut self, t: &mut Token, col: u32) {
        t.kind = TokenKind::Whitespace;
        loop {
            match self.safeget() {
                Some(c) if c == ' ' || c == '\t' => t.text.push(c),
                Some(c) if c == '\n' || c == '\r' => {
                    self.get_return_into(c, &mut t.text);
                    self.newline();
                }
                Some('@') => {
                    // A comment or truncation directive cancels the run.
                    match self.safeget() {
                        Some('#') => {
                            self.safeunget();
                            self.safeunget();
                            *t = self.get_special_token();
                            return;
                        }
                        Some('<') => {
                            t.text.clear();
                            return;
                        }
                        Some(_) => {
                            self.safeunget();
                            self.safeunget();
                        }
                        None => self.safeunget(),
                    }
                    break;
                }
                Some(_) => {
                    self.safeunget();
                    break;
                }
                None => break,
            }
        }
        if self.ignore_indent && col == 1 {
            t.text.clear();
        }
    }

    fn get_return_into(&mut self, c: char, out: &mut String) {
        let _ = self.get_return(c, out);
    }

    /// `@…` — keyword, pseudo-function, user macro, comment or truncation.
    fn read_at(&mut self, t: &mut Token) {
        match self.safeget() {
            Some(c) if c.is_alphabetic() || c == '_' || c == '.' => {
                t.text.push(c);
                self.build_identifier(&mut t.text);
                t.kind = self.check_reserved(&t.text[1..]);
            }
            Some('#') => self.build_comment(t),
            Some('<') => {
                // Swallow point: renders as nothing.
                t.kind = TokenKind::Whitespace;
                t.text.clear();
            }
            Some('>') => {
                // Truncate whitespace to the right.
                t.kind = TokenKind::Whitespace;
                t.text.clear();
                let mut junk = String::new();
                while let Some(c) = self.safeget() {
                    if c == ' ' || c == '\t' {
                        continue;
                    }
                    if self.get_return(c, &mut junk) {
                        self.newline();
                        junk.clear();
                        continue;
                    }
                    self.safeunget();
                    break;
                }
            }
            Some(_) => {
                self.safeunget();
                t.kind = TokenKind::Text;
            }
            None => t.kind = TokenKind::Text,
        }
    }

    /// Reserved-word lookup for `@name` tokens (`name` excludes the `@`).
    ///
    /// The `ignore…` directives flip lexer modes as a side effect and come
    /// back as comments.
    fn check_reserved(&mut self, name: &str) -> TokenKind {
        match name {
            "if" => TokenKind::If,
            "elsif" => TokenKind::Elsif,
            "else" => TokenKind::Else,
            "foreach" => TokenKind::Foreach,
            "while" => TokenKind::While,
            "macro" => TokenKind::Macro,
            "set" => TokenKind::Set,
            "setif" => TokenKind::SetIf,
            "unset" => TokenKind::Unset,
            "push" => TokenKind::Push,
            "pop" => TokenKind::Pop,
            "keys" => TokenKind::Keys,
            "include" => TokenKind::Include,
            "includetext" => TokenKind::IncludeText,
            "next" => TokenKind::Next,
            "last" => TokenKind::Last,
            "using" => TokenKind::Using,
            "compare" | "comp" | "strcmp" => TokenKind::Compare,
            "empty" => TokenKind::Empty,
            "size" => TokenKind::Size,
            "rand" => TokenKind::Rand,
            "isarray" => TokenKind::IsArray,
            "ishash" => TokenKind::IsHash,
            "isscalar" => TokenKind::IsScalar,
            "ignoreindent" | "tpt_ignoreindent" => {
                self.ignore_indent = true;
                TokenKind::Comment
            }
            "noignoreindent" | "tpt_noignoreindent" => {
                self.ignore_indent = false;
                TokenKind::Comment
            }
            "ignoreblankline" | "tpt_ignoreblankline" => {
                self.ignore_blankline = true;
                TokenKind::Comment
            }
            "noignoreblankline" | "tpt_noignoreblankline" => {
                self.ignore_blankline = false;
                TokenKind::Comment
            }
            _ => TokenKind::UserMacro,
        }
    }

    /// `$…` variable reference.  `${path}` takes the closed form with full
    /// path syntax; a bare `$name` is limited to simple identifier
    /// characters; anything else means the `$` was plain text.
    fn get_closed_id_name(&mut self, t: &mut Token) {
        match self.safeget() {
            Some('{') => {
                t.text.push('{');
                self.get_id_name(t);
                if t.kind != TokenKind::Id {
                    t.kind = TokenKind::Error;
                    return;
                }
                match self.safeget() {
                    Some('}') => {
                        t.text.push('}');
                        t.kind = TokenKind::Id;
                    }
                    Some(_) => {
                        self.safeunget();
                        t.kind = TokenKind::Error;
                    }
                    None => t.kind = TokenKind::Error,
                }
            }
            Some(c) if c.is_alphanumeric() || c == '_' => {
                t.kind = TokenKind::Id;
                t.text.push(c);
                while let Some(c) = self.safeget() {
                    if c.is_alphanumeric() || c == '_' {
                        t.text.push(c);
                    } else {
                        self.safeunget();
                        break;
                    }
                }
            }
            Some(_) => {
                self.safeunget();
                t.kind = TokenKind::Text;
            }
            None => t.kind = TokenKind::Text,
        }
    }

    /// Identifier/path reader; the first character is already in `t.text`.
    /// Handles nested `$name`/`${…}` indirection and `[…]` index spans.
    fn get_id_name(&mut self, t: &mut Token) {
        t.kind = TokenKind::Id;
        while t.kind != TokenKind::Error {
            let Some(c) = self.safeget() else { break };
            if c == '$' {
                t.text.push(c);
                self.get_closed_id_name(t);
                if t.kind != TokenKind::Id {
                    t.kind = TokenKind::Error;
                    return;
                }
            } else if c == '[' {
                t.text.push(c);
                self.get_bracket_expr(t);
                match self.safeget() {
                    Some(']') => t.text.push(']'),
                    Some(_) => {
                        self.safeunget();
                        t.kind = TokenKind::Error;
                    }
                    None => t.kind = TokenKind::Error,
                }
            } else if !c.is_alphanumeric() && c != '_' && c != '.' {
                self.safeunget();
                break;
            } else {
                t.text.push(c);
            }
        }
    }

    /// Capture a bracketed index expression verbatim (terminating `]` is
    /// left in the stream for the caller).
    fn get_bracket_expr(&mut self, t: &mut Token) {
        while t.kind != TokenKind::Error {
            let Some(c) = self.safeget() else {
                t.kind = TokenKind::Error;
                return;
            };
            if c == ']' {
                self.safeunget();
                return;
            }
            if c == '$' {
                t.text.push(c);
                self.get_closed_id_name(t);
                if t.kind != TokenKind::Id {
                    t.kind = TokenKind::Error;
                    return;
                }
            } else if c.is_alphabetic() || c == '_' || c == '.' {
                self.safeunget();
                self.get_id_name(t);
            } else {
                t.text.push(c);
            }
        }
    }

    /// Quoted string; the opening quote is consumed.  Escapes `\n \r \t \a`
    /// decode; other escaped characters pass through literally.  A raw line
    /// end inside the string is a lexical error.
    fn get_string(&mut self, t: &mut Token, quote: char) {
        t.kind = TokenKind::Str;
        t.text.clear();
        loop {
            let Some(c) = self.safeget() else {
                t.kind = TokenKind::Error;
                return;
            };
            if c == quote {
                return;
            }
            if c == '\\' {
                let Some(e) = self.safeget() else {
                    t.kind = TokenKind::Error;
                    return;
                };
                t.text.push(match e {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'a' => '\x07',
                    other => other,
                });
            } else if c == '\n' || c == '\r' {
                self.safeunget();
                t.kind = TokenKind::Error;
                return;
            } else {
                t.text.push(c);
            }
        }
    }

    fn build_identifier(&mut self, out: &mut String) {
        while let Some(c) = self.safeget() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                out.push(c);
            } else {
                self.safeunget();
                break;
            }
        }
    }

    fn build_number(&mut self, out: &mut String) {
        while let Some(c) = self.safeget() {
            if c.is_ascii_digit() {
                out.push(c);
            } else {
                self.safeunget();
                break;
            }
        }
    }

    /// Raw text run: everything up to the next character the special reader
    /// cares about.
    fn build_raw_text(&mut self, out: &mut String) {
        while let Some(c) = self.safeget() {
            match c {
                '$' | '@' | '\\' | '{' | '}' | '\r' | '\n' | ' ' | '\t' => {
                    self.safeunget();
                    return;
                }
                _ => out.push(c),
            }
        }
    }

    /// `@#` comment: runs to end of line.  A comment starting at column 1
    /// swallows its newline as well.
    fn build_comment(&mut self, t: &mut Token) {
        t.kind = TokenKind::Comment;
        t.text.push('#');
        while let Some(c) = self.safeget() {
            if c == '\\' {
                // An escaped line end belongs to the join-line handling.
                match self.safeget() {
                    Some('\r') | Some('\n') => {
                        self.safeunget();
                        self.safeunget();
                        return;
                    }
                    Some(_) => self.safeunget(),
                    None => {}
                }
                t.text.push(c);
            } else if c == '\r' || c == '\n' {
                if t.column == 1 {
                    self.get_return_into(c, &mut t.text);
                    self.newline();
                } else {
                    self.safeunget();
                }
                return;
            } else {
                t.text.push(c);
            }
        }
    }

    /// Eat whitespace (and an optional trailing comment) directly following
    /// a brace token, folding it into the token text.
    fn handle_brace_ignore(&mut self, t: &mut Token) {
        self.get_whitespace(&mut t.text);
        let last = t.text.chars().last().unwrap_or('{');
        if last == '\r' || last == '\n' {
            return;
        }
        match self.safeget() {
            Some('@') => match self.safeget() {
                Some('#') => {
                    t.text.push_str("@#");
                    let mut comment = Token::new(TokenKind::Comment, self.line, self.column);
                    self.build_comment(&mut comment);
                    t.text.push_str(&comment.text[1..]);
                    match self.safeget() {
                        Some(c) => {
                            let mut cr = String::new();
                            if self.get_return(c, &mut cr) {
                                t.text.push_str(&cr);
                                self.newline();
                            } else {
                                self.safeunget();
                            }
                        }
                        None => {}
                    }
                }
                Some(_) => {
                    self.safeunget();
                    self.safeunget();
                }
                None => self.safeunget(),
            },
            Some(_) => self.safeunget(),
            None => {}
        }
    }

    /// Space/tab run plus at most one line end.
    fn get_whitespace(&mut self, out: &mut String) {
        let Some(mut c) = self.safeget() else { return };
        while c == ' ' || c == '\t' {
            out.push(c);
            match self.safeget() {
                Some(next) => c = next,
                None => return,
            }
        }
        if self.get_return(c, out) {
            self.newline();
        } else {
            self.safeunget();
        }
    }

    // ── Block extraction ──────────────────────────────────────────────────────

    /// Copy the next brace-enclosed `{…}` block verbatim (leading whitespace
    /// before the `{` is discarded).  Depth counting is token-level, so
    /// braces inside string literals and comments do not corrupt nesting.
    pub fn get_block(&mut self) -> Result<Block, String> {
        let mut t = self.get_loose_token();
        while t.kind == TokenKind::Whitespace {
            t = self.get_loose_token();
        }
        if t.kind != TokenKind::OpenBrace {
            let line = t.line;
            self.unget(t);
            return Err(format!("expected '{{' at line {line}"));
        }

        let line = self.line;
        let mut block = t.text.clone();
        let mut depth = 1u32;
        let mut strings = StringTracker::default();
        loop {
            let t = self.get_loose_token();
            match t.kind {
                TokenKind::Eof => {
                    return Err("unexpected end of template in block".to_owned())
                }
                TokenKind::Escape | TokenKind::JoinLine => block.push('\\'),
                TokenKind::OpenBrace if !strings.inside() => depth += 1,
                TokenKind::CloseBrace if !strings.inside() => depth -= 1,
                _ => strings.observe(&t),
            }
            block.push_str(&t.text);
            if depth == 0 {
                return Ok(Block { text: block, line });
            }
        }
    }

    /// Skip the next brace-enclosed `{…}` block without keeping it.
    pub fn ignore_block(&mut self) -> Result<(), String> {
        let mut t = self.get_loose_token();
        while t.kind == TokenKind::Whitespace {
            t = self.get_loose_token();
        }
        if t.kind != TokenKind::OpenBrace {
            let line = t.line;
            self.unget(t);
            return Err(format!("expected '{{' at line {line}"));
        }

        self.consume_block_rest(1)
    }

    /// Finish skipping an already-open block: consume tokens until `depth`
    /// close braces have matched, with the same string/comment awareness as
    /// [`Lex::get_block`].
    pub fn consume_block_rest(&mut self, depth: u32) -> Result<(), String> {
        let mut depth = depth;
        let mut strings = StringTracker::default();
        loop {
            let t = self.get_loose_token();
            match t.kind {
                TokenKind::Eof => {
                    return Err("unexpected end of template in block".to_owned())
                }
                TokenKind::OpenBrace if !strings.inside() => depth += 1,
                TokenKind::CloseBrace if !strings.inside() => depth -= 1,
                _ => strings.observe(&t),
            }
            if depth == 0 {
                return Ok(());
            }
        }
    }
}

/// Tracks whether loose-token scanning is currently inside a quoted string,
/// so block extraction does not count braces that are string content.
#[derive(Default)]
struct StringTracker {
    in_dq: bool,
    in_sq: bool,
}

impl StringTracker {
    fn inside(&self) -> bool {
        self.in_dq || self.in_sq
    }

    fn observe(&mut self, t: &Token) {
        match t.kind {
            TokenKind::Text => {
                for c in t.text.chars() {
                    if c == '"' && !self.in_sq {
                        self.in_dq = !self.in_dq;
                    } else if c == '\'' && !self.in_dq {
                        self.in_sq = !self.in_sq;
                    }
                }
            }
            // A string never spans a line end.
            TokenKind::Whitespace if t.text.contains(['\n', '\r']) => {
                self.in_dq = false;
                self.in_sq = false;
            }
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn loose_kinds(src: &str) -> Vec<TokenKind> {
        let mut lex = Lex::from_str(src);
        let mut kinds = Vec::new();
        loop {
            let t = lex.get_loose_token();
            let done = t.kind == TokenKind::Eof;
            kinds.push(t.kind);
            if done {
                break;
            }
        }
        kinds
    }

    fn strict(src: &str) -> Vec<Token> {
        let mut lex = Lex::from_str(src);
        let mut out = Vec::new();
        loop {
            let t = lex.get_strict_token();
            if t.kind == TokenKind::Eof {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn plain_text() {
        let mut lex = Lex::from_str("hello");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "hello");
        assert_eq!(lex.get_loose_token().kind, TokenKind::Eof);
    }

    #[test]
    fn text_splits_at_whitespace() {
        assert_eq!(
            loose_kinds("one two"),
            vec![
                TokenKind::Text,
                TokenKind::Whitespace,
                TokenKind::Text,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn keywords_and_usermacro() {
        let toks = strict("@if @elsif @else @foreach @while @mymacro");
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::If,
                TokenKind::Elsif,
                TokenKind::Else,
                TokenKind::Foreach,
                TokenKind::While,
                TokenKind::UserMacro
            ]
        );
        assert_eq!(toks[5].text, "@mymacro");
    }

    #[test]
    fn compare_aliases() {
        let toks = strict("@compare @comp @strcmp");
        assert!(toks.iter().all(|t| t.kind == TokenKind::Compare));
    }

    #[test]
    fn closed_and_bare_variable() {
        let toks = strict("${abc.def[1]} $xyz");
        assert_eq!(toks[0].kind, TokenKind::Id);
        assert_eq!(toks[0].text, "${abc.def[1]}");
        assert_eq!(toks[1].kind, TokenKind::Id);
        assert_eq!(toks[1].text, "$xyz");
    }

    #[test]
    fn bare_variable_stops_at_path_chars() {
        let mut lex = Lex::from_str("$abc.def");
        let t = lex.get_strict_token();
        assert_eq!(t.kind, TokenKind::Id);
        assert_eq!(t.text, "$abc");
        let t = lex.get_strict_token();
        assert_eq!(t.kind, TokenKind::Id);
        assert_eq!(t.text, ".def");
    }

    #[test]
    fn dollar_without_name_is_text() {
        let mut lex = Lex::from_str("$ ");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Text);
        assert_eq!(t.text, "$");
    }

    #[test]
    fn nested_indirection_in_closed_id() {
        let toks = strict("${a$i}");
        assert_eq!(toks[0].kind, TokenKind::Id);
        assert_eq!(toks[0].text, "${a$i}");
    }

    #[test]
    fn operators_and_relops() {
        let toks = strict("+ - * / % || && ^^ == != < > <= >= = !");
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::RelOp,
                TokenKind::Operator,
            ]
        );
    }

    #[test]
    fn single_pipe_is_error() {
        let toks = strict("|");
        assert_eq!(toks[0].kind, TokenKind::Error);
    }

    #[test]
    fn integer_literal() {
        let toks = strict("12345");
        assert_eq!(toks[0].kind, TokenKind::Integer);
        assert_eq!(toks[0].text, "12345");
    }

    #[test]
    fn string_literals_and_escapes() {
        let toks = strict(r#""hi\tthere" 'single'"#);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].text, "hi\tthere");
        assert_eq!(toks[1].kind, TokenKind::Str);
        assert_eq!(toks[1].text, "single");
    }

    #[test]
    fn unterminated_string_is_error() {
        let toks = strict("\"oops\nmore");
        assert_eq!(toks[0].kind, TokenKind::Error);
    }

    #[test]
    fn comment_runs_to_eol() {
        let mut lex = Lex::from_str("a@# comment\nb");
        assert_eq!(lex.get_loose_token().text, "a");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Comment);
        // Mid-line comment leaves the newline in the stream.
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Whitespace);
        assert_eq!(lex.get_loose_token().text, "b");
    }

    #[test]
    fn full_line_comment_swallows_newline() {
        let mut lex = Lex::from_str("@# full line\nb");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Comment);
        let t = lex.get_loose_token();
        assert_eq!(t.text, "b");
        assert_eq!(t.line, 2);
    }

    #[test]
    fn shebang_ignored_on_first_line() {
        let mut lex = Lex::from_str("#!/usr/bin/tpt\nrest");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Comment);
        assert_eq!(lex.get_loose_token().text, "rest");
    }

    #[test]
    fn escape_and_joinline() {
        let mut lex = Lex::from_str("\\$x");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Escape);
        assert_eq!(t.text, "$");

        let mut lex = Lex::from_str("a\\\nb");
        assert_eq!(lex.get_loose_token().text, "a");
        assert_eq!(lex.get_loose_token().kind, TokenKind::JoinLine);
        let t = lex.get_loose_token();
        assert_eq!(t.text, "b");
        assert_eq!(t.line, 2);
    }

    #[test]
    fn crlf_counts_one_line() {
        let mut lex = Lex::from_str("a\r\nb");
        lex.get_loose_token();
        let ws = lex.get_loose_token();
        assert_eq!(ws.kind, TokenKind::Whitespace);
        assert_eq!(ws.text, "\r\n");
        let t = lex.get_loose_token();
        assert_eq!(t.line, 2);
    }

    #[test]
    fn unget_roundtrip() {
        let mut lex = Lex::from_str("@if(x)");
        let t = lex.get_strict_token();
        assert_eq!(t.kind, TokenKind::If);
        lex.unget(t.clone());
        let t2 = lex.get_strict_token();
        assert_eq!(t, t2);
        assert_eq!(lex.get_strict_token().kind, TokenKind::OpenParen);
    }

    #[test]
    fn seek_replays_tokens() {
        let mut lex = Lex::from_str("abc def");
        let mark = lex.index();
        let first = lex.get_loose_token();
        lex.get_loose_token();
        lex.get_loose_token();
        assert!(lex.seek(mark));
        assert_eq!(lex.get_loose_token().text, first.text);
    }

    #[test]
    fn get_block_verbatim() {
        let mut lex = Lex::from_str("{ a ${x} {nested} }tail");
        let block = lex.get_block().expect("block");
        assert!(block.text.starts_with('{'));
        assert!(block.text.contains("${x}"));
        assert!(block.text.contains("{nested}"));
        assert!(block.text.ends_with('}'));
        assert_eq!(lex.get_loose_token().text, "tail");
    }

    #[test]
    fn get_block_preserves_escapes() {
        let mut lex = Lex::from_str("{\\$x}");
        let block = lex.get_block().expect("block");
        assert!(block.text.contains("\\$"));
    }

    #[test]
    fn get_block_missing_brace_rolls_back() {
        let mut lex = Lex::from_str("abc");
        assert!(lex.get_block().is_err());
        assert_eq!(lex.get_loose_token().text, "abc");
    }

    #[test]
    fn ignore_block_skips_nested() {
        let mut lex = Lex::from_str("{a{b{c}}}after");
        lex.ignore_block().expect("ignore");
        assert_eq!(lex.get_loose_token().text, "after");
    }

    #[test]
    fn block_braces_in_strings_do_not_count() {
        let mut lex = Lex::from_str("{ @set(x)(\"}\") }after");
        lex.ignore_block().expect("ignore");
        assert_eq!(lex.get_loose_token().text, "after");
    }

    #[test]
    fn block_braces_in_comments_do_not_count() {
        let mut lex = Lex::from_str("{a@# } not a close\n}after");
        lex.ignore_block().expect("ignore");
        assert_eq!(lex.get_loose_token().text, "after");
    }

    #[test]
    fn ignoreindent_directive() {
        let mut lex = Lex::from_str("@ignoreindent\n    x");
        assert_eq!(lex.get_loose_token().kind, TokenKind::Comment);
        let ws = lex.get_loose_token(); // the newline
        assert_eq!(ws.kind, TokenKind::Whitespace);
        let ws = lex.get_loose_token(); // the indent, erased
        assert_eq!(ws.kind, TokenKind::Whitespace);
        assert_eq!(ws.text, "");
        assert_eq!(lex.get_loose_token().text, "x");
    }

    #[test]
    fn truncate_right_directive() {
        let mut lex = Lex::from_str("a@>   \n   b");
        assert_eq!(lex.get_loose_token().text, "a");
        let t = lex.get_loose_token();
        assert_eq!(t.kind, TokenKind::Whitespace);
        assert_eq!(t.text, "");
        assert_eq!(lex.get_loose_token().text, "b");
    }

    #[test]
    fn str2num_quirks() {
        assert_eq!(str2num("42"), 42);
        assert_eq!(str2num("-17"), -17);
        assert_eq!(str2num("+5"), 5);
        assert_eq!(str2num("  12"), 12);
        assert_eq!(str2num("12abc"), 12);
        assert_eq!(str2num("abc"), 0);
        assert_eq!(str2num(""), 0);
    }

    #[test]
    fn num2str_roundtrip() {
        assert_eq!(num2str(0), "0");
        assert_eq!(num2str(-99), "-99");
        assert_eq!(str2num(&num2str(i64::MAX)), i64::MAX);
    }

    #[test]
    fn token_positions() {
        let mut lex = Lex::from_str("ab\ncd");
        let t = lex.get_loose_token();
        assert_eq!((t.line, t.column), (1, 1));
        lex.get_loose_token(); // newline
        let t = lex.get_loose_token();
        assert_eq!(t.text, "cd");
        assert_eq!(t.line, 2);
    }
}
