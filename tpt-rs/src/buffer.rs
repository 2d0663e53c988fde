//! Read-only character cursor over template source.
//!
//! A [`Buffer`] wraps the full text of a template (loaded from a file or
//! handed over as a string) and supports the three motions the lexer needs:
//! read the next character, push the last character back, and seek to an
//! absolute offset.  Offsets are character indices, stable across the
//! lifetime of the buffer, which is what makes loop-body re-execution by
//! `seek` possible.

use std::io;
use std::path::Path;

/// Read-only cursor over template source.
#[derive(Debug, Clone)]
pub struct Buffer {
    chars: Vec<char>,
    pos: usize,
}

impl Buffer {
    /// Create a buffer over an in-memory template string.
    pub fn from_str(src: &str) -> Self {
        Buffer {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    /// Create a buffer over the contents of a file.
    ///
    /// The file must be valid UTF-8; anything else is reported as an
    /// [`io::Error`] by the underlying read.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let src = std::fs::read_to_string(path)?;
        Ok(Self::from_str(&src))
    }

    /// Read the next character, advancing the cursor.
    pub fn get(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    /// Step the cursor back one character.  No-op at offset 0.
    pub fn unget(&mut self) {
        self.pos = self.pos.saturating_sub(1);
    }

    /// Current cursor offset (character index).
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Seek to an absolute offset.  Returns `false` if the offset is past
    /// the end of the buffer (the cursor is left unchanged).
    pub fn seek(&mut self, offset: usize) -> bool {
        if offset > self.chars.len() {
            return false;
        }
        self.pos = offset;
        true
    }

    /// Total length in characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// `true` when the buffer holds no characters at all.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// `true` when the cursor has passed the last character.
    pub fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_and_unget() {
        let mut buf = Buffer::from_str("ab");
        assert_eq!(buf.get(), Some('a'));
        buf.unget();
        assert_eq!(buf.get(), Some('a'));
        assert_eq!(buf.get(), Some('b'));
        assert_eq!(buf.get(), None);
    }

    #[test]
    fn unget_at_start_is_noop() {
        let mut buf = Buffer::from_str("x");
        buf.unget();
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.get(), Some('x'));
    }

    #[test]
    fn seek_and_offset() {
        let mut buf = Buffer::from_str("hello");
        assert_eq!(buf.get(), Some('h'));
        assert_eq!(buf.offset(), 1);
        assert!(buf.seek(3));
        assert_eq!(buf.get(), Some('l'));
        assert!(!buf.seek(99));
        assert_eq!(buf.offset(), 4);
    }

    #[test]
    fn seek_to_end_is_valid() {
        let mut buf = Buffer::from_str("ab");
        assert!(buf.seek(2));
        assert_eq!(buf.get(), None);
        assert!(buf.at_end());
    }

    #[test]
    fn multibyte_chars_are_single_positions() {
        let mut buf = Buffer::from_str("aßc");
        assert_eq!(buf.get(), Some('a'));
        assert_eq!(buf.get(), Some('ß'));
        assert_eq!(buf.offset(), 2);
        assert_eq!(buf.get(), Some('c'));
    }

    #[test]
    fn from_file_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        write!(f, "template {{}}").expect("write");
        let mut buf = Buffer::from_file(f.path()).expect("open");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.get(), Some('t'));
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(Buffer::from_file("/nonexistent/tpt-template").is_err());
    }
}
