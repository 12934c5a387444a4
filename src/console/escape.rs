//! Terminal escape sequence handling.
//!
//! The escape byte followed by `q` or `Q` detaches. The escape byte typed
//! twice sends it once. Any other byte after it is forwarded together with
//! the escape byte.

use super::error::{ConsoleError, ConsoleResult};

/// Parse an escape setting: `^X` caret notation or a single ASCII character.
///
/// `^^` is Ctrl-^ (0x1e).
pub fn parse_escape(setting: &str) -> ConsoleResult<u8> {
    match setting.as_bytes() {
        [b'^', c] if (b'?'..=b'_').contains(&c.to_ascii_uppercase()) => {
            Ok(c.to_ascii_uppercase() ^ 0x40)
        }
        [c] if c.is_ascii() => Ok(*c),
        _ => Err(ConsoleError::InvalidEscape(setting.to_string())),
    }
}

/// Output of [`EscapeFilter::feed`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Escaped {
    /// Bytes for the backend.
    pub data: Vec<u8>,
    /// The user asked to detach.
    pub quit: bool,
}

/// Watches local terminal input for the escape sequence.
#[derive(Debug)]
pub struct EscapeFilter {
    escape: u8,
    pending: bool,
}

impl EscapeFilter {
    /// Filter for escape byte `escape`.
    pub fn new(escape: u8) -> Self {
        Self {
            escape,
            pending: false,
        }
    }

    /// Filter one chunk of input. Bytes after a quit request are dropped.
    pub fn feed(&mut self, input: &[u8]) -> Escaped {
        let mut out = Escaped::default();
        for &byte in input {
            if !self.pending {
                if byte == self.escape {
                    self.pending = true;
                } else {
                    out.data.push(byte);
                }
                continue;
            }
            self.pending = false;
            match byte {
                b'q' | b'Q' => {
                    out.quit = true;
                    return out;
                }
                b if b == self.escape => out.data.push(b),
                b => out.data.extend_from_slice(&[self.escape, b]),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_escape() {
        assert_eq!(parse_escape("^^").unwrap(), 0x1e);
        assert_eq!(parse_escape("^]").unwrap(), 0x1d);
        assert_eq!(parse_escape("^a").unwrap(), 0x01);
        assert_eq!(parse_escape("~").unwrap(), b'~');
        for bad in ["", "abc", "^1", "é"] {
            assert!(parse_escape(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_quit_either_case() {
        for key in [b'q', b'Q'] {
            let mut filter = EscapeFilter::new(0x1e);
            let out = filter.feed(&[b'l', b's', 0x1e, key, b'x']);
            assert_eq!(out.data, b"ls");
            assert!(out.quit);
        }
    }

    #[test]
    fn test_doubled_escape_is_literal() {
        let mut filter = EscapeFilter::new(0x1e);
        let out = filter.feed(&[0x1e, 0x1e, b'q']);
        assert_eq!(out.data, [0x1e, b'q']);
        assert!(!out.quit);
    }

    #[test]
    fn test_sequence_split_across_reads() {
        let mut filter = EscapeFilter::new(0x1e);
        assert!(filter.feed(&[b'a', 0x1e]).data == b"a");
        let out = filter.feed(b"Q");
        assert!(out.quit);
        assert!(out.data.is_empty());
    }

    #[test]
    fn test_other_byte_forwards_both() {
        let mut filter = EscapeFilter::new(0x1e);
        assert_eq!(filter.feed(&[0x1e, b'x']).data, [0x1e, b'x']);
    }
}
