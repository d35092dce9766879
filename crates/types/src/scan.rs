//! Line tokenizer for event streams.
//!
//! A line ends at the first `\r`, `\n` or `\r\n`. The scanner never consumes
//! a trailing `\r` until it knows whether a `\n` follows, so it can be fed
//! arbitrarily fragmented input.

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Outcome of scanning a buffer for the next line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan<'a> {
    /// A complete line. `advance` bytes, terminator included, must be
    /// consumed from the buffer.
    Token { advance: usize, line: &'a [u8] },
    /// No complete line is available yet.
    Incomplete,
    /// The input is finished and nothing is left to tokenize.
    Exhausted,
}

/// Find the next line in `buf`.
///
/// `at_eof` tells the scanner no more bytes will follow, in which case
/// unterminated trailing bytes are returned as a final line.
pub fn scan_line(buf: &[u8], at_eof: bool) -> Scan<'_> {
    if buf.is_empty() {
        return if at_eof {
            Scan::Exhausted
        } else {
            Scan::Incomplete
        };
    }

    let Some(eol) = memchr::memchr2(CR, LF, buf) else {
        return if at_eof {
            Scan::Token {
                advance: buf.len(),
                line: buf,
            }
        } else {
            Scan::Incomplete
        };
    };

    let terminator = match (buf[eol], buf.get(eol + 1)) {
        (CR, Some(&LF)) => 2,
        (CR, None) if !at_eof => return Scan::Incomplete,
        _ => 1,
    };

    Scan::Token {
        advance: eol + terminator,
        line: &buf[..eol],
    }
}
