//! Newline-delimited text framing, as used by Stratum.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Default longest accepted line (64 KiB).
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Splits a byte stream into lines. `\n` terminates a line; a preceding `\r`
/// is stripped. Empty lines are skipped.
pub struct LineReader {
    buffer: BytesMut,
    max_line: usize,
    /// Bytes already scanned for `\n`, so rescans start where the last stopped.
    scanned: usize,
    failed: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line,
            scanned: 0,
            failed: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Lines<'_> {
        if !self.failed {
            self.buffer.extend_from_slice(data);
        }
        Lines { reader: self }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.failed = false;
    }

    fn next_line(&mut self) -> Result<Option<Bytes>> {
        if self.failed {
            return Ok(None);
        }
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| p + self.scanned);
            let pos = match found {
                Some(pos) => pos,
                None => {
                    self.scanned = self.buffer.len();
                    if self.buffer.len() > self.max_line {
                        let size = self.buffer.len();
                        self.failed = true;
                        self.buffer.clear();
                        return Err(WireError::FrameTooLarge {
                            size,
                            max: self.max_line,
                        });
                    }
                    return Ok(None);
                }
            };
            if pos > self.max_line {
                self.failed = true;
                self.buffer.clear();
                return Err(WireError::FrameTooLarge {
                    size: pos,
                    max: self.max_line,
                });
            }
            let mut line = self.buffer.split_to(pos + 1);
            self.scanned = 0;
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines completed by one `feed` call.
pub struct Lines<'a> {
    reader: &'a mut LineReader,
}

impl Iterator for Lines<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_line().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(reader: &mut LineReader, data: &[u8]) -> Vec<Bytes> {
        reader.feed(data).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn splits_and_strips_cr() {
        let mut r = LineReader::new();
        assert_eq!(lines(&mut r, b"one\r\ntwo\n\nthr"), vec![&b"one"[..], &b"two"[..]]);
        assert_eq!(lines(&mut r, b"ee\n"), vec![&b"three"[..]]);
    }

    #[test]
    fn byte_at_a_time() {
        let mut r = LineReader::new();
        let mut out = Vec::new();
        for b in b"{\"id\":1}\n{}\r\n" {
            out.extend(lines(&mut r, &[*b]));
        }
        assert_eq!(out, vec![&b"{\"id\":1}"[..], &b"{}"[..]]);
    }

    #[test]
    fn overlong_line_fails() {
        let mut r = LineReader::with_max_line(4);
        let res: Vec<_> = r.feed(b"abcdef").collect();
        assert!(matches!(res[0], Err(WireError::FrameTooLarge { .. })));
        assert!(r.is_failed());
        assert!(r.feed(b"ok\n").next().is_none());
    }
}
