//! Line reassembly over the per-connection read buffer.
//!
//! Bytes accumulate in an append-only buffer until a `\n` shows up; each
//! completed line is handed to the request parser with the terminator
//! stripped. Control and non-ASCII bytes inside a line are dropped but
//! still consumed, so `\r\n` terminators need no special casing. When the
//! buffer fills without a terminator the owning connection reports
//! `LineTooLong`; that condition is the caller's to detect via [`LineBuffer::space`].

/// a completed line and how many buffer bytes it consumed (terminator included)
#[derive(Debug, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub consumed: usize,
}

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> LineBuffer {
        LineBuffer {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// bytes that can still be appended before the buffer is full
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append freshly read bytes. Panics if the caller overruns the
    /// capacity; check [`space`](LineBuffer::space) first.
    pub fn fill(&mut self, data: &[u8]) {
        assert!(data.len() <= self.space(), "line buffer overrun");
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete line, consuming it and its terminator and
    /// leaving the remainder at the front of the buffer. Returns `None`
    /// (without consuming anything) while no terminator is present.
    pub fn next_line(&mut self) -> Option<Line> {
        let terminator = self.buf.iter().position(|&b| b == b'\n')?;
        let text = self.buf[..terminator]
            .iter()
            .filter(|&&b| b.is_ascii() && !b.is_ascii_control())
            .map(|&b| b as char)
            .collect();
        self.buf.drain(..=terminator);
        Some(Line {
            text,
            consumed: terminator + 1,
        })
    }

    /// Hand over whatever is buffered past the parsed request: for CONNECT
    /// these are the first tunnel bytes, for other methods the leading body
    /// bytes, forwarded verbatim once the target is connected.
    pub fn take_residue(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_line_and_leaves_remainder() {
        let mut lines = LineBuffer::new(64);
        lines.fill(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let line = lines.next_line().unwrap();
        assert_eq!(line.text, "GET / HTTP/1.1");
        assert_eq!(line.consumed, 16);
        assert_eq!(lines.len(), 9);
        let line = lines.next_line().unwrap();
        assert_eq!(line.text, "Host: x");
        assert!(lines.is_empty());
    }

    #[test]
    fn incomplete_line_is_left_untouched() {
        let mut lines = LineBuffer::new(64);
        lines.fill(b"partial");
        assert!(lines.next_line().is_none());
        // idempotent re-check
        assert!(lines.next_line().is_none());
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn control_and_non_ascii_bytes_are_dropped_but_consumed() {
        let mut lines = LineBuffer::new(64);
        lines.fill(b"a\x01b\xffc\nrest");
        let line = lines.next_line().unwrap();
        assert_eq!(line.text, "abc");
        // the dropped bytes still count toward the cursor
        assert_eq!(line.consumed, 6);
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn empty_line_is_a_valid_line() {
        let mut lines = LineBuffer::new(64);
        lines.fill(b"\r\nbody");
        let line = lines.next_line().unwrap();
        assert_eq!(line.text, "");
        assert_eq!(line.consumed, 2);
    }

    #[test]
    fn space_shrinks_as_bytes_accumulate() {
        let mut lines = LineBuffer::new(8);
        lines.fill(b"12345678");
        assert_eq!(lines.space(), 0);
        assert!(lines.next_line().is_none());
    }

    #[test]
    fn residue_hands_over_unparsed_bytes() {
        let mut lines = LineBuffer::new(64);
        lines.fill(b"\r\n\x16\x03\x01tls-hello");
        lines.next_line().unwrap();
        assert_eq!(lines.take_residue(), b"\x16\x03\x01tls-hello");
        assert!(lines.is_empty());
    }
}
