use std::num::IntErrorKind;

use thiserror::Error;
use tracing::warn;

/// Hostnames longer than this cannot be stored (schema bound on the
/// `hostname` column) and are rejected at parse time.
pub const MAX_HOSTNAME_BYTES: usize = 200;

/// A single accounting record derived from one log line.
///
/// `byte_count` is the sum of the request and response byte fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub hostname: String,
    pub byte_count: u64,
}

/// Why a log line could not be turned into a [`TrafficRecord`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line is not valid UTF-8")]
    NotUtf8,
    #[error("line does not match '<hostname> <request_bytes> <response_bytes>'")]
    Malformed,
    #[error("byte count does not fit in 64 bits")]
    Overflow,
}

/// Splits raw byte chunks into complete lines, carrying an unterminated
/// trailing fragment over to the next chunk.
///
/// The carry buffer is bounded: once a line grows past `max_line_bytes`
/// without a terminator, its bytes are discarded until the terminator
/// arrives and the whole line is dropped. State is per source file and
/// never shared.
#[derive(Debug)]
pub struct LineBuffer {
    carry: Vec<u8>,
    max_line_bytes: usize,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            carry: Vec::new(),
            max_line_bytes,
            overflowed: false,
        }
    }

    /// Feeds a chunk of appended bytes and returns every line completed by
    /// it, without the terminator. A trailing `\r` is stripped so CRLF input
    /// parses the same as LF input.
    pub fn extract(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut start = 0;

        for (idx, &byte) in chunk.iter().enumerate() {
            if byte != b'\n' {
                continue;
            }

            let segment = &chunk[start..idx];
            start = idx + 1;

            if self.overflowed {
                // Tail end of a line that already blew the cap.
                self.overflowed = false;
                continue;
            }

            let mut line = std::mem::take(&mut self.carry);
            line.extend_from_slice(segment);
            if line.ends_with(b"\r") {
                line.pop();
            }
            if line.len() > self.max_line_bytes {
                warn!(
                    length = line.len(),
                    limit = self.max_line_bytes,
                    "line exceeds length limit, dropping",
                );
                continue;
            }
            lines.push(line);
        }

        let tail = &chunk[start..];
        if !tail.is_empty() && !self.overflowed {
            if self.carry.len() + tail.len() > self.max_line_bytes {
                warn!(
                    limit = self.max_line_bytes,
                    "line exceeds length limit, dropping until next terminator",
                );
                self.carry.clear();
                self.overflowed = true;
            } else {
                self.carry.extend_from_slice(tail);
            }
        }

        lines
    }

    /// Number of buffered bytes awaiting a terminator.
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Discards any buffered partial line. Used when a follower reopens its
    /// file after truncation or rotation.
    pub fn clear(&mut self) {
        self.carry.clear();
        self.overflowed = false;
    }
}

/// Parses one log line of the form `<hostname> <request_bytes>
/// <response_bytes>` into a [`TrafficRecord`].
///
/// Tokens after the third are ignored. Malformed lines and integer overflow
/// return an error instead of panicking so callers can skip and continue.
pub fn parse_record(line: &[u8]) -> Result<TrafficRecord, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::NotUtf8)?;

    let mut tokens = text.split_ascii_whitespace();

    let hostname = tokens.next().ok_or(ParseError::Malformed)?;
    if hostname.len() > MAX_HOSTNAME_BYTES {
        return Err(ParseError::Malformed);
    }

    let request_bytes = parse_count(tokens.next())?;
    let response_bytes = parse_count(tokens.next())?;

    let byte_count = request_bytes
        .checked_add(response_bytes)
        .ok_or(ParseError::Overflow)?;

    Ok(TrafficRecord {
        hostname: hostname.to_string(),
        byte_count,
    })
}

fn parse_count(token: Option<&str>) -> Result<u64, ParseError> {
    let token = token.ok_or(ParseError::Malformed)?;

    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Malformed);
    }

    token.parse::<u64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow => ParseError::Overflow,
        _ => ParseError::Malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_complete_lines() {
        let mut buf = LineBuffer::new(1024);
        let lines = buf.extract(b"a 1 2\nb 3 4\n");
        assert_eq!(lines, vec![b"a 1 2".to_vec(), b"b 3 4".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_extract_carries_partial_line() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.extract(b"a 10 2").is_empty());
        assert_eq!(buf.pending_len(), 6);

        let lines = buf.extract(b"0\nb 5 5\n");
        assert_eq!(lines, vec![b"a 10 20".to_vec(), b"b 5 5".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_extract_terminator_count_property() {
        // n terminators across arbitrary chunk boundaries produce exactly
        // n lines, byte-for-byte equal to the terminated substrings.
        let input = b"one 1 1\ntwo 2 2\nthree 3 3\ntrailing";
        for split in 0..input.len() {
            let mut buf = LineBuffer::new(1024);
            let mut lines = buf.extract(&input[..split]);
            lines.extend(buf.extract(&input[split..]));

            assert_eq!(
                lines,
                vec![
                    b"one 1 1".to_vec(),
                    b"two 2 2".to_vec(),
                    b"three 3 3".to_vec(),
                ],
                "split at {split}",
            );
            assert_eq!(buf.pending_len(), b"trailing".len());
        }
    }

    #[test]
    fn test_extract_strips_carriage_return() {
        let mut buf = LineBuffer::new(1024);
        let lines = buf.extract(b"a 1 2\r\n");
        assert_eq!(lines, vec![b"a 1 2".to_vec()]);
    }

    #[test]
    fn test_extract_empty_chunk_yields_nothing() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.extract(b"").is_empty());
    }

    #[test]
    fn test_oversized_line_dropped_at_next_terminator() {
        let mut buf = LineBuffer::new(8);
        assert!(buf.extract(b"0123456789abcdef").is_empty());
        // The oversized line's terminator consumes the overflow state; the
        // following line comes through intact.
        let lines = buf.extract(b"tail\nok 1 2\n");
        assert_eq!(lines, vec![b"ok 1 2".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_oversized_line_within_one_chunk_dropped() {
        let mut buf = LineBuffer::new(8);
        let lines = buf.extract(b"0123456789abcdef\nok 1 2\n");
        assert_eq!(lines, vec![b"ok 1 2".to_vec()]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_oversized_carry_completed_by_chunk_dropped() {
        let mut buf = LineBuffer::new(8);
        assert!(buf.extract(b"012345").is_empty());
        // Carry plus segment crosses the cap only once assembled.
        let lines = buf.extract(b"6789\nok 1 2\n");
        assert_eq!(lines, vec![b"ok 1 2".to_vec()]);
    }

    #[test]
    fn test_clear_resets_carry_and_overflow() {
        let mut buf = LineBuffer::new(8);
        buf.extract(b"0123456789abcdef");
        buf.clear();

        let lines = buf.extract(b"a 1 2\n");
        assert_eq!(lines, vec![b"a 1 2".to_vec()]);
    }

    #[test]
    fn test_parse_record_valid() {
        let record = parse_record(b"host1 100 250").expect("valid line");
        assert_eq!(record.hostname, "host1");
        assert_eq!(record.byte_count, 350);
    }

    #[test]
    fn test_parse_record_extra_tokens_ignored() {
        let record = parse_record(b"host1 1 2 extra stuff").expect("valid prefix");
        assert_eq!(record.byte_count, 3);
    }

    #[test]
    fn test_parse_record_malformed() {
        assert_eq!(parse_record(b"garbage-line"), Err(ParseError::Malformed));
        assert_eq!(parse_record(b""), Err(ParseError::Malformed));
        assert_eq!(parse_record(b"host1 abc 2"), Err(ParseError::Malformed));
        assert_eq!(parse_record(b"host1 -1 2"), Err(ParseError::Malformed));
        assert_eq!(parse_record(b"host1 100"), Err(ParseError::Malformed));
    }

    #[test]
    fn test_parse_record_rejects_overlong_hostname() {
        let line = format!("{} 1 2", "h".repeat(MAX_HOSTNAME_BYTES + 1));
        assert_eq!(parse_record(line.as_bytes()), Err(ParseError::Malformed));
    }

    #[test]
    fn test_parse_record_integer_overflow() {
        let line = format!("host1 {} 1", "9".repeat(30));
        assert_eq!(parse_record(line.as_bytes()), Err(ParseError::Overflow));

        // Each field fits but the sum does not.
        let line = format!("host1 {max} {max}", max = u64::MAX);
        assert_eq!(parse_record(line.as_bytes()), Err(ParseError::Overflow));
    }

    #[test]
    fn test_parse_record_non_utf8() {
        assert_eq!(parse_record(&[0xff, 0xfe, 0x20]), Err(ParseError::NotUtf8));
    }
}
