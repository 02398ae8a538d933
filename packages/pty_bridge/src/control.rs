//! Control channel protocol: one `<rows>x<cols>\n` resize directive per line.
//!
//! Lines are ASCII decimal, no sign, no surrounding whitespace (a single `\r`
//! before the newline is tolerated). Incomplete lines are buffered across
//! reads; complete lines that do not parse are reported and dropped without
//! affecting the ones around them.

use std::fmt;

use crate::session::{MAX_DIMENSION, WindowSize};

/// Longest directive line accepted; `9999x9999\r` needs 10 bytes.
pub const MAX_LINE_LEN: usize = 32;

/// A validated request to change the terminal size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeDirective {
    pub rows: u16,
    pub cols: u16,
}

/// Why a control line was discarded
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("malformed resize directive {0:?}")]
    Malformed(String),
    #[error("resize directive out of range: {rows}x{cols}")]
    InvalidSize { rows: u64, cols: u64 },
    #[error("resize directive longer than {MAX_LINE_LEN} bytes")]
    TooLong,
    #[error("control channel closed mid-directive ({0:?})")]
    Truncated(String),
}

impl ResizeDirective {
    /// Parse one line, without its terminating `\n`.
    pub fn parse(line: &[u8]) -> Result<Self, DirectiveError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let malformed = || DirectiveError::Malformed(String::from_utf8_lossy(line).into_owned());

        let sep = line.iter().position(|&b| b == b'x').ok_or_else(malformed)?;
        let (rows, cols) = (&line[..sep], &line[sep + 1..]);
        let rows = parse_decimal(rows).ok_or_else(malformed)?;
        let cols = parse_decimal(cols).ok_or_else(malformed)?;

        let in_range = |n: u64| (1..=u64::from(MAX_DIMENSION)).contains(&n);
        if !in_range(rows) || !in_range(cols) {
            return Err(DirectiveError::InvalidSize { rows, cols });
        }
        Ok(Self {
            rows: rows as u16,
            cols: cols as u16,
        })
    }

    /// Wire form, including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    pub fn size(&self) -> WindowSize {
        WindowSize {
            rows: self.rows,
            cols: self.cols,
        }
    }
}

impl From<WindowSize> for ResizeDirective {
    fn from(size: WindowSize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

impl fmt::Display for ResizeDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Non-empty run of ASCII digits; saturates instead of overflowing.
fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(digits.iter().fold(0u64, |acc, d| {
        acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
    }))
}

/// Incremental line splitter for the control channel.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    pending: Vec<u8>,
    // Set after an over-long line was reported; skip to the next newline.
    discarding: bool,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the control channel; returns one result per
    /// completed line, in order.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Result<ResizeDirective, DirectiveError>> {
        let mut out = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                self.pending.clear();
                continue;
            }
            self.pending.extend_from_slice(head);
            let line = std::mem::take(&mut self.pending);
            if line.len() > MAX_LINE_LEN {
                out.push(Err(DirectiveError::TooLong));
            } else {
                out.push(ResizeDirective::parse(&line));
            }
        }

        if !rest.is_empty() && !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > MAX_LINE_LEN {
                self.pending.clear();
                self.discarding = true;
                out.push(Err(DirectiveError::TooLong));
            }
        }
        out
    }

    /// Bytes of an incomplete line waiting for their newline.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Called when the control channel closes. An unterminated line is
    /// never applied.
    pub fn finish(&mut self) -> Option<DirectiveError> {
        self.discarding = false;
        if self.pending.is_empty() {
            return None;
        }
        let partial = std::mem::take(&mut self.pending);
        Some(DirectiveError::Truncated(
            String::from_utf8_lossy(&partial).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ok(rows: u16, cols: u16) -> Result<ResizeDirective, DirectiveError> {
        Ok(ResizeDirective { rows, cols })
    }

    #[test]
    fn parses_valid_directive() {
        assert_eq!(ResizeDirective::parse(b"24x80"), ok(24, 80));
        assert_eq!(ResizeDirective::parse(b"1x1"), ok(1, 1));
        assert_eq!(ResizeDirective::parse(b"9999x9999"), ok(9999, 9999));
        assert_eq!(ResizeDirective::parse(b"024x080"), ok(24, 80));
        assert_eq!(ResizeDirective::parse(b"24x80\r"), ok(24, 80));
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in [
            &b"abc"[..],
            b"24x",
            b"x80",
            b"24",
            b"",
            b" 24x80",
            b"24x80 ",
            b"24X80",
            b"24x80x10",
            b"-1x80",
            b"+24x80",
            b"\xff\xfe",
        ] {
            assert!(
                matches!(ResizeDirective::parse(line), Err(DirectiveError::Malformed(_))),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(
            ResizeDirective::parse(b"0x80"),
            Err(DirectiveError::InvalidSize { rows: 0, cols: 80 })
        );
        assert_eq!(
            ResizeDirective::parse(b"24x10000"),
            Err(DirectiveError::InvalidSize { rows: 24, cols: 10000 })
        );
        assert!(matches!(
            ResizeDirective::parse(b"99999999999999999999999x80"),
            Err(DirectiveError::InvalidSize { .. })
        ));
    }

    #[test]
    fn encode_matches_wire_format() {
        let d = ResizeDirective { rows: 24, cols: 80 };
        assert_eq!(d.encode(), "24x80\n");
        assert_eq!(ResizeDirective::parse(d.encode().trim_end().as_bytes()), Ok(d));
    }

    #[test]
    fn buffers_partial_lines() {
        let mut decoder = ControlDecoder::new();
        assert!(decoder.decode(b"2").is_empty());
        assert!(decoder.decode(b"4x8").is_empty());
        assert_eq!(decoder.pending(), b"24x8");
        assert_eq!(decoder.decode(b"0\n10x"), vec![ok(24, 80)]);
        assert_eq!(decoder.decode(b"40\n"), vec![ok(10, 40)]);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn bad_lines_do_not_disturb_neighbours() {
        let mut decoder = ControlDecoder::new();
        let results = decoder.decode(b"24x80\nabc\n0x80\n10x40\n");
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], ok(24, 80));
        assert!(matches!(results[1], Err(DirectiveError::Malformed(_))));
        assert!(matches!(results[2], Err(DirectiveError::InvalidSize { .. })));
        assert_eq!(results[3], ok(10, 40));
    }

    #[test]
    fn overlong_line_is_skipped_to_next_newline() {
        let mut decoder = ControlDecoder::new();
        let junk = vec![b'1'; MAX_LINE_LEN + 5];
        assert_eq!(decoder.decode(&junk), vec![Err(DirectiveError::TooLong)]);
        // The rest of the over-long line is swallowed silently.
        assert!(decoder.decode(b"111x111").is_empty());
        assert_eq!(decoder.decode(b"\n12x34\n"), vec![ok(12, 34)]);
    }

    #[test]
    fn finish_reports_truncated_line() {
        let mut decoder = ControlDecoder::new();
        assert_eq!(decoder.decode(b"24x80\n30x"), vec![ok(24, 80)]);
        assert_eq!(
            decoder.finish(),
            Some(DirectiveError::Truncated("30x".to_string()))
        );
        assert_eq!(decoder.finish(), None);
    }

    proptest! {
        #[test]
        fn chunking_never_changes_the_result(
            sizes in prop::collection::vec((1u16..=9999, 1u16..=9999), 1..20),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            let wire: Vec<u8> = sizes
                .iter()
                .map(|&(rows, cols)| ResizeDirective { rows, cols }.encode())
                .collect::<String>()
                .into_bytes();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len())).collect();
            points.sort_unstable();
            points.dedup();

            let mut decoder = ControlDecoder::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(wire.len())) {
                decoded.extend(decoder.decode(&wire[start..point]));
                start = point;
            }

            let expected: Vec<_> = sizes.iter().map(|&(r, c)| ok(r, c)).collect();
            prop_assert_eq!(decoded, expected);
            prop_assert!(decoder.finish().is_none());
        }

        #[test]
        fn garbage_never_yields_out_of_range_sizes(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut decoder = ControlDecoder::new();
            for directive in decoder.decode(&data).into_iter().flatten() {
                prop_assert!((1..=MAX_DIMENSION).contains(&directive.rows));
                prop_assert!((1..=MAX_DIMENSION).contains(&directive.cols));
            }
            prop_assert!(decoder.pending().len() <= MAX_LINE_LEN);
        }
    }
}
