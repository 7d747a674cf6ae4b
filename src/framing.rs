//! Line framing for the device notification stream.
//!
//! The device emits newline-terminated CSV records, but the transport hands
//! them over in arbitrary notification-sized chunks:
//!
//! ```text
//! chunk 1: "12,00:00:01,"
//! chunk 2: "foo,1.5,2.25\n[debug] boot\n3,x,4.0,5\n"
//! ```
//!
//! [`LineDecoder`] carries the unterminated tail of each chunk over to the
//! next one and yields every completed line. Blank lines and diagnostic
//! lines (see [`LineDecoder::with_diagnostic_prefix`]) never reach the
//! record parser.
//!
//! The decoder never fails. Invalid UTF-8 is replaced, and a runaway
//! unterminated line is dropped once it exceeds the configured limit.

use crate::constants::{DEFAULT_DIAGNOSTIC_PREFIX, DEFAULT_MAX_LINE_LEN};

/// Incremental line decoder that handles partial reads.
///
/// Feed bytes via [`LineDecoder::feed`] and iterate the returned records.
/// Lines are split on raw bytes before text decoding, so a multi-byte
/// character split across two chunks still decodes intact.
#[derive(Debug)]
pub struct LineDecoder {
    carry: Vec<u8>,
    diagnostic_prefix: String,
    max_line_len: usize,
    /// Dropping the remainder of an overlong line until its newline arrives.
    resyncing: bool,
    discarded: u64,
    overlong: u64,
}

impl LineDecoder {
    /// Create a decoder with the default diagnostic prefix and line limit.
    pub fn new() -> Self {
        Self::with_diagnostic_prefix(DEFAULT_DIAGNOSTIC_PREFIX)
    }

    /// Create a decoder that drops lines starting with `prefix`.
    ///
    /// The prefix is matched against the trimmed line.
    pub fn with_diagnostic_prefix(prefix: impl Into<String>) -> Self {
        Self {
            carry: Vec::new(),
            diagnostic_prefix: prefix.into(),
            max_line_len: DEFAULT_MAX_LINE_LEN,
            resyncing: false,
            discarded: 0,
            overlong: 0,
        }
    }

    /// Override the longest unterminated line the decoder will carry.
    #[must_use]
    pub fn max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len.max(1);
        self
    }

    /// Append a chunk and return an iterator over the records it completes.
    ///
    /// Records are produced lazily. Lines not pulled from the iterator stay
    /// buffered and come out of the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Records<'_> {
        self.carry.extend_from_slice(chunk);
        Records { decoder: self }
    }

    /// Drop any carried partial line.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.resyncing = false;
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Number of bytes currently carried.
    pub fn partial_len(&self) -> usize {
        self.carry.len()
    }

    /// Blank and diagnostic lines dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Overlong unterminated fragments dropped so far.
    pub fn overlong(&self) -> u64 {
        self.overlong
    }

    /// Pull the next complete line out of the carry, filtering as we go.
    fn next_record(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                self.enforce_line_limit();
                return None;
            };

            let line_bytes: Vec<u8> = self.carry.drain(..=pos).collect();
            if self.resyncing {
                // Tail of an overlong line we already gave up on.
                self.resyncing = false;
                continue;
            }

            let line = String::from_utf8_lossy(&line_bytes[..pos]).into_owned();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                self.discarded += 1;
                continue;
            }
            if trimmed.starts_with(self.diagnostic_prefix.as_str()) {
                log::debug!("[Framing] Device diagnostic: {trimmed}");
                self.discarded += 1;
                continue;
            }

            return Some(line);
        }
    }

    fn enforce_line_limit(&mut self) {
        if self.carry.len() <= self.max_line_len {
            return;
        }
        if !self.resyncing {
            log::warn!(
                "[Framing] Dropping {} byte unterminated line (max {})",
                self.carry.len(),
                self.max_line_len
            );
            self.overlong += 1;
        }
        self.carry.clear();
        self.resyncing = true;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over the records completed by one [`LineDecoder::feed`].
#[derive(Debug)]
pub struct Records<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for Records<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.decoder.next_record()
    }
}
