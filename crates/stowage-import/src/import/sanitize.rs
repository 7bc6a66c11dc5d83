//! Byte-level cleanup in front of the CSV reader
//!
//! [`SanitizedReader`] wraps any `AsyncRead` and yields valid UTF-8:
//! a leading byte-order mark is dropped and every maximal invalid byte
//! sequence becomes a single U+FFFD, so line structure survives. A
//! multi-byte character split across two reads is carried over, never
//! replaced. Raw bytes consumed and replacements made are counted in a shared
//! [`SourceStats`].

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

const BOM: &[u8] = b"\xEF\xBB\xBF";
const REPLACEMENT: &str = "\u{FFFD}";
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Counts {
    bytes: AtomicU64,
    replacements: AtomicU64,
}

/// What the sanitizer has seen so far: raw bytes pulled from the source and
/// invalid sequences replaced. Shared with whoever drives the reader.
#[derive(Debug, Clone, Default)]
pub struct SourceStats(Arc<Counts>);

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.0.bytes.load(Ordering::Relaxed)
    }

    pub fn replacements(&self) -> u64 {
        self.0.replacements.load(Ordering::Relaxed)
    }

    fn add_bytes(&self, n: usize) {
        self.0.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_replacements(&self, n: u64) {
        if n > 0 {
            self.0.replacements.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Incremental UTF-8 repair, independent of any I/O
#[derive(Debug, Default)]
pub struct Utf8Sanitizer {
    /// Undecided bytes: a possible BOM prefix or an incomplete character
    pending: Vec<u8>,
    bom_checked: bool,
    replacements: u64,
}

impl Utf8Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invalid sequences replaced so far
    pub fn replacements(&self) -> u64 {
        self.replacements
    }

    /// Feed the next chunk; clean text is appended to `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);

        if !self.bom_checked {
            if self.pending.len() < BOM.len() && BOM.starts_with(&self.pending) {
                return;
            }
            if self.pending.starts_with(BOM) {
                self.pending.drain(..BOM.len());
            }
            self.bom_checked = true;
        }

        let consumed = self.decode(out, false);
        self.pending.drain(..consumed);
    }

    /// Flush at end of input; an incomplete trailing character is replaced.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        self.bom_checked = true;
        let consumed = self.decode(out, true);
        self.pending.drain(..consumed);
    }

    /// Decode as much of `pending` as possible, returning bytes consumed.
    fn decode(&mut self, out: &mut Vec<u8>, at_eof: bool) -> usize {
        let mut offset = 0;
        loop {
            let rest = &self.pending[offset..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.extend_from_slice(valid.as_bytes());
                    return self.pending.len();
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.extend_from_slice(&rest[..valid_up_to]);
                    match err.error_len() {
                        Some(invalid) => {
                            out.extend_from_slice(REPLACEMENT.as_bytes());
                            self.replacements += 1;
                            offset += valid_up_to + invalid;
                        }
                        // Truncated character at the end of the buffer
                        None if at_eof => {
                            out.extend_from_slice(REPLACEMENT.as_bytes());
                            self.replacements += 1;
                            return self.pending.len();
                        }
                        None => return offset + valid_up_to,
                    }
                }
            }
        }
    }
}

/// `AsyncRead` decorator that emits sanitized UTF-8
pub struct SanitizedReader<R> {
    inner: R,
    sanitizer: Utf8Sanitizer,
    stats: SourceStats,
    scratch: Box<[u8]>,
    /// Sanitized bytes not yet handed to the caller
    ready: Vec<u8>,
    position: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> SanitizedReader<R> {
    pub fn new(inner: R, stats: SourceStats) -> Self {
        Self {
            inner,
            sanitizer: Utf8Sanitizer::new(),
            stats,
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
            ready: Vec::new(),
            position: 0,
            eof: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SanitizedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.position < this.ready.len() {
                let available = &this.ready[this.position..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.position += n;
                if this.position == this.ready.len() {
                    this.ready.clear();
                    this.position = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            let replaced = this.sanitizer.replacements();

            if filled.is_empty() {
                this.eof = true;
                this.sanitizer.finish(&mut this.ready);
            } else {
                this.stats.add_bytes(filled.len());
                this.sanitizer.push(filled, &mut this.ready);
            }
            this.stats.add_replacements(this.sanitizer.replacements() - replaced);
        }
    }
}
