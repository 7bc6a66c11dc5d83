//! Record parsing and header-to-field mapping

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use crate::catalog::TableSpec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("Headers do not match table '{table}' (expected: {expected}; found: {found}); a column mapping is required")]
    HeaderMismatch {
        table: String,
        expected: String,
        found: String,
    },

    #[error("Column mapping names unknown field '{0}'")]
    UnknownField(String),

    #[error("Column mapping for '{field}' points at column {index}, but the file has {width} columns")]
    IndexOutOfRange {
        field: String,
        index: usize,
        width: usize,
    },

    #[error("Column mapping assigns field '{0}' twice")]
    DuplicateField(String),
}

/// One record as it came out of the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRecord {
    Row {
        line: u64,
        fields: Vec<String>,
    },
    /// Could not be split into the header's shape
    Malformed {
        line: u64,
        reason: String,
        raw: Vec<String>,
    },
}

impl ParsedRecord {
    pub fn line(&self) -> u64 {
        match self {
            ParsedRecord::Row { line, .. } | ParsedRecord::Malformed { line, .. } => *line,
        }
    }
}

const QUOTE: u8 = b'"';

/// Bytes handed to the CSV reader that it has not finished parsing yet
#[derive(Debug, Default)]
struct RawTail {
    /// Source offset of `bytes[0]`
    start: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct SharedTail(Arc<Mutex<RawTail>>);

impl SharedTail {
    fn lock(&self) -> MutexGuard<'_, RawTail> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, bytes: &[u8]) {
        self.lock().bytes.extend_from_slice(bytes);
    }

    /// Whether the raw text in `[from, to)` stops inside a quoted field.
    fn ends_quoted(&self, from: u64, to: u64, delimiter: u8) -> bool {
        let tail = self.lock();
        let begin = usize::try_from(from.saturating_sub(tail.start)).unwrap_or(usize::MAX);
        let end = usize::try_from(to.saturating_sub(tail.start)).unwrap_or(usize::MAX);
        match tail.bytes.get(begin.min(end)..end.min(tail.bytes.len())) {
            Some(raw) => ends_inside_quotes(raw, delimiter),
            None => false,
        }
    }

    /// Forget everything before source offset `offset`.
    fn release(&self, offset: u64) {
        let mut tail = self.lock();
        let n = usize::try_from(offset.saturating_sub(tail.start))
            .unwrap_or(usize::MAX)
            .min(tail.bytes.len());
        tail.bytes.drain(..n);
        tail.start += n as u64;
    }
}

/// Copies every byte read into the shared tail
struct Tap<R> {
    inner: R,
    tail: SharedTail,
}

impl<R: AsyncRead + Unpin> AsyncRead for Tap<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.tail.push(&buf.filled()[before..]);
        }
        poll
    }
}

/// Run the quoting rules over one raw record and report whether it ends
/// with a quoted field still open. A quote only opens a field at its start;
/// a doubled quote inside a quoted field is an escape.
fn ends_inside_quotes(raw: &[u8], delimiter: u8) -> bool {
    let mut quoted = false;
    let mut field_start = true;
    let mut bytes = raw.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        if quoted {
            if byte == QUOTE {
                if bytes.peek() == Some(&QUOTE) {
                    bytes.next();
                } else {
                    quoted = false;
                }
            }
        } else if byte == QUOTE && field_start {
            quoted = true;
            field_start = false;
        } else {
            field_start = byte == delimiter || byte == b'\n' || byte == b'\r';
        }
    }
    quoted
}

/// Streaming reader producing headers first, then records
pub struct RecordReader<R> {
    reader: AsyncReader<Tap<R>>,
    tail: SharedTail,
    record: StringRecord,
    delimiter: u8,
    width: usize,
    tolerance: usize,
    last_line: u64,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(source: R, delimiter: u8, field_count_tolerance: usize) -> Self {
        let tail = SharedTail::default();
        let reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .create_reader(Tap {
                inner: source,
                tail: tail.clone(),
            });

        Self {
            reader,
            tail,
            record: StringRecord::new(),
            delimiter,
            width: 0,
            tolerance: field_count_tolerance,
            last_line: 0,
        }
    }

    /// Read the header record. `Ok(None)` for an empty file.
    pub async fn read_headers(&mut self) -> Result<Option<Vec<String>>, csv_async::Error> {
        if !self.reader.read_record(&mut self.record).await? {
            return Ok(None);
        }
        self.last_line = self.current_line();
        self.tail.release(self.reader.position().byte());

        let headers: Vec<String> = self.record.iter().map(|h| h.trim().to_string()).collect();
        self.width = headers.len();
        Ok(Some(headers))
    }

    /// Next data record. I/O failures are returned as errors; anything
    /// else wrong with a record is reported as [`ParsedRecord::Malformed`].
    pub async fn next_record(&mut self) -> std::io::Result<Option<ParsedRecord>> {
        match self.reader.read_record(&mut self.record).await {
            Ok(false) => Ok(None),
            Ok(true) => {
                let line = self.current_line();
                self.last_line = line;
                let fields: Vec<String> = self.record.iter().map(str::to_string).collect();
                let unterminated = self.unterminated_quote();
                self.tail.release(self.reader.position().byte());

                if unterminated {
                    return Ok(Some(ParsedRecord::Malformed {
                        line,
                        reason: "unterminated quoted field".to_string(),
                        raw: fields,
                    }));
                }
                Ok(Some(self.shape(line, fields)))
            }
            Err(err) => match err.into_kind() {
                csv_async::ErrorKind::Io(io_err) => Err(io_err),
                other => {
                    self.last_line += 1;
                    Ok(Some(ParsedRecord::Malformed {
                        line: self.last_line,
                        reason: format!("unreadable record: {:?}", other),
                        raw: Vec::new(),
                    }))
                }
            },
        }
    }

    /// The reader closes an open quote at end of input without complaint,
    /// swallowing the rest of the file into one field.
    fn unterminated_quote(&self) -> bool {
        let Some(start) = self.record.position().map(|p| p.byte()) else {
            return false;
        };
        self.tail
            .ends_quoted(start, self.reader.position().byte(), self.delimiter)
    }

    fn current_line(&self) -> u64 {
        self.record
            .position()
            .map(|p| p.line())
            .unwrap_or(self.last_line + 1)
    }

    /// Check the width against the header, padding or trimming within
    /// tolerance. Extra trailing fields that are empty never count.
    fn shape(&self, line: u64, mut fields: Vec<String>) -> ParsedRecord {
        let width = self.width;

        if fields.len() > width {
            let extra_empty = fields[width..].iter().all(|f| f.trim().is_empty());
            if extra_empty || fields.len() - width <= self.tolerance {
                fields.truncate(width);
                return ParsedRecord::Row { line, fields };
            }
        } else if fields.len() < width && width - fields.len() <= self.tolerance {
            fields.resize(width, String::new());
            return ParsedRecord::Row { line, fields };
        } else if fields.len() == width {
            return ParsedRecord::Row { line, fields };
        }

        ParsedRecord::Malformed {
            line,
            reason: format!("expected {} fields, found {}", width, fields.len()),
            raw: fields,
        }
    }
}

/// How source columns feed table fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    /// For each table field, the source column it reads from
    sources: Vec<Option<usize>>,
    identity: bool,
}

impl ColumnMapping {
    /// Resolve the mapping for a file.
    ///
    /// An explicit mapping (field name -> source column) wins. Without
    /// one, the headers must equal the table's field names in order and
    /// count, compared case-insensitively.
    pub fn resolve(
        table: &TableSpec,
        headers: &[String],
        explicit: Option<&HashMap<String, usize>>,
    ) -> Result<Self, MappingError> {
        if let Some(explicit) = explicit {
            return Self::from_explicit(table, headers.len(), explicit);
        }

        if Self::headers_match(table, headers) {
            return Ok(Self {
                sources: (0..table.fields.len()).map(Some).collect(),
                identity: true,
            });
        }

        Err(MappingError::HeaderMismatch {
            table: table.key.clone(),
            expected: table.expected_headers().collect::<Vec<_>>().join(", "),
            found: headers.join(", "),
        })
    }

    pub fn headers_match(table: &TableSpec, headers: &[String]) -> bool {
        headers.len() == table.fields.len()
            && table
                .fields
                .iter()
                .zip(headers)
                .all(|(field, header)| field.name.eq_ignore_ascii_case(header.trim()))
    }

    fn from_explicit(
        table: &TableSpec,
        width: usize,
        explicit: &HashMap<String, usize>,
    ) -> Result<Self, MappingError> {
        let mut sources = vec![None; table.fields.len()];

        for (name, &index) in explicit {
            let field = table
                .field_index(name)
                .ok_or_else(|| MappingError::UnknownField(name.clone()))?;
            if index >= width {
                return Err(MappingError::IndexOutOfRange {
                    field: name.clone(),
                    index,
                    width,
                });
            }
            if sources[field].replace(index).is_some() {
                return Err(MappingError::DuplicateField(table.fields[field].name.clone()));
            }
        }

        let identity = sources.len() == width
            && sources.iter().enumerate().all(|(i, s)| *s == Some(i));
        Ok(Self { sources, identity })
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Values for each table field; unmapped fields are empty.
    pub fn apply(&self, fields: &[String]) -> Vec<String> {
        self.sources
            .iter()
            .map(|source| {
                source
                    .and_then(|i| fields.get(i))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }
}
