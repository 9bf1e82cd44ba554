//! Sanitizer coverage traces (`.sancov`) and the campaign-wide edge set.
//!
//! A trace is an 8-byte magic header followed by little-endian 64-bit
//! records, one per covered PC. The header's first byte tells whether the
//! trace came from a 32-bit (`0x32`) or 64-bit (`0x64`) target; records are
//! eight bytes wide either way.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

const HEADER_TAIL: [u8; 7] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xbf, 0xc0];
pub const HEADER_32: [u8; 8] = header(0x32);
pub const HEADER_64: [u8; 8] = header(0x64);
const RECORD_LEN: usize = 8;

const fn header(width: u8) -> [u8; 8] {
    let mut bytes = [width; 8];
    let mut i = 0;
    while i < HEADER_TAIL.len() {
        bytes[i + 1] = HEADER_TAIL[i];
        i += 1;
    }
    bytes
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no valid header")]
    MissingHeader,
    #[error("trace ends inside a record ({0} trailing bytes)")]
    TruncatedRecord(usize),
    #[error("trace I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceWidth {
    Bits32,
    Bits64,
}

impl TraceWidth {
    pub fn from_header(bytes: &[u8; 8]) -> Option<Self> {
        match *bytes {
            HEADER_32 => Some(TraceWidth::Bits32),
            HEADER_64 => Some(TraceWidth::Bits64),
            _ => None,
        }
    }
}

/// Streams edge identifiers out of a trace, validating the header first.
///
/// Yields each record once, in file order. After the first error the
/// reader is exhausted.
pub struct TraceReader<R: Read> {
    inner: R,
    width: TraceWidth,
    done: bool,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(mut inner: R) -> Result<Self, DecodeError> {
        let mut head = [0u8; 8];
        if fill(&mut inner, &mut head)? != head.len() {
            return Err(DecodeError::MissingHeader);
        }
        let width = TraceWidth::from_header(&head).ok_or(DecodeError::MissingHeader)?;
        Ok(Self {
            inner,
            width,
            done: false,
        })
    }

    pub fn width(&self) -> TraceWidth {
        self.width
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<i64, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut record = [0u8; RECORD_LEN];
        match fill(&mut self.inner, &mut record) {
            Ok(RECORD_LEN) => Some(Ok(i64::from_le_bytes(record))),
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(partial) => {
                self.done = true;
                Some(Err(DecodeError::TruncatedRecord(partial)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decodes a whole trace file.
pub fn read_trace(path: &Path) -> Result<Vec<i64>, DecodeError> {
    TraceReader::open(path)?.collect()
}

/// Every distinct edge seen during the campaign. Only grows.
#[derive(Debug, Default, Clone)]
pub struct CoverageSet {
    edges: HashSet<i64>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the edge was not seen before.
    pub fn insert(&mut self, edge: i64) -> bool {
        self.edges.insert(edge)
    }

    /// Adds a batch, returning how many edges were new.
    pub fn extend<I: IntoIterator<Item = i64>>(&mut self, batch: I) -> usize {
        let before = self.edges.len();
        self.edges.extend(batch);
        self.edges.len() - before
    }

    pub fn contains(&self, edge: i64) -> bool {
        self.edges.contains(&edge)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn trace(header: [u8; 8], values: &[i64]) -> Vec<u8> {
        let mut bytes = header.to_vec();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    fn decode(bytes: Vec<u8>) -> Result<Vec<i64>, DecodeError> {
        TraceReader::new(Cursor::new(bytes))?.collect()
    }

    #[test]
    fn header_constants_match_sancov_magic() {
        assert_eq!(HEADER_64, [0x64, 0xff, 0xff, 0xff, 0xff, 0xff, 0xbf, 0xc0]);
        assert_eq!(HEADER_32, [0x32, 0xff, 0xff, 0xff, 0xff, 0xff, 0xbf, 0xc0]);
    }

    #[test]
    fn decodes_64_bit_trace_in_order() {
        let values = [0x4005d0, -1, i64::MAX, i64::MIN, 0, 0x4005d0];
        let reader = TraceReader::new(Cursor::new(trace(HEADER_64, &values))).unwrap();
        assert_eq!(reader.width(), TraceWidth::Bits64);
        let decoded: Vec<i64> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn decodes_32_bit_header_variant() {
        let reader = TraceReader::new(Cursor::new(trace(HEADER_32, &[7, 8]))).unwrap();
        assert_eq!(reader.width(), TraceWidth::Bits32);
        assert_eq!(reader.collect::<Result<Vec<_>, _>>().unwrap(), vec![7, 8]);
    }

    #[test]
    fn header_only_trace_is_empty() {
        assert!(decode(HEADER_64.to_vec()).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_header_regardless_of_length() {
        let mut bad = HEADER_64;
        bad[7] = 0xc1;
        for values in [&[][..], &[1][..], &[1, 2, 3][..]] {
            assert!(matches!(
                decode(trace(bad, values)),
                Err(DecodeError::MissingHeader)
            ));
        }
        assert!(matches!(
            decode(trace([0x00; 8], &[1])),
            Err(DecodeError::MissingHeader)
        ));
    }

    #[test]
    fn rejects_short_and_empty_files() {
        assert!(matches!(decode(vec![]), Err(DecodeError::MissingHeader)));
        assert!(matches!(
            decode(HEADER_64[..5].to_vec()),
            Err(DecodeError::MissingHeader)
        ));
    }

    #[test]
    fn rejects_trailing_partial_record() {
        let mut bytes = trace(HEADER_64, &[1, 2]);
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::TruncatedRecord(3))
        ));
    }

    #[test]
    fn read_trace_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer.1234.sancov");
        std::fs::write(&path, trace(HEADER_64, &[10, 20, 30])).unwrap();
        assert_eq!(read_trace(&path).unwrap(), vec![10, 20, 30]);

        let missing = dir.path().join("missing.sancov");
        assert!(matches!(read_trace(&missing), Err(DecodeError::Io(_))));
    }

    #[test]
    fn coverage_set_deduplicates() {
        let mut set = CoverageSet::new();
        assert!(set.is_empty());
        assert!(set.insert(42));
        assert!(!set.insert(42));
        assert_eq!(set.len(), 1);

        assert_eq!(set.extend(vec![1, 2, 42, 2]), 2);
        assert_eq!(set.len(), 3);
        assert!(set.contains(1) && set.contains(2) && set.contains(42));
        assert!(!set.contains(3));
    }
}
