//! Records are opaque, newline-terminated byte sequences (spec §3). The
//! ingest tier never parses them; the store tier requires a leading ULID
//! token used for range encoding and ordering.

use ulid::Ulid;

use crate::error::{Error, ErrorKind, Result};

/// Splits a buffer of newline-framed records, returning each record's
/// bytes without the trailing `\n`. A final unterminated fragment (partial
/// record) is returned separately so callers can hold it for the next
/// read.
pub fn split_records(buf: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut records = Vec::new();
    let mut start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte == b'\n' {
            records.push(&buf[start..i]);
            start = i + 1;
        }
    }
    (records, &buf[start..])
}

/// Extracts the leading ULID token from a store-bound record.
///
/// Fails loudly with `MalformedRecord` rather than skipping -- spec §9
/// Open Question (b) is explicit that leniency here is not acceptable.
pub fn record_ulid(record: &[u8]) -> Result<Ulid> {
    let text = std::str::from_utf8(record)
        .map_err(|e| Error::with_source(ErrorKind::MalformedRecord, "record is not valid utf-8", e))?;
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::new(ErrorKind::MalformedRecord, "record has no ULID prefix"))?;
    token
        .parse::<Ulid>()
        .map_err(|e| Error::with_source(ErrorKind::MalformedRecord, format!("invalid ULID prefix {token:?}"), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_records_handles_partial_tail() {
        let buf = b"rec1\nrec2\npartial";
        let (records, tail) = split_records(buf);
        assert_eq!(records, vec![b"rec1".as_ref(), b"rec2".as_ref()]);
        assert_eq!(tail, b"partial");
    }

    #[test]
    fn split_records_empty_tail_when_fully_framed() {
        let buf = b"rec1\nrec2\n";
        let (records, tail) = split_records(buf);
        assert_eq!(records.len(), 2);
        assert!(tail.is_empty());
    }

    #[test]
    fn record_ulid_extracts_prefix() {
        let id = Ulid::new();
        let record = format!("{id} hello world");
        assert_eq!(record_ulid(record.as_bytes()).unwrap(), id);
    }

    #[test]
    fn record_ulid_rejects_missing_prefix() {
        let err = record_ulid(b"no ulid here").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }
}
