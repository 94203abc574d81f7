//! Reader for the proprietary binary catalog file.
//!
//! Layout (little-endian): a `u32` format version and `u32` record count,
//! then `count` records of six length-prefixed strings each, in order
//! `artist, artist_unicode, title, title_unicode, creator, folder_name`.
//!
//! Strings carry a flag byte: `0x00` means absent, `0x0b` means a ULEB128
//! byte length followed by that many UTF-8 bytes. Any other flag byte is a
//! structural error. A structural error anywhere aborts the whole parse;
//! callers must fall back to filesystem-only data, never use a partial read.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use super::metadata::{leading_set_id, RecordSource, SetRecord};

/// String-present flag byte.
const STRING_PRESENT: u8 = 0x0b;
/// String-absent flag byte.
const STRING_ABSENT: u8 = 0x00;
/// Longest string the catalog may carry. A length prefix beyond this is
/// treated as corruption before any buffer is allocated.
const MAX_STRING_LEN: usize = 64 * 1024;

/// Errors from parsing the binary catalog. All are structural and fatal to
/// the parse attempt.
#[derive(Debug, Error)]
pub enum BinaryIndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid string flag byte 0x{0:02x}")]
    BadStringFlag(u8),

    #[error("string length prefix out of range")]
    BadLength,

    #[error("string field is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

/// Result of a successful binary catalog parse.
#[derive(Debug, Default)]
pub struct BinaryIndex {
    pub owned: HashSet<u64>,
    pub metadata: HashMap<u64, SetRecord>,
}

/// Parse the binary catalog at `path`.
///
/// Blocking; callers on the async side run this through `spawn_blocking`.
pub fn read_binary_index(path: &Path) -> Result<BinaryIndex, BinaryIndexError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    parse_index(&mut reader)
}

fn parse_index<R: Read>(reader: &mut R) -> Result<BinaryIndex, BinaryIndexError> {
    let version = read_u32(reader)?;
    let count = read_u32(reader)?;
    debug!(version, count, "parsing binary catalog");

    let mut index = BinaryIndex::default();
    for _ in 0..count {
        let artist = read_string(reader)?;
        let artist_unicode = read_string(reader)?;
        let title = read_string(reader)?;
        let title_unicode = read_string(reader)?;
        let creator = read_string(reader)?;
        let folder_name = read_string(reader)?;

        // Records whose folder name has no leading digit run cannot be
        // attributed to a set and are discarded, not an error.
        let Some(set_id) = leading_set_id(&folder_name) else {
            continue;
        };
        if !index.owned.insert(set_id) {
            // First occurrence wins on duplicate ids within the file.
            continue;
        }

        let record = SetRecord::new(
            set_id,
            prefer_unicode(artist_unicode, artist),
            prefer_unicode(title_unicode, title),
            creator,
        )
        .with_source(RecordSource::BinaryIndex);
        index.metadata.insert(set_id, record);
    }

    Ok(index)
}

fn prefer_unicode(unicode: String, plain: String) -> String {
    if unicode.is_empty() {
        plain
    } else {
        unicode
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, BinaryIndexError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, BinaryIndexError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// ULEB128, capped at 32 bits of significance.
fn read_uleb128<R: Read>(reader: &mut R) -> Result<usize, BinaryIndexError> {
    let mut value: usize = 0;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(reader)?;
        if shift >= 32 {
            return Err(BinaryIndexError::BadLength);
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, BinaryIndexError> {
    match read_u8(reader)? {
        STRING_ABSENT => Ok(String::new()),
        STRING_PRESENT => {
            let len = read_uleb128(reader)?;
            if len > MAX_STRING_LEN {
                return Err(BinaryIndexError::BadLength);
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            Ok(String::from_utf8(buf)?)
        }
        flag => Err(BinaryIndexError::BadStringFlag(flag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn push_string(buf: &mut Vec<u8>, value: Option<&str>) {
        match value {
            None => buf.push(STRING_ABSENT),
            Some(s) => {
                buf.push(STRING_PRESENT);
                let bytes = s.as_bytes();
                let mut len = bytes.len();
                loop {
                    let mut byte = (len & 0x7f) as u8;
                    len >>= 7;
                    if len != 0 {
                        byte |= 0x80;
                    }
                    buf.push(byte);
                    if len == 0 {
                        break;
                    }
                }
                buf.extend_from_slice(bytes);
            }
        }
    }

    fn push_record(
        buf: &mut Vec<u8>,
        artist: &str,
        artist_unicode: Option<&str>,
        title: &str,
        title_unicode: Option<&str>,
        creator: &str,
        folder: &str,
    ) {
        push_string(buf, Some(artist));
        push_string(buf, artist_unicode);
        push_string(buf, Some(title));
        push_string(buf, title_unicode);
        push_string(buf, Some(creator));
        push_string(buf, Some(folder));
    }

    fn build_index(records: usize, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&20240101u32.to_le_bytes());
        buf.extend_from_slice(&(records as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn parses_records_with_unicode_preference() {
        let mut body = Vec::new();
        push_record(
            &mut body,
            "Artist",
            Some("アーティスト"),
            "Title",
            None,
            "mapper",
            "101 Artist - Title",
        );
        let data = build_index(1, &body);

        let index = parse_index(&mut Cursor::new(data)).unwrap();
        assert_eq!(index.owned, HashSet::from([101]));
        let record = &index.metadata[&101];
        assert_eq!(record.artist, "アーティスト");
        assert_eq!(record.title, "Title");
        assert_eq!(record.creator, "mapper");
        assert_eq!(record.source, RecordSource::BinaryIndex);
    }

    #[test]
    fn first_occurrence_wins_on_duplicates() {
        let mut body = Vec::new();
        push_record(&mut body, "First", None, "T1", None, "c", "7 first");
        push_record(&mut body, "Second", None, "T2", None, "c", "7 second");
        let data = build_index(2, &body);

        let index = parse_index(&mut Cursor::new(data)).unwrap();
        assert_eq!(index.metadata[&7].artist, "First");
    }

    #[test]
    fn skips_folders_without_leading_digits() {
        let mut body = Vec::new();
        push_record(&mut body, "A", None, "T", None, "c", "no digits here");
        push_record(&mut body, "B", None, "T", None, "c", "0 zero id");
        push_record(&mut body, "C", None, "T", None, "c", "9 kept");
        let data = build_index(3, &body);

        let index = parse_index(&mut Cursor::new(data)).unwrap();
        assert_eq!(index.owned, HashSet::from([9]));
    }

    #[test]
    fn truncated_file_is_a_hard_error() {
        let mut body = Vec::new();
        push_record(&mut body, "A", None, "T", None, "c", "5 ok");
        // Count claims two records but only one is present.
        let data = build_index(2, &body);

        assert!(parse_index(&mut Cursor::new(data)).is_err());
    }

    #[test]
    fn bad_flag_byte_is_a_hard_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(0x42);

        let err = parse_index(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryIndexError::BadStringFlag(0x42)));
    }

    #[test]
    fn absurd_length_prefix_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(STRING_PRESENT);
        // ULEB128 for 2^30: a gigabyte-sized claim with no bytes behind it.
        buf.extend_from_slice(&[0x80, 0x80, 0x80, 0x80, 0x04]);

        let err = parse_index(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryIndexError::BadLength));
    }

    #[test]
    fn multibyte_uleb128_length() {
        let long = "x".repeat(300);
        let mut body = Vec::new();
        push_record(&mut body, &long, None, "T", None, "c", "11 long");
        let data = build_index(1, &body);

        let index = parse_index(&mut Cursor::new(data)).unwrap();
        assert_eq!(index.metadata[&11].artist.len(), 300);
    }
}
