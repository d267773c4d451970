//! Reading MARC records from ISO 2709 bytes.
//!
//! [`parse`] decodes one record from a byte slice; [`MarcReader`] reads
//! consecutive records from any source implementing [`std::io::Read`].
//!
//! Both enforce the structural invariant of ISO 2709: the leader's record length
//! matches the bytes present, the directory ends exactly at the base address,
//! and every directory entry bounds one terminated field in the data area.
//!
//! # Examples
//!
//! ```
//! use fedcat::{reader, writer, Field, Leader, Record};
//!
//! let mut record = Record::new(Leader::default());
//! record.add_control_field_str("001", "42");
//! let bytes = writer::to_bytes(&record)?;
//!
//! let parsed = reader::parse(&bytes)?;
//! assert_eq!(parsed.id(), "42");
//! # Ok::<(), fedcat::MarcError>(())
//! ```

use crate::error::{MarcError, Result};
use crate::leader::{Leader, LEADER_LEN};
use crate::record::{is_control_tag, Field, Record};
use std::io::Read;

pub(crate) const FIELD_TERMINATOR: u8 = 0x1E;
pub(crate) const SUBFIELD_DELIMITER: u8 = 0x1F;
pub(crate) const RECORD_TERMINATOR: u8 = 0x1D;

/// Size of one directory entry: tag(3) + length(4) + start position(5).
pub(crate) const DIRECTORY_ENTRY_LEN: usize = 12;

/// Parse a single ISO 2709 record from the start of `bytes`.
///
/// Trailing bytes after the declared record length are ignored.
///
/// # Errors
///
/// - [`MarcError::TruncatedRecord`] if the leader declares more bytes than `bytes` holds
/// - [`MarcError::DirectoryCorrupt`] if the directory does not align with the base
///   address or an entry does not bound a terminated field
/// - [`MarcError::InvalidLeader`] / [`MarcError::InvalidField`] for malformed content
pub fn parse(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < LEADER_LEN {
        return Err(MarcError::TruncatedRecord {
            declared: LEADER_LEN,
            available: bytes.len(),
        });
    }

    let leader = Leader::from_bytes(bytes)?;
    leader.validate_for_reading()?;

    let record_length = leader.record_length as usize;
    let base_address = leader.data_base_address as usize;

    if record_length > bytes.len() {
        return Err(MarcError::TruncatedRecord {
            declared: record_length,
            available: bytes.len(),
        });
    }
    let bytes = &bytes[..record_length];

    if bytes[record_length - 1] != RECORD_TERMINATOR {
        return Err(MarcError::InvalidRecord(
            "Record does not end with a record terminator".to_string(),
        ));
    }

    // The directory occupies [24, base - 1) and is followed by one field terminator.
    let directory_len = base_address
        .checked_sub(LEADER_LEN + 1)
        .ok_or_else(|| MarcError::DirectoryCorrupt("Base address leaves no room".to_string()))?;
    if directory_len % DIRECTORY_ENTRY_LEN != 0 {
        return Err(MarcError::DirectoryCorrupt(format!(
            "Directory length {directory_len} is not a multiple of {DIRECTORY_ENTRY_LEN}"
        )));
    }
    if bytes[base_address - 1] != FIELD_TERMINATOR {
        return Err(MarcError::DirectoryCorrupt(format!(
            "No field terminator before base address {base_address}"
        )));
    }

    let directory = &bytes[LEADER_LEN..base_address - 1];
    let data = &bytes[base_address..record_length - 1];

    let mut record = Record::new(leader);

    for entry in directory.chunks_exact(DIRECTORY_ENTRY_LEN) {
        let tag = String::from_utf8_lossy(&entry[0..3]).to_string();
        let field_length = parse_number(&entry[3..7])?;
        let start_position = parse_number(&entry[7..12])?;
        let end_position = start_position + field_length;

        if field_length == 0 || end_position > data.len() {
            return Err(MarcError::DirectoryCorrupt(format!(
                "Field {tag} at {start_position}+{field_length} exceeds data area of {} bytes",
                data.len()
            )));
        }

        let field_data = &data[start_position..end_position];
        if field_data[field_length - 1] != FIELD_TERMINATOR {
            return Err(MarcError::DirectoryCorrupt(format!(
                "Field {tag} length {field_length} does not end at a field terminator"
            )));
        }
        let content = &field_data[..field_length - 1];

        if is_control_tag(&tag) {
            record.add_control_field(tag, String::from_utf8_lossy(content).to_string());
        } else {
            let field = parse_data_field(content, &tag)
                .map_err(|e| MarcError::InvalidField(format!("Tag {tag}: {e}")))?;
            record.add_field(field);
        }
    }

    Ok(record)
}

/// Reader for ISO 2709 binary MARC format.
///
/// `MarcReader` reads one MARC record at a time from any source implementing
/// [`std::io::Read`]. Each record is validated by [`parse`].
#[derive(Debug)]
pub struct MarcReader<R: Read> {
    reader: R,
    records_read: usize,
}

impl<R: Read> MarcReader<R> {
    /// Create a new MARC reader.
    pub fn new(reader: R) -> Self {
        MarcReader {
            reader,
            records_read: 0,
        }
    }

    /// Read a single MARC record.
    ///
    /// Returns `Ok(Some(record))` if a record was successfully read, `Ok(None)` at a
    /// clean end of input, or `Err` if a record is malformed or cut short.
    ///
    /// # Errors
    ///
    /// Returns an error if the record structure is invalid or an I/O error occurs.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        let mut leader_bytes = [0u8; LEADER_LEN];
        let got = read_up_to(&mut self.reader, &mut leader_bytes)?;
        if got == 0 {
            return Ok(None);
        }
        if got < LEADER_LEN {
            return Err(MarcError::TruncatedRecord {
                declared: LEADER_LEN,
                available: got,
            });
        }

        let leader = Leader::from_bytes(&leader_bytes)?;
        leader.validate_for_reading()?;
        let record_length = leader.record_length as usize;

        let mut record_bytes = Vec::with_capacity(record_length);
        record_bytes.extend_from_slice(&leader_bytes);
        record_bytes.resize(record_length, 0);
        let got = read_up_to(&mut self.reader, &mut record_bytes[LEADER_LEN..])?;
        if got < record_length - LEADER_LEN {
            return Err(MarcError::TruncatedRecord {
                declared: record_length,
                available: LEADER_LEN + got,
            });
        }

        let record = parse(&record_bytes)?;
        self.records_read += 1;
        Ok(Some(record))
    }

    /// Number of records successfully read so far.
    #[must_use]
    pub fn records_read(&self) -> usize {
        self.records_read
    }

    /// Read every remaining record.
    ///
    /// # Errors
    ///
    /// Stops at the first malformed record and returns its error.
    pub fn read_all(&mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Fill `buf` as far as the source allows; returns the number of bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(MarcError::IoError(e)),
        }
    }
    Ok(filled)
}

/// Parse a data field from its content (terminator already stripped)
fn parse_data_field(data: &[u8], tag: &str) -> Result<Field> {
    if data.len() < 2 {
        return Err(MarcError::InvalidField(
            "Data field too short (needs indicators)".to_string(),
        ));
    }

    let mut field = Field::new(tag.to_string(), data[0] as char, data[1] as char);

    let subfield_data = &data[2..];
    if subfield_data.is_empty() {
        return Ok(field);
    }
    if subfield_data[0] != SUBFIELD_DELIMITER {
        return Err(MarcError::InvalidField(
            "Expected subfield delimiter".to_string(),
        ));
    }

    for chunk in subfield_data[1..].split(|&b| b == SUBFIELD_DELIMITER) {
        let Some((&code, value)) = chunk.split_first() else {
            continue;
        };
        field.add_subfield(code as char, String::from_utf8_lossy(value).to_string());
    }

    Ok(field)
}

/// Parse a fixed-width ASCII number from a directory entry
fn parse_number(bytes: &[u8]) -> Result<usize> {
    let mut result = 0usize;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return Err(MarcError::DirectoryCorrupt(format!(
                "Invalid numeric field: expected digits, got byte {}",
                byte as char
            )));
        }
        result = result * 10 + (byte - b'0') as usize;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Hand-assembled record with one 245 field, independent of the writer.
    fn manual_record(title: &str) -> Vec<u8> {
        let mut field_245 = Vec::new();
        field_245.extend_from_slice(b"10");
        field_245.push(SUBFIELD_DELIMITER);
        field_245.push(b'a');
        field_245.extend_from_slice(title.as_bytes());
        field_245.push(FIELD_TERMINATOR);

        let mut directory = Vec::new();
        directory.extend_from_slice(b"245");
        directory.extend_from_slice(format!("{:04}", field_245.len()).as_bytes());
        directory.extend_from_slice(b"00000");
        directory.push(FIELD_TERMINATOR);

        let base_address = LEADER_LEN + directory.len();
        let record_length = base_address + field_245.len() + 1;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(format!("{record_length:05}").as_bytes());
        bytes.extend_from_slice(b"nam a22");
        bytes.extend_from_slice(format!("{base_address:05}").as_bytes());
        bytes.extend_from_slice(b"   4500");
        bytes.extend_from_slice(&directory);
        bytes.extend_from_slice(&field_245);
        bytes.push(RECORD_TERMINATOR);
        bytes
    }

    #[test]
    fn test_parse_simple_record() {
        let record = parse(&manual_record("Test title")).unwrap();

        assert_eq!(record.leader.record_type, 'a');
        let field = record.get_field("245").unwrap();
        assert_eq!(field.indicator1, '1');
        assert_eq!(field.indicator2, '0');
        assert_eq!(field.get_subfield('a'), Some("Test title"));
    }

    #[test]
    fn test_parse_truncated_buffer() {
        let bytes = manual_record("Test title");
        let err = parse(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, MarcError::TruncatedRecord { .. }), "got {err}");
    }

    #[test]
    fn test_parse_short_leader_is_truncated() {
        let err = parse(b"00050nam").unwrap_err();
        assert!(matches!(
            err,
            MarcError::TruncatedRecord {
                declared: 24,
                available: 8
            }
        ));
    }

    #[test]
    fn test_parse_misaligned_base_address() {
        let mut bytes = manual_record("Test title");
        // Shift the base address by one so the directory no longer holds whole entries.
        let base = std::str::from_utf8(&bytes[12..17]).unwrap().parse::<usize>().unwrap();
        bytes[12..17].copy_from_slice(format!("{:05}", base + 1).as_bytes());
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, MarcError::DirectoryCorrupt(_)), "got {err}");
    }

    #[test]
    fn test_parse_entry_length_mismatch() {
        let mut bytes = manual_record("Test title");
        // Directory length digits live at 27..31; shorten the declared field by one byte.
        let len = std::str::from_utf8(&bytes[27..31]).unwrap().parse::<usize>().unwrap();
        bytes[27..31].copy_from_slice(format!("{:04}", len - 1).as_bytes());
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, MarcError::DirectoryCorrupt(_)), "got {err}");
    }

    #[test]
    fn test_parse_missing_record_terminator() {
        let mut bytes = manual_record("Test title");
        let last = bytes.len() - 1;
        bytes[last] = b'x';
        assert!(matches!(
            parse(&bytes).unwrap_err(),
            MarcError::InvalidRecord(_)
        ));
    }

    #[test]
    fn test_reader_eof_returns_none() {
        let mut reader = MarcReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_reader_multiple_records() {
        let mut all_bytes = manual_record("First");
        all_bytes.extend(manual_record("Second"));
        all_bytes.extend(manual_record("Third"));

        let mut reader = MarcReader::new(Cursor::new(all_bytes));
        let records = reader.read_all().unwrap();

        let titles: Vec<&str> = records.iter().map(Record::title).collect();
        assert_eq!(titles, vec!["First", "Second", "Third"]);
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn test_reader_truncated_stream() {
        let bytes = manual_record("Cut short");
        let mut reader = MarcReader::new(Cursor::new(bytes[..bytes.len() - 3].to_vec()));
        assert!(matches!(
            reader.read_record().unwrap_err(),
            MarcError::TruncatedRecord { .. }
        ));
    }

    #[test]
    fn test_malformed_leader_record_length_too_small() {
        let mut reader = MarcReader::new(Cursor::new(b"00010nam a2200025 i 4500".to_vec()));
        let err = reader.read_record().unwrap_err().to_string();
        assert!(
            err.contains("Record length must be at least 24"),
            "got: {err}"
        );
    }

    #[test]
    fn test_data_field_without_subfields() {
        let field = parse_data_field(b"  ", "500").unwrap();
        assert!(field.subfields.is_empty());
    }

    #[test]
    fn test_data_field_missing_delimiter() {
        assert!(parse_data_field(b"10abc", "245").is_err());
    }
}
