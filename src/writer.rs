//! Writing MARC records to ISO 2709 bytes.
//!
//! [`to_bytes`] serializes one [`Record`]; [`MarcWriter`] streams records to any
//! destination implementing [`std::io::Write`].
//!
//! The leader's record length and base address are always recomputed from the
//! serialized directory and data area; whatever the in-memory leader holds in
//! those positions is ignored.

use crate::error::{MarcError, Result};
use crate::leader::{LEADER_LEN, MAX_RECORD_LEN};
use crate::reader::{FIELD_TERMINATOR, RECORD_TERMINATOR, SUBFIELD_DELIMITER};
use crate::record::Record;
use std::io::Write;

const MAX_FIELD_LEN: usize = 9_999;

/// Serialize a record to ISO 2709 bytes.
///
/// Control fields are emitted first, then data fields, each group in record
/// order.
///
/// # Errors
///
/// Returns [`MarcError::InvalidRecord`] if a field exceeds 9999 bytes or the
/// record exceeds 99999 bytes, and [`MarcError::InvalidField`] if a tag is not
/// three bytes long.
pub fn to_bytes(record: &Record) -> Result<Vec<u8>> {
    let mut data_area = Vec::new();
    let mut directory = Vec::new();

    for control in &record.control_fields {
        let start = data_area.len();
        data_area.extend_from_slice(control.value.as_bytes());
        data_area.push(FIELD_TERMINATOR);
        push_entry(&mut directory, &control.tag, data_area.len() - start, start)?;
    }

    for field in &record.fields {
        let start = data_area.len();
        data_area.push(indicator_byte(field.indicator1));
        data_area.push(indicator_byte(field.indicator2));
        for subfield in &field.subfields {
            data_area.push(SUBFIELD_DELIMITER);
            let mut code = [0u8; 4];
            data_area.extend_from_slice(subfield.code.encode_utf8(&mut code).as_bytes());
            data_area.extend_from_slice(subfield.value.as_bytes());
        }
        data_area.push(FIELD_TERMINATOR);
        push_entry(&mut directory, &field.tag, data_area.len() - start, start)?;
    }

    directory.push(FIELD_TERMINATOR);

    let base_address = LEADER_LEN + directory.len();
    let record_length = base_address + data_area.len() + 1;
    if record_length > MAX_RECORD_LEN {
        return Err(MarcError::InvalidRecord(format!(
            "Record length {record_length} exceeds {MAX_RECORD_LEN} bytes"
        )));
    }

    let mut leader = record.leader.clone();
    leader.record_length = u32::try_from(record_length)
        .map_err(|_| MarcError::InvalidRecord("Record length out of range".to_string()))?;
    leader.data_base_address = u32::try_from(base_address)
        .map_err(|_| MarcError::InvalidRecord("Base address out of range".to_string()))?;

    let mut bytes = Vec::with_capacity(record_length);
    bytes.extend_from_slice(&leader.as_bytes()?);
    bytes.extend_from_slice(&directory);
    bytes.extend_from_slice(&data_area);
    bytes.push(RECORD_TERMINATOR);
    Ok(bytes)
}

fn push_entry(directory: &mut Vec<u8>, tag: &str, length: usize, start: usize) -> Result<()> {
    if tag.len() != 3 {
        return Err(MarcError::InvalidField(format!(
            "Tag must be 3 bytes, got {tag:?}"
        )));
    }
    if length > MAX_FIELD_LEN {
        return Err(MarcError::InvalidRecord(format!(
            "Field {tag} is {length} bytes, limit is {MAX_FIELD_LEN}"
        )));
    }
    if start > MAX_RECORD_LEN {
        return Err(MarcError::InvalidRecord(format!(
            "Field {tag} starts at {start}, beyond the 5-digit offset limit"
        )));
    }
    directory.extend_from_slice(tag.as_bytes());
    directory.extend_from_slice(format!("{length:04}").as_bytes());
    directory.extend_from_slice(format!("{start:05}").as_bytes());
    Ok(())
}

fn indicator_byte(c: char) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        b' '
    }
}

/// Writer for ISO 2709 binary MARC format.
#[derive(Debug)]
pub struct MarcWriter<W: Write> {
    writer: W,
    records_written: usize,
    finished: bool,
}

impl<W: Write> MarcWriter<W> {
    /// Create a new MARC writer.
    pub fn new(writer: W) -> Self {
        MarcWriter {
            writer,
            records_written: 0,
            finished: false,
        }
    }

    /// Serialize one record and write it to the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized, the writer has been
    /// finished, or an I/O error occurs.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        if self.finished {
            return Err(MarcError::InvalidRecord(
                "Cannot write to a finished writer".to_string(),
            ));
        }
        let bytes = to_bytes(record)?;
        self.writer.write_all(&bytes)?;
        self.records_written += 1;
        Ok(())
    }

    /// Flush the writer and mark it as finished.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the underlying writer fails.
    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Returns the number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> usize {
        self.records_written
    }
}
