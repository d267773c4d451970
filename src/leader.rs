//! MARC record leader parsing and serialization.
//!
//! The MARC leader is a 24-byte fixed-length field at the start of every record.
//! Two of its positions are structural and are recomputed on every build:
//!
//! - Positions 0-4: Record length (5 digits)
//! - Positions 12-16: Base address of data (5 digits)
//!
//! The remaining positions describe the record:
//!
//! - Position 5: Record status
//! - Position 6: Type of record (a = language material)
//! - Position 7: Bibliographic level (m = monograph, s = serial)
//! - Position 8: Type of control
//! - Position 9: Character coding (space = MARC-8, a = UTF-8)
//! - Position 10: Indicator count (always 2 in MARC21)
//! - Position 11: Subfield code count (always 2 in MARC21)
//! - Positions 17-19: Encoding level, cataloging form, multipart level
//! - Positions 20-23: Entry map ("4500")

use crate::error::{MarcError, Result};
use serde::{Deserialize, Serialize};

/// Length of the leader in bytes.
pub const LEADER_LEN: usize = 24;

/// Largest value the 5-digit length fields can carry.
pub const MAX_RECORD_LEN: usize = 99_999;

/// MARC Leader - 24 bytes at the start of every MARC record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leader {
    /// Record length (5 digits) - positions 0-4
    pub record_length: u32,
    /// Record status (1 char) - position 5
    pub record_status: char,
    /// Type of record (1 char) - position 6
    pub record_type: char,
    /// Bibliographic level (1 char) - position 7
    pub bibliographic_level: char,
    /// Type of control record (1 char) - position 8
    pub control_record_type: char,
    /// Character coding scheme (1 char) - position 9
    pub character_coding: char,
    /// Indicator count (1 digit) - position 10
    pub indicator_count: u8,
    /// Subfield code count (1 digit) - position 11
    pub subfield_code_count: u8,
    /// Base address of data (5 digits) - positions 12-16
    pub data_base_address: u32,
    /// Encoding level (1 char) - position 17
    pub encoding_level: char,
    /// Cataloging form (1 char) - position 18
    pub cataloging_form: char,
    /// Multipart resource record level (1 char) - position 19
    pub multipart_level: char,
    /// Entry map (4 chars) - positions 20-23
    pub reserved: String,
}

impl Default for Leader {
    /// A new UTF-8 monograph leader with zeroed structural positions.
    fn default() -> Self {
        Leader {
            record_length: 0,
            record_status: 'n',
            record_type: 'a',
            bibliographic_level: 'm',
            control_record_type: ' ',
            character_coding: 'a',
            indicator_count: 2,
            subfield_code_count: 2,
            data_base_address: 0,
            encoding_level: ' ',
            cataloging_form: 'a',
            multipart_level: ' ',
            reserved: "4500".to_string(),
        }
    }
}

impl Leader {
    /// Parse a leader from the first 24 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are too short or a numeric position
    /// holds something other than ASCII digits.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LEADER_LEN {
            return Err(MarcError::InvalidLeader(format!(
                "Leader must be at least 24 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Leader {
            record_length: parse_digits(&bytes[0..5])?,
            record_status: bytes[5] as char,
            record_type: bytes[6] as char,
            bibliographic_level: bytes[7] as char,
            control_record_type: bytes[8] as char,
            character_coding: bytes[9] as char,
            indicator_count: parse_count(bytes[10], 10)?,
            subfield_code_count: parse_count(bytes[11], 11)?,
            data_base_address: parse_digits(&bytes[12..17])?,
            encoding_level: bytes[17] as char,
            cataloging_form: bytes[18] as char,
            multipart_level: bytes[19] as char,
            reserved: String::from_utf8_lossy(&bytes[20..24]).to_string(),
        })
    }

    /// Validate that the leader is suitable for binary record reading.
    ///
    /// `record_length` and `data_base_address` must both be at least 24, and
    /// the base address must fall inside the record.
    ///
    /// # Errors
    ///
    /// Returns [`MarcError::InvalidLeader`] when either check fails.
    pub fn validate_for_reading(&self) -> Result<()> {
        if (self.record_length as usize) < LEADER_LEN {
            return Err(MarcError::InvalidLeader(format!(
                "Record length must be at least 24, got {}",
                self.record_length
            )));
        }
        if (self.data_base_address as usize) < LEADER_LEN {
            return Err(MarcError::InvalidLeader(format!(
                "Base address of data must be at least 24, got {}",
                self.data_base_address
            )));
        }
        if self.data_base_address > self.record_length {
            return Err(MarcError::InvalidLeader(format!(
                "Base address {} lies beyond record length {}",
                self.data_base_address, self.record_length
            )));
        }
        Ok(())
    }

    /// Serialize the leader to its 24-byte form.
    ///
    /// # Errors
    ///
    /// Returns an error if a length does not fit five digits or the entry map
    /// is not exactly four bytes.
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        if self.record_length as usize > MAX_RECORD_LEN
            || self.data_base_address as usize > MAX_RECORD_LEN
        {
            return Err(MarcError::InvalidLeader(format!(
                "Length fields exceed 5 digits (length {}, base {})",
                self.record_length, self.data_base_address
            )));
        }
        let reserved_bytes = self.reserved.as_bytes();
        if reserved_bytes.len() != 4 {
            return Err(MarcError::InvalidLeader(format!(
                "Reserved field must be 4 characters, got {}",
                reserved_bytes.len()
            )));
        }

        let mut bytes = Vec::with_capacity(LEADER_LEN);
        bytes.extend_from_slice(format!("{:05}", self.record_length).as_bytes());
        for c in [
            self.record_status,
            self.record_type,
            self.bibliographic_level,
            self.control_record_type,
            self.character_coding,
        ] {
            bytes.push(ascii_byte(c));
        }
        bytes.push(b'0' + self.indicator_count.min(9));
        bytes.push(b'0' + self.subfield_code_count.min(9));
        bytes.extend_from_slice(format!("{:05}", self.data_base_address).as_bytes());
        for c in [
            self.encoding_level,
            self.cataloging_form,
            self.multipart_level,
        ] {
            bytes.push(ascii_byte(c));
        }
        bytes.extend_from_slice(reserved_bytes);

        Ok(bytes)
    }

    /// True when position 9 declares UCS/Unicode.
    #[must_use]
    pub fn is_unicode(&self) -> bool {
        self.character_coding == 'a'
    }
}

// Leader positions are single bytes; anything outside ASCII collapses to a blank.
fn ascii_byte(c: char) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        b' '
    }
}

fn parse_count(byte: u8, position: usize) -> Result<u8> {
    if byte.is_ascii_digit() {
        Ok(byte - b'0')
    } else {
        Err(MarcError::InvalidLeader(format!(
            "Invalid count at position {position}: {}",
            byte as char
        )))
    }
}

/// Parse 5-digit ASCII number from bytes
fn parse_digits(bytes: &[u8]) -> Result<u32> {
    let mut value = 0u32;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return Err(MarcError::InvalidLeader(format!(
                "Invalid numeric field: '{}'",
                String::from_utf8_lossy(bytes)
            )));
        }
        value = value * 10 + u32::from(byte - b'0');
    }
    Ok(value)
}
