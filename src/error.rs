//! Error types for MARC operations.
//!
//! This module provides the [`MarcError`] type for all MARC record parsing and
//! building operations and the [`Result`] convenience type. Protocol, session
//! and search errors live next to the modules that raise them.

use thiserror::Error;

/// Error type for MARC record operations.
///
/// Represents the conditions that can occur while parsing ISO 2709 bytes or
/// building a record. Accessors on [`Record`](crate::Record) never return
/// this type; they fall back to empty strings instead.
#[derive(Error, Debug)]
pub enum MarcError {
    /// Error indicating an invalid or malformed MARC record.
    #[error("Invalid MARC record: {0}")]
    InvalidRecord(String),

    /// Error indicating an invalid leader (24-byte header).
    #[error("Invalid leader: {0}")]
    InvalidLeader(String),

    /// Error indicating an invalid field structure.
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// The leader declares more bytes than the buffer holds.
    #[error("Truncated record: declared {declared} bytes, only {available} available")]
    TruncatedRecord {
        /// Record length from leader positions 0-4.
        declared: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The directory does not line up with the base address or data area.
    #[error("Directory corrupt: {0}")]
    DirectoryCorrupt(String),

    /// IO error from the underlying source/destination.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Convenience type alias for [`std::result::Result`] with [`MarcError`].
pub type Result<T> = std::result::Result<T, MarcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_record_display() {
        let err = MarcError::TruncatedRecord {
            declared: 120,
            available: 80,
        };
        assert_eq!(
            err.to_string(),
            "Truncated record: declared 120 bytes, only 80 available"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: MarcError = io_err.into();
        assert!(matches!(err, MarcError::IoError(_)));
    }
}
