//! Z39.50 information retrieval protocol.
//!
//! - [`ber`]: BER tag-length-value primitives
//! - [`apdu`]: the Init, Search, Present and Close messages
//! - [`session`]: one client connection and its state machine
//! - [`server`]: a small responder serving an in-memory catalog

pub mod apdu;
pub mod ber;
pub mod server;
pub mod session;

pub use apdu::{decode, encode, Apdu};
pub use ber::{CodecError, Oid};
pub use session::{Session, SessionConfig, SessionError, SessionState};

/// Well-known Z39.50 port.
pub const DEFAULT_PORT: u16 = 210;

/// Bib-1 attribute set.
pub const BIB1_ATTRIBUTE_SET: &[u32] = &[1, 2, 840, 10003, 3, 1];

/// MARC21 (USMARC) record syntax.
pub const MARC21_SYNTAX: &[u32] = &[1, 2, 840, 10003, 5, 10];

/// Bib-1 diagnostic set.
pub const BIB1_DIAGNOSTIC_SET: &[u32] = &[1, 2, 840, 10003, 4, 1];

/// Protocol versions this crate speaks (1 through 3).
pub const SUPPORTED_VERSIONS: u8 = 3;

/// Bib-1 diagnostic conditions used by this crate.
pub mod diagnostics {
    /// Permanent system error
    pub const PERMANENT_SYSTEM_ERROR: i64 = 1;
    /// Unsupported search
    pub const UNSUPPORTED_SEARCH: i64 = 3;
    /// Present request out of range
    pub const PRESENT_OUT_OF_RANGE: i64 = 13;
    /// Specified result set does not exist
    pub const RESULT_SET_NOT_FOUND: i64 = 30;
    /// Record syntax not supported
    pub const UNSUPPORTED_SYNTAX: i64 = 239;
    /// Unsupported attribute type
    pub const UNSUPPORTED_ATTRIBUTE_TYPE: i64 = 113;
    /// Database unavailable
    pub const DATABASE_UNAVAILABLE: i64 = 109;
}
