#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! ## Modules
//!
//! - [`record`]: Core MARC record structures (`Record`, `Field`, `Subfield`)
//! - [`leader`]: MARC record leader (24-byte header)
//! - [`reader`]: Parsing ISO 2709 records
//! - [`writer`]: Serializing records to ISO 2709
//! - [`bibliographic`]: Building minimal AACR2 / RDA records
//! - [`query`]: Structured queries and their type-1 RPN form
//! - [`z3950`]: Z39.50 codec, client session and a small catalog server
//! - [`provider`]: Where federated searches get records from
//! - [`search`]: The multi-target orchestrator
//! - [`config`]: Target registry and search settings
//! - [`cancel`]: Cancellation of in-flight network work
//! - [`error`]: MARC error types and result type

pub mod bibliographic;
pub mod cancel;
pub mod config;
pub mod error;
pub mod leader;
pub mod provider;
pub mod query;
pub mod reader;
/// Core MARC record structures (`Record`, `Field`, `Subfield`)
pub mod record;
pub mod search;
pub mod writer;
pub mod z3950;

pub use bibliographic::{BibliographicData, CatalogingProfile};
pub use cancel::CancelToken;
pub use config::{ConfigError, Credentials, SearchConfig, Target, TargetRegistry};
pub use error::{MarcError, Result};
pub use leader::Leader;
pub use provider::{
    FetchedRecord, MemoryProvider, MemoryTarget, Provider, ProviderError, ResultSet, TargetSearch,
    Z3950Provider,
};
pub use query::{BooleanOp, QueryClause, QueryError, StructuredQuery, UseAttribute};
pub use reader::MarcReader;
pub use record::{ControlField, Field, FieldBuilder, Record, RecordBuilder, Subfield};
pub use search::{
    FederatedSearch, FnSink, JsonLinesSink, SearchError, SearchEvent, SearchReport, SearchResult,
    SearchSink, SearchStatus, TargetOutcome, TargetStatus,
};
pub use writer::MarcWriter;
