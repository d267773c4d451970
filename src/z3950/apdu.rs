//! Z39.50 APDUs and their BER encoding.
//!
//! Seven message kinds are supported: Init, Search and Present in both
//! directions, and Close. [`encode`] always emits definite lengths;
//! [`decode`] reads exactly one APDU from the front of a buffer and reports
//! how many bytes it used, so a session can accumulate socket reads and retry
//! on [`CodecError::Incomplete`].
//!
//! Decoding is tolerant: unknown context fields inside an APDU are skipped and
//! missing optional fields become `None` or zero. Anything this module emits
//! decodes back to an equal value and re-encodes to identical bytes.

use super::ber::{
    parse_tlv, universal, BerReader, BerWriter, BitString, CodecError, CodecResult, Oid, Tag,
    TagClass, Tlv,
};
use super::{BIB1_DIAGNOSTIC_SET, MARC21_SYNTAX};
use crate::query::{AttributeElement, BooleanOp, RpnNode, RpnQuery};

const INIT_REQUEST: u32 = 20;
const INIT_RESPONSE: u32 = 21;
const SEARCH_REQUEST: u32 = 22;
const SEARCH_RESPONSE: u32 = 23;
const PRESENT_REQUEST: u32 = 24;
const PRESENT_RESPONSE: u32 = 25;
const CLOSE: u32 = 48;

// Deeper RPN trees than this are rejected instead of recursed into.
const MAX_QUERY_DEPTH: usize = 64;

/// Option bits of the Init `options` BIT STRING.
pub mod options {
    /// search
    pub const SEARCH: usize = 0;
    /// present
    pub const PRESENT: usize = 1;
    /// delSet
    pub const DELETE_SET: usize = 2;
    /// resourceReport
    pub const RESOURCE_REPORT: usize = 3;
    /// triggerResourceCtrl
    pub const TRIGGER_RESOURCE_CONTROL: usize = 4;
    /// resourceCtrl
    pub const RESOURCE_CONTROL: usize = 5;
    /// accessCtrl
    pub const ACCESS_CONTROL: usize = 6;
    /// scan
    pub const SCAN: usize = 7;
    /// sort
    pub const SORT: usize = 8;
    /// extendedServices
    pub const EXTENDED_SERVICES: usize = 10;
    /// level-1Segmentation
    pub const LEVEL_1_SEGMENTATION: usize = 11;
    /// level-2Segmentation
    pub const LEVEL_2_SEGMENTATION: usize = 12;
    /// concurrentOperations
    pub const CONCURRENT_OPERATIONS: usize = 13;
    /// namedResultSets
    pub const NAMED_RESULT_SETS: usize = 14;
}

/// `presentStatus` values.
pub mod present_status {
    /// All requested records returned
    pub const SUCCESS: i64 = 0;
    /// Fragment of the requested records (access control)
    pub const PARTIAL_1: i64 = 1;
    /// Fragment (message size)
    pub const PARTIAL_2: i64 = 2;
    /// Fragment (resource control)
    pub const PARTIAL_3: i64 = 3;
    /// Fragment (some records could not be returned)
    pub const PARTIAL_4: i64 = 4;
    /// No records returned, diagnostic instead
    pub const FAILURE: i64 = 5;
}

/// Credentials carried in `idAuthentication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// Single opaque string
    Open(String),
    /// Separate group, user and password
    IdPass {
        /// Group id
        group: Option<String>,
        /// User id
        user: Option<String>,
        /// Password
        password: Option<String>,
    },
    /// Explicitly anonymous
    Anonymous,
}

/// Client Init request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    /// Echoed back by the target
    pub reference_id: Option<Vec<u8>>,
    /// Versions offered, bit 0 = version 1
    pub protocol_version: BitString,
    /// Services requested
    pub options: BitString,
    /// Largest message the client wants to receive
    pub preferred_message_size: i64,
    /// Largest single record the client accepts
    pub exceptional_record_size: i64,
    /// Credentials
    pub authentication: Option<Authentication>,
    /// Implementation identifier
    pub implementation_id: Option<String>,
    /// Implementation name
    pub implementation_name: Option<String>,
    /// Implementation version
    pub implementation_version: Option<String>,
}

/// Target Init response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    /// Copied from the request
    pub reference_id: Option<Vec<u8>>,
    /// Versions the target agrees to
    pub protocol_version: BitString,
    /// Services granted
    pub options: BitString,
    /// Agreed message size
    pub preferred_message_size: i64,
    /// Agreed record size
    pub exceptional_record_size: i64,
    /// Whether the target accepts the association
    pub result: bool,
    /// Implementation identifier
    pub implementation_id: Option<String>,
    /// Implementation name
    pub implementation_name: Option<String>,
    /// Implementation version
    pub implementation_version: Option<String>,
}

/// Search request carrying a type-1 query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Echoed back by the target
    pub reference_id: Option<Vec<u8>>,
    /// Return all records if the hit count is at most this
    pub small_set_upper_bound: i64,
    /// Return no records if the hit count is at least this
    pub large_set_lower_bound: i64,
    /// Records to return for a medium-sized set
    pub medium_set_present_number: i64,
    /// Replace an existing result set of the same name
    pub replace_indicator: bool,
    /// Client-chosen result set name
    pub result_set_name: String,
    /// Databases to search
    pub database_names: Vec<String>,
    /// Syntax for any piggybacked records
    pub preferred_record_syntax: Option<Oid>,
    /// The query
    pub query: RpnQuery,
}

/// Search response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Copied from the request
    pub reference_id: Option<Vec<u8>>,
    /// Hits in the result set
    pub result_count: i64,
    /// Records piggybacked on this response
    pub number_of_records_returned: i64,
    /// Ordinal of the next record to present
    pub next_result_set_position: i64,
    /// Whether the search succeeded
    pub search_status: bool,
    /// Result set state when `search_status` is false
    pub result_set_status: Option<i64>,
    /// Present status of piggybacked records
    pub present_status: Option<i64>,
    /// Piggybacked records or diagnostics
    pub records: Option<Records>,
}

/// Present request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRequest {
    /// Echoed back by the target
    pub reference_id: Option<Vec<u8>>,
    /// Result set to read from
    pub result_set_id: String,
    /// First ordinal, 1-based
    pub start_point: i64,
    /// Number of records wanted
    pub number_requested: i64,
    /// Generic element set name, e.g. "F" for full records
    pub element_set_name: Option<String>,
    /// Desired record syntax
    pub preferred_record_syntax: Option<Oid>,
}

/// Present response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentResponse {
    /// Copied from the request
    pub reference_id: Option<Vec<u8>>,
    /// Records in this response
    pub number_of_records_returned: i64,
    /// Ordinal of the next record to present
    pub next_result_set_position: i64,
    /// See [`present_status`]
    pub present_status: i64,
    /// Records or diagnostics
    pub records: Option<Records>,
}

/// Reasons carried by a Close APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal termination
    Finished,
    /// Peer is shutting down
    Shutdown,
    /// System problem
    SystemProblem,
    /// Cost limit reached
    CostLimit,
    /// Resources exhausted
    Resources,
    /// Security violation
    SecurityViolation,
    /// Protocol error
    ProtocolError,
    /// Idle too long
    LackOfActivity,
    /// Response to a peer abort
    PeerAbort,
    /// Anything else
    Unspecified,
}

impl CloseReason {
    /// Wire value.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            CloseReason::Finished => 0,
            CloseReason::Shutdown => 1,
            CloseReason::SystemProblem => 2,
            CloseReason::CostLimit => 3,
            CloseReason::Resources => 4,
            CloseReason::SecurityViolation => 5,
            CloseReason::ProtocolError => 6,
            CloseReason::LackOfActivity => 7,
            CloseReason::PeerAbort => 8,
            CloseReason::Unspecified => 9,
        }
    }

    /// Reason for a wire value; unknown values map to `Unspecified`.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => CloseReason::Finished,
            1 => CloseReason::Shutdown,
            2 => CloseReason::SystemProblem,
            3 => CloseReason::CostLimit,
            4 => CloseReason::Resources,
            5 => CloseReason::SecurityViolation,
            6 => CloseReason::ProtocolError,
            7 => CloseReason::LackOfActivity,
            8 => CloseReason::PeerAbort,
            _ => CloseReason::Unspecified,
        }
    }
}

/// Close APDU, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    /// Echoed reference
    pub reference_id: Option<Vec<u8>>,
    /// Why the association ends
    pub close_reason: CloseReason,
    /// Free text
    pub diagnostic_information: Option<String>,
}

/// A `DefaultDiagFormat` diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Diagnostic set (normally Bib-1)
    pub diagnostic_set: Oid,
    /// Condition number within the set
    pub condition: i64,
    /// Additional information
    pub addinfo: String,
}

impl Diagnostic {
    /// A Bib-1 diagnostic.
    pub fn bib1(condition: i64, addinfo: impl Into<String>) -> Self {
        Diagnostic {
            diagnostic_set: Oid::new(BIB1_DIAGNOSTIC_SET),
            condition,
            addinfo: addinfo.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.addinfo.is_empty() {
            write!(f, "diagnostic {}", self.condition)
        } else {
            write!(f, "diagnostic {}: {}", self.condition, self.addinfo)
        }
    }
}

/// An EXTERNAL-wrapped retrieval record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRecord {
    /// Record syntax (direct reference)
    pub syntax: Option<Oid>,
    /// Record octets
    pub data: Vec<u8>,
}

impl ExternalRecord {
    /// A MARC21 record.
    #[must_use]
    pub fn marc21(data: Vec<u8>) -> Self {
        ExternalRecord {
            syntax: Some(Oid::new(MARC21_SYNTAX)),
            data,
        }
    }
}

/// Content of a `NamePlusRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordContent {
    /// The record itself
    Retrieval(ExternalRecord),
    /// Why this record could not be returned
    SurrogateDiagnostic(Diagnostic),
}

/// One entry of `responseRecords`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePlusRecord {
    /// Database the record came from
    pub database_name: Option<String>,
    /// Record or diagnostic
    pub record: RecordContent,
}

/// The `records` choice of Search and Present responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    /// Records, possibly with per-record diagnostics
    ResponseRecords(Vec<NamePlusRecord>),
    /// A single diagnostic in place of all records
    NonSurrogateDiagnostic(Diagnostic),
    /// Several diagnostics in place of all records
    MultipleDiagnostics(Vec<Diagnostic>),
}

impl Records {
    /// First diagnostic, if the records are diagnostics only.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Records::ResponseRecords(_) => None,
            Records::NonSurrogateDiagnostic(diag) => Some(diag),
            Records::MultipleDiagnostics(diags) => diags.first(),
        }
    }
}

/// A Z39.50 protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Init request
    InitRequest(InitRequest),
    /// Init response
    InitResponse(InitResponse),
    /// Search request
    SearchRequest(SearchRequest),
    /// Search response
    SearchResponse(SearchResponse),
    /// Present request
    PresentRequest(PresentRequest),
    /// Present response
    PresentResponse(PresentResponse),
    /// Close
    Close(Close),
}

impl Apdu {
    /// Short name for log lines.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Apdu::InitRequest(_) => "InitRequest",
            Apdu::InitResponse(_) => "InitResponse",
            Apdu::SearchRequest(_) => "SearchRequest",
            Apdu::SearchResponse(_) => "SearchResponse",
            Apdu::PresentRequest(_) => "PresentRequest",
            Apdu::PresentResponse(_) => "PresentResponse",
            Apdu::Close(_) => "Close",
        }
    }
}

fn ctx(number: u32) -> Tag {
    Tag::context(number)
}

fn ctx_cons(number: u32) -> Tag {
    Tag::context_constructed(number)
}

fn sequence() -> Tag {
    Tag::universal_constructed(universal::SEQUENCE)
}

/// Encode one APDU.
#[must_use]
pub fn encode(apdu: &Apdu) -> Vec<u8> {
    let mut w = BerWriter::new();
    match apdu {
        Apdu::InitRequest(req) => w.constructed(ctx_cons(INIT_REQUEST), |w| {
            write_reference_id(w, req.reference_id.as_deref());
            w.bit_string(ctx(3), &req.protocol_version);
            w.bit_string(ctx(4), &req.options);
            w.integer(ctx(5), req.preferred_message_size);
            w.integer(ctx(6), req.exceptional_record_size);
            if let Some(auth) = &req.authentication {
                w.constructed(ctx_cons(7), |w| write_authentication(w, auth));
            }
            write_implementation(
                w,
                req.implementation_id.as_deref(),
                req.implementation_name.as_deref(),
                req.implementation_version.as_deref(),
            );
        }),
        Apdu::InitResponse(resp) => w.constructed(ctx_cons(INIT_RESPONSE), |w| {
            write_reference_id(w, resp.reference_id.as_deref());
            w.bit_string(ctx(3), &resp.protocol_version);
            w.bit_string(ctx(4), &resp.options);
            w.integer(ctx(5), resp.preferred_message_size);
            w.integer(ctx(6), resp.exceptional_record_size);
            w.boolean(ctx(12), resp.result);
            write_implementation(
                w,
                resp.implementation_id.as_deref(),
                resp.implementation_name.as_deref(),
                resp.implementation_version.as_deref(),
            );
        }),
        Apdu::SearchRequest(req) => w.constructed(ctx_cons(SEARCH_REQUEST), |w| {
            write_reference_id(w, req.reference_id.as_deref());
            w.integer(ctx(13), req.small_set_upper_bound);
            w.integer(ctx(14), req.large_set_lower_bound);
            w.integer(ctx(15), req.medium_set_present_number);
            w.boolean(ctx(16), req.replace_indicator);
            w.string(ctx(17), &req.result_set_name);
            w.constructed(ctx_cons(18), |w| {
                for name in &req.database_names {
                    w.string(ctx(105), name);
                }
            });
            if let Some(syntax) = &req.preferred_record_syntax {
                w.oid(ctx(104), syntax);
            }
            w.constructed(ctx_cons(21), |w| {
                w.constructed(ctx_cons(1), |w| {
                    w.oid(
                        Tag::universal(universal::OBJECT_IDENTIFIER),
                        &req.query.attribute_set,
                    );
                    write_rpn(w, &req.query.root);
                });
            });
        }),
        Apdu::SearchResponse(resp) => w.constructed(ctx_cons(SEARCH_RESPONSE), |w| {
            write_reference_id(w, resp.reference_id.as_deref());
            w.integer(ctx(23), resp.result_count);
            w.integer(ctx(24), resp.number_of_records_returned);
            w.integer(ctx(25), resp.next_result_set_position);
            w.boolean(ctx(22), resp.search_status);
            if let Some(status) = resp.result_set_status {
                w.integer(ctx(26), status);
            }
            if let Some(status) = resp.present_status {
                w.integer(ctx(27), status);
            }
            if let Some(records) = &resp.records {
                write_records(w, records);
            }
        }),
        Apdu::PresentRequest(req) => w.constructed(ctx_cons(PRESENT_REQUEST), |w| {
            write_reference_id(w, req.reference_id.as_deref());
            w.string(ctx(31), &req.result_set_id);
            w.integer(ctx(30), req.start_point);
            w.integer(ctx(29), req.number_requested);
            if let Some(name) = &req.element_set_name {
                w.constructed(ctx_cons(19), |w| w.string(ctx(0), name));
            }
            if let Some(syntax) = &req.preferred_record_syntax {
                w.oid(ctx(104), syntax);
            }
        }),
        Apdu::PresentResponse(resp) => w.constructed(ctx_cons(PRESENT_RESPONSE), |w| {
            write_reference_id(w, resp.reference_id.as_deref());
            w.integer(ctx(24), resp.number_of_records_returned);
            w.integer(ctx(25), resp.next_result_set_position);
            w.integer(ctx(27), resp.present_status);
            if let Some(records) = &resp.records {
                write_records(w, records);
            }
        }),
        Apdu::Close(close) => w.constructed(ctx_cons(CLOSE), |w| {
            write_reference_id(w, close.reference_id.as_deref());
            w.integer(ctx(211), close.close_reason.code());
            if let Some(info) = &close.diagnostic_information {
                w.string(ctx(3), info);
            }
        }),
    }
    w.into_vec()
}

fn write_reference_id(w: &mut BerWriter, reference_id: Option<&[u8]>) {
    if let Some(id) = reference_id {
        w.primitive(ctx(2), id);
    }
}

fn write_implementation(
    w: &mut BerWriter,
    id: Option<&str>,
    name: Option<&str>,
    version: Option<&str>,
) {
    for (tag, value) in [(110, id), (111, name), (112, version)] {
        if let Some(value) = value {
            w.string(ctx(tag), value);
        }
    }
}

fn write_authentication(w: &mut BerWriter, auth: &Authentication) {
    match auth {
        Authentication::Open(text) => {
            w.string(Tag::universal(universal::VISIBLE_STRING), text);
        },
        Authentication::IdPass {
            group,
            user,
            password,
        } => w.constructed(sequence(), |w| {
            for (tag, value) in [(0, group), (1, user), (2, password)] {
                if let Some(value) = value {
                    w.string(ctx(tag), value);
                }
            }
        }),
        Authentication::Anonymous => w.null(Tag::universal(universal::NULL)),
    }
}

fn write_rpn(w: &mut BerWriter, node: &RpnNode) {
    match node {
        RpnNode::Operand { attributes, term } => w.constructed(ctx_cons(0), |w| {
            w.constructed(ctx_cons(102), |w| {
                w.constructed(ctx_cons(44), |w| {
                    for attr in attributes {
                        w.constructed(sequence(), |w| {
                            w.integer(ctx(120), attr.attribute_type);
                            w.integer(ctx(121), attr.value);
                        });
                    }
                });
                w.primitive(ctx(45), term.as_bytes());
            });
        }),
        RpnNode::Operation {
            left,
            right,
            operator,
        } => w.constructed(ctx_cons(1), |w| {
            write_rpn(w, left);
            write_rpn(w, right);
            let op = match operator {
                BooleanOp::And => 0,
                BooleanOp::Or => 1,
                BooleanOp::AndNot => 2,
            };
            w.constructed(ctx_cons(46), |w| w.null(ctx(op)));
        }),
    }
}

fn write_records(w: &mut BerWriter, records: &Records) {
    match records {
        Records::ResponseRecords(entries) => w.constructed(ctx_cons(28), |w| {
            for entry in entries {
                w.constructed(sequence(), |w| {
                    if let Some(name) = &entry.database_name {
                        w.string(ctx(0), name);
                    }
                    w.constructed(ctx_cons(1), |w| match &entry.record {
                        RecordContent::Retrieval(external) => {
                            w.constructed(ctx_cons(1), |w| write_external(w, external));
                        },
                        RecordContent::SurrogateDiagnostic(diag) => {
                            w.constructed(ctx_cons(2), |w| write_diagnostic(w, sequence(), diag));
                        },
                    });
                });
            }
        }),
        Records::NonSurrogateDiagnostic(diag) => write_diagnostic(w, ctx_cons(130), diag),
        Records::MultipleDiagnostics(diags) => w.constructed(ctx_cons(205), |w| {
            for diag in diags {
                write_diagnostic(w, sequence(), diag);
            }
        }),
    }
}

fn write_external(w: &mut BerWriter, external: &ExternalRecord) {
    w.constructed(Tag::universal_constructed(universal::EXTERNAL), |w| {
        if let Some(syntax) = &external.syntax {
            w.oid(Tag::universal(universal::OBJECT_IDENTIFIER), syntax);
        }
        w.primitive(ctx(1), &external.data);
    });
}

fn write_diagnostic(w: &mut BerWriter, tag: Tag, diag: &Diagnostic) {
    w.constructed(tag, |w| {
        w.oid(
            Tag::universal(universal::OBJECT_IDENTIFIER),
            &diag.diagnostic_set,
        );
        w.integer(Tag::universal(universal::INTEGER), diag.condition);
        w.string(Tag::universal(universal::VISIBLE_STRING), &diag.addinfo);
    });
}

/// Decode one APDU from the front of `buf`.
///
/// Returns the APDU and the number of bytes it occupied; trailing bytes are
/// left for the next call.
///
/// # Errors
///
/// [`CodecError::Incomplete`] if `buf` holds less than one whole APDU (nothing
/// is consumed), [`CodecError::Malformed`] for anything undecodable.
pub fn decode(buf: &[u8]) -> CodecResult<(Apdu, usize)> {
    let (tlv, consumed) = parse_tlv(buf)?;
    if tlv.tag.class != TagClass::Context {
        return Err(CodecError::Malformed(format!(
            "expected context-class APDU tag, got {}",
            tlv.tag
        )));
    }
    let apdu = decode_body(&tlv).map_err(|err| match err {
        // The outer length was satisfied, so a short inner value is a lie.
        CodecError::Incomplete { .. } => {
            CodecError::Malformed("inner value overruns its container".to_string())
        },
        other => other,
    })?;
    Ok((apdu, consumed))
}

fn decode_body(tlv: &Tlv<'_>) -> CodecResult<Apdu> {
    let fields = tlv.children()?;
    Ok(match tlv.tag.number {
        INIT_REQUEST => Apdu::InitRequest(decode_init_request(fields)?),
        INIT_RESPONSE => Apdu::InitResponse(decode_init_response(fields)?),
        SEARCH_REQUEST => Apdu::SearchRequest(decode_search_request(fields)?),
        SEARCH_RESPONSE => Apdu::SearchResponse(decode_search_response(fields)?),
        PRESENT_REQUEST => Apdu::PresentRequest(decode_present_request(fields)?),
        PRESENT_RESPONSE => Apdu::PresentResponse(decode_present_response(fields)?),
        CLOSE => Apdu::Close(decode_close(fields)?),
        other => {
            return Err(CodecError::Malformed(format!("unknown APDU tag [{other}]")));
        },
    })
}

// Yields the context-class fields of an APDU; other classes are skipped.
fn context_fields<'a>(
    mut reader: BerReader<'a>,
) -> impl Iterator<Item = CodecResult<(u32, Tlv<'a>)>> {
    std::iter::from_fn(move || loop {
        match reader.next_tlv() {
            Ok(Some(tlv)) if tlv.tag.class == TagClass::Context => {
                return Some(Ok((tlv.tag.number, tlv)));
            },
            Ok(Some(_)) => continue,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        }
    })
}

fn decode_init_request(fields: BerReader<'_>) -> CodecResult<InitRequest> {
    let mut req = InitRequest {
        reference_id: None,
        protocol_version: BitString::default(),
        options: BitString::default(),
        preferred_message_size: 0,
        exceptional_record_size: 0,
        authentication: None,
        implementation_id: None,
        implementation_name: None,
        implementation_version: None,
    };
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => req.reference_id = Some(tlv.primitive()?.to_vec()),
            3 => req.protocol_version = tlv.bit_string()?,
            4 => req.options = tlv.bit_string()?,
            5 => req.preferred_message_size = tlv.integer()?,
            6 => req.exceptional_record_size = tlv.integer()?,
            7 => req.authentication = decode_authentication(&tlv)?,
            110 => req.implementation_id = Some(tlv.string()?),
            111 => req.implementation_name = Some(tlv.string()?),
            112 => req.implementation_version = Some(tlv.string()?),
            _ => {},
        }
    }
    Ok(req)
}

fn decode_authentication(tlv: &Tlv<'_>) -> CodecResult<Option<Authentication>> {
    let Some(inner) = tlv.children()?.next_tlv()? else {
        return Ok(None);
    };
    if inner.tag.is(TagClass::Universal, universal::VISIBLE_STRING)
        || inner.tag.is(TagClass::Universal, universal::GENERAL_STRING)
    {
        return Ok(Some(Authentication::Open(inner.string()?)));
    }
    if inner.tag.is(TagClass::Universal, universal::NULL) {
        return Ok(Some(Authentication::Anonymous));
    }
    if inner.tag.is(TagClass::Universal, universal::SEQUENCE) {
        let (mut group, mut user, mut password) = (None, None, None);
        for field in context_fields(inner.children()?) {
            let (number, tlv) = field?;
            match number {
                0 => group = Some(tlv.string()?),
                1 => user = Some(tlv.string()?),
                2 => password = Some(tlv.string()?),
                _ => {},
            }
        }
        return Ok(Some(Authentication::IdPass {
            group,
            user,
            password,
        }));
    }
    Ok(None)
}

fn decode_init_response(fields: BerReader<'_>) -> CodecResult<InitResponse> {
    let mut resp = InitResponse {
        reference_id: None,
        protocol_version: BitString::default(),
        options: BitString::default(),
        preferred_message_size: 0,
        exceptional_record_size: 0,
        result: false,
        implementation_id: None,
        implementation_name: None,
        implementation_version: None,
    };
    let mut saw_result = false;
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => resp.reference_id = Some(tlv.primitive()?.to_vec()),
            3 => resp.protocol_version = tlv.bit_string()?,
            4 => resp.options = tlv.bit_string()?,
            5 => resp.preferred_message_size = tlv.integer()?,
            6 => resp.exceptional_record_size = tlv.integer()?,
            12 => {
                resp.result = tlv.boolean()?;
                saw_result = true;
            },
            110 => resp.implementation_id = Some(tlv.string()?),
            111 => resp.implementation_name = Some(tlv.string()?),
            112 => resp.implementation_version = Some(tlv.string()?),
            _ => {},
        }
    }
    if !saw_result {
        return Err(CodecError::Malformed(
            "InitResponse without result".to_string(),
        ));
    }
    Ok(resp)
}

fn decode_search_request(fields: BerReader<'_>) -> CodecResult<SearchRequest> {
    let mut reference_id = None;
    let mut small_set_upper_bound = 0;
    let mut large_set_lower_bound = 1;
    let mut medium_set_present_number = 0;
    let mut replace_indicator = true;
    let mut result_set_name = String::new();
    let mut database_names = Vec::new();
    let mut preferred_record_syntax = None;
    let mut query = None;

    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => reference_id = Some(tlv.primitive()?.to_vec()),
            13 => small_set_upper_bound = tlv.integer()?,
            14 => large_set_lower_bound = tlv.integer()?,
            15 => medium_set_present_number = tlv.integer()?,
            16 => replace_indicator = tlv.boolean()?,
            17 => result_set_name = tlv.string()?,
            18 => {
                let mut names = tlv.children()?;
                while let Some(name) = names.next_tlv()? {
                    database_names.push(name.string()?);
                }
            },
            104 => preferred_record_syntax = Some(tlv.oid()?),
            21 => query = Some(decode_query(&tlv)?),
            _ => {},
        }
    }

    let query =
        query.ok_or_else(|| CodecError::Malformed("SearchRequest without query".to_string()))?;
    Ok(SearchRequest {
        reference_id,
        small_set_upper_bound,
        large_set_lower_bound,
        medium_set_present_number,
        replace_indicator,
        result_set_name,
        database_names,
        preferred_record_syntax,
        query,
    })
}

fn decode_query(tlv: &Tlv<'_>) -> CodecResult<RpnQuery> {
    let rpn = tlv
        .children()?
        .next_tlv()?
        .ok_or_else(|| CodecError::Malformed("empty query".to_string()))?;
    // type-1 [1] and type-101 [101] share the RPNQuery structure
    if !(rpn.tag.is_context(1) || rpn.tag.is_context(101)) {
        return Err(CodecError::Malformed(format!(
            "unsupported query type {}",
            rpn.tag
        )));
    }
    let mut parts = rpn.children()?;
    let attribute_set = parts.read_tlv()?.oid()?;
    let root = decode_rpn(&parts.read_tlv()?, 0)?;
    Ok(RpnQuery {
        attribute_set,
        root,
    })
}

fn decode_rpn(tlv: &Tlv<'_>, depth: usize) -> CodecResult<RpnNode> {
    if depth > MAX_QUERY_DEPTH {
        return Err(CodecError::Malformed("query nested too deeply".to_string()));
    }
    if tlv.tag.is_context(0) {
        let operand = tlv.children()?.read_tlv()?;
        if !operand.tag.is_context(102) {
            return Err(CodecError::Malformed(format!(
                "unsupported operand {}",
                operand.tag
            )));
        }
        let mut attributes = Vec::new();
        let mut term = None;
        for field in context_fields(operand.children()?) {
            let (number, part) = field?;
            match number {
                44 => {
                    let mut list = part.children()?;
                    while let Some(element) = list.next_tlv()? {
                        attributes.push(decode_attribute(&element)?);
                    }
                },
                45 => term = Some(part.string()?),
                _ => {
                    return Err(CodecError::Malformed(format!(
                        "unsupported term type {}",
                        part.tag
                    )));
                },
            }
        }
        let term = term.ok_or_else(|| CodecError::Malformed("operand without term".to_string()))?;
        return Ok(RpnNode::Operand { attributes, term });
    }

    if tlv.tag.is_context(1) {
        let mut parts = tlv.children()?;
        let left = decode_rpn(&parts.read_tlv()?, depth + 1)?;
        let right = decode_rpn(&parts.read_tlv()?, depth + 1)?;
        let op = parts.read_tlv()?;
        if !op.tag.is_context(46) {
            return Err(CodecError::Malformed(format!(
                "expected operator, got {}",
                op.tag
            )));
        }
        let choice = op.children()?.read_tlv()?;
        let operator = match choice.tag.number {
            0 => BooleanOp::And,
            1 => BooleanOp::Or,
            2 => BooleanOp::AndNot,
            other => {
                return Err(CodecError::Malformed(format!(
                    "unsupported operator [{other}]"
                )));
            },
        };
        return Ok(RpnNode::Operation {
            left: Box::new(left),
            right: Box::new(right),
            operator,
        });
    }

    Err(CodecError::Malformed(format!(
        "unexpected RPN structure {}",
        tlv.tag
    )))
}

fn decode_attribute(tlv: &Tlv<'_>) -> CodecResult<AttributeElement> {
    let mut attribute_type = None;
    let mut value = None;
    for field in context_fields(tlv.children()?) {
        let (number, part) = field?;
        match number {
            120 => attribute_type = Some(part.integer()?),
            121 => value = Some(part.integer()?),
            _ => {},
        }
    }
    match (attribute_type, value) {
        (Some(attribute_type), Some(value)) => Ok(AttributeElement {
            attribute_type,
            value,
        }),
        _ => Err(CodecError::Malformed(
            "attribute element needs numeric type and value".to_string(),
        )),
    }
}

fn decode_search_response(fields: BerReader<'_>) -> CodecResult<SearchResponse> {
    let mut resp = SearchResponse {
        reference_id: None,
        result_count: 0,
        number_of_records_returned: 0,
        next_result_set_position: 0,
        search_status: false,
        result_set_status: None,
        present_status: None,
        records: None,
    };
    let mut saw_status = false;
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => resp.reference_id = Some(tlv.primitive()?.to_vec()),
            23 => resp.result_count = tlv.integer()?,
            24 => resp.number_of_records_returned = tlv.integer()?,
            25 => resp.next_result_set_position = tlv.integer()?,
            22 => {
                resp.search_status = tlv.boolean()?;
                saw_status = true;
            },
            26 => resp.result_set_status = Some(tlv.integer()?),
            27 => resp.present_status = Some(tlv.integer()?),
            28 | 130 | 205 => resp.records = Some(decode_records(number, &tlv)?),
            _ => {},
        }
    }
    if !saw_status {
        return Err(CodecError::Malformed(
            "SearchResponse without searchStatus".to_string(),
        ));
    }
    Ok(resp)
}

fn decode_present_request(fields: BerReader<'_>) -> CodecResult<PresentRequest> {
    let mut req = PresentRequest {
        reference_id: None,
        result_set_id: String::new(),
        start_point: 0,
        number_requested: 0,
        element_set_name: None,
        preferred_record_syntax: None,
    };
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => req.reference_id = Some(tlv.primitive()?.to_vec()),
            31 => req.result_set_id = tlv.string()?,
            30 => req.start_point = tlv.integer()?,
            29 => req.number_requested = tlv.integer()?,
            19 => {
                if let Some(name) = tlv.children()?.next_tlv()? {
                    if name.tag.is_context(0) {
                        req.element_set_name = Some(name.string()?);
                    }
                }
            },
            104 => req.preferred_record_syntax = Some(tlv.oid()?),
            _ => {},
        }
    }
    Ok(req)
}

fn decode_present_response(fields: BerReader<'_>) -> CodecResult<PresentResponse> {
    let mut resp = PresentResponse {
        reference_id: None,
        number_of_records_returned: 0,
        next_result_set_position: 0,
        present_status: present_status::SUCCESS,
        records: None,
    };
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => resp.reference_id = Some(tlv.primitive()?.to_vec()),
            24 => resp.number_of_records_returned = tlv.integer()?,
            25 => resp.next_result_set_position = tlv.integer()?,
            27 => resp.present_status = tlv.integer()?,
            28 | 130 | 205 => resp.records = Some(decode_records(number, &tlv)?),
            _ => {},
        }
    }
    Ok(resp)
}

fn decode_close(fields: BerReader<'_>) -> CodecResult<Close> {
    let mut close = Close {
        reference_id: None,
        close_reason: CloseReason::Unspecified,
        diagnostic_information: None,
    };
    for field in context_fields(fields) {
        let (number, tlv) = field?;
        match number {
            2 => close.reference_id = Some(tlv.primitive()?.to_vec()),
            211 => close.close_reason = CloseReason::from_code(tlv.integer()?),
            3 => close.diagnostic_information = Some(tlv.string()?),
            _ => {},
        }
    }
    Ok(close)
}

fn decode_records(number: u32, tlv: &Tlv<'_>) -> CodecResult<Records> {
    match number {
        28 => {
            let mut entries = Vec::new();
            let mut list = tlv.children()?;
            while let Some(entry) = list.next_tlv()? {
                entries.push(decode_name_plus_record(&entry)?);
            }
            Ok(Records::ResponseRecords(entries))
        },
        130 => Ok(Records::NonSurrogateDiagnostic(decode_diagnostic(tlv)?)),
        _ => {
            let mut diags = Vec::new();
            let mut list = tlv.children()?;
            while let Some(diag) = list.next_tlv()? {
                diags.push(decode_diagnostic(&diag)?);
            }
            Ok(Records::MultipleDiagnostics(diags))
        },
    }
}

fn decode_name_plus_record(tlv: &Tlv<'_>) -> CodecResult<NamePlusRecord> {
    let mut database_name = None;
    let mut record = None;
    for field in context_fields(tlv.children()?) {
        let (number, part) = field?;
        match number {
            0 => database_name = Some(part.string()?),
            1 => {
                let choice = part.children()?.read_tlv()?;
                let inner = choice.children()?.read_tlv()?;
                record = Some(match choice.tag.number {
                    1 if choice.tag.class == TagClass::Context => {
                        RecordContent::Retrieval(decode_external(&inner)?)
                    },
                    2 if choice.tag.class == TagClass::Context => {
                        RecordContent::SurrogateDiagnostic(decode_diagnostic(&inner)?)
                    },
                    _ => {
                        return Err(CodecError::Malformed(format!(
                            "unsupported record choice {}",
                            choice.tag
                        )));
                    },
                });
            },
            _ => {},
        }
    }
    let record =
        record.ok_or_else(|| CodecError::Malformed("NamePlusRecord without record".to_string()))?;
    Ok(NamePlusRecord {
        database_name,
        record,
    })
}

fn decode_external(tlv: &Tlv<'_>) -> CodecResult<ExternalRecord> {
    if !tlv.tag.is(TagClass::Universal, universal::EXTERNAL) {
        return Err(CodecError::Malformed(format!(
            "expected EXTERNAL, got {}",
            tlv.tag
        )));
    }
    let mut syntax = None;
    let mut data = None;
    let mut parts = tlv.children()?;
    while let Some(part) = parts.next_tlv()? {
        if part.tag.is(TagClass::Universal, universal::OBJECT_IDENTIFIER) {
            syntax = Some(part.oid()?);
        } else if part.tag.is_context(1) {
            data = Some(part.primitive()?.to_vec());
        } else if part.tag.is_context(0) {
            // single-ASN1-type: keep the embedded value's raw encoding
            data = Some(part.contents.to_vec());
        }
    }
    let data = data.ok_or_else(|| CodecError::Malformed("EXTERNAL without data".to_string()))?;
    Ok(ExternalRecord { syntax, data })
}

fn decode_diagnostic(tlv: &Tlv<'_>) -> CodecResult<Diagnostic> {
    let mut diagnostic_set = None;
    let mut condition = None;
    let mut addinfo = String::new();
    let mut parts = tlv.children()?;
    while let Some(part) = parts.next_tlv()? {
        if part.tag.class != TagClass::Universal {
            continue;
        }
        match part.tag.number {
            universal::OBJECT_IDENTIFIER => diagnostic_set = Some(part.oid()?),
            universal::INTEGER => condition = Some(part.integer()?),
            universal::VISIBLE_STRING | universal::GENERAL_STRING => addinfo = part.string()?,
            _ => {},
        }
    }
    let condition =
        condition.ok_or_else(|| CodecError::Malformed("diagnostic without condition".to_string()))?;
    Ok(Diagnostic {
        diagnostic_set: diagnostic_set.unwrap_or_else(|| Oid::new(BIB1_DIAGNOSTIC_SET)),
        condition,
        addinfo,
    })
}
