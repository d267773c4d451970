//! A small Z39.50 responder over an in-memory catalog.
//!
//! [`CatalogServer`] answers Init, Search, Present and Close for the MARC
//! records held in a [`Catalog`]. Each connection gets its own thread and its
//! own named result sets. Terms match case-insensitively as substrings of the
//! fields selected by the Bib-1 use attribute.
//!
//! It exists so sessions and federated searches can be exercised end to end
//! without a real catalog.

use super::apdu::{
    self, options, present_status, Apdu, Close, CloseReason, Diagnostic, ExternalRecord,
    InitResponse, NamePlusRecord, PresentRequest, PresentResponse, RecordContent, Records,
    SearchRequest, SearchResponse,
};
use super::ber::{BitString, CodecError};
use super::{diagnostics, MARC21_SYNTAX, SUPPORTED_VERSIONS};
use crate::error::MarcError;
use crate::query::{BooleanOp, RpnNode, UseAttribute, USE_ATTRIBUTE_TYPE};
use crate::reader::parse;
use crate::record::Record;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct StoredRecord {
    record: Record,
    bytes: Vec<u8>,
}

/// Databases of MARC records, in insertion order.
#[derive(Debug, Default)]
pub struct Catalog {
    databases: IndexMap<String, Vec<StoredRecord>>,
    credentials: Option<(String, String)>,
}

impl Catalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an ISO 2709 record to `database`, creating the database if needed.
    ///
    /// # Errors
    ///
    /// Returns the parse error if `bytes` is not a valid record.
    pub fn add_record(&mut self, database: &str, bytes: Vec<u8>) -> Result<(), MarcError> {
        let record = parse(&bytes)?;
        self.databases
            .entry(database.to_string())
            .or_default()
            .push(StoredRecord { record, bytes });
        Ok(())
    }

    /// Create an empty database.
    pub fn add_database(&mut self, database: &str) {
        self.databases.entry(database.to_string()).or_default();
    }

    /// Refuse Init unless the client presents this user and password.
    #[must_use]
    pub fn require_login(mut self, user: &str, password: &str) -> Self {
        self.credentials = Some((user.to_string(), password.to_string()));
        self
    }

    /// Records in `database`.
    #[must_use]
    pub fn record_count(&self, database: &str) -> usize {
        self.databases.get(database).map_or(0, Vec::len)
    }

    fn search(&self, database: &str, node: &RpnNode) -> Result<BTreeSet<usize>, Diagnostic> {
        let records = self.databases.get(database).ok_or_else(|| {
            Diagnostic::bib1(diagnostics::DATABASE_UNAVAILABLE, database.to_string())
        })?;
        evaluate(records, node)
    }
}

fn evaluate(records: &[StoredRecord], node: &RpnNode) -> Result<BTreeSet<usize>, Diagnostic> {
    match node {
        RpnNode::Operand { attributes, term } => {
            let mut use_attribute = UseAttribute::Any;
            for attr in attributes {
                if attr.attribute_type != USE_ATTRIBUTE_TYPE {
                    continue;
                }
                let code = u32::try_from(attr.value).map_err(|_| {
                    Diagnostic::bib1(
                        diagnostics::UNSUPPORTED_ATTRIBUTE_TYPE,
                        attr.value.to_string(),
                    )
                })?;
                use_attribute = UseAttribute::from_code(code);
            }
            if let UseAttribute::Other(code) = use_attribute {
                // Bib-1 114: unsupported use attribute
                return Err(Diagnostic::bib1(114, code.to_string()));
            }
            let needle = term.to_lowercase();
            Ok(records
                .iter()
                .enumerate()
                .filter(|(_, stored)| {
                    indexed_values(&stored.record, use_attribute)
                        .iter()
                        .any(|value| value.to_lowercase().contains(&needle))
                })
                .map(|(i, _)| i)
                .collect())
        },
        RpnNode::Operation {
            left,
            right,
            operator,
        } => {
            let left = evaluate(records, left)?;
            let right = evaluate(records, right)?;
            Ok(match operator {
                BooleanOp::And => left.intersection(&right).copied().collect(),
                BooleanOp::Or => left.union(&right).copied().collect(),
                BooleanOp::AndNot => left.difference(&right).copied().collect(),
            })
        },
    }
}

fn subfields<'r>(record: &'r Record, tags: &[&str], code: char) -> Vec<&'r str> {
    record
        .fields()
        .filter(|f| tags.contains(&f.tag.as_str()))
        .flat_map(|f| f.subfields_by_code(code))
        .collect()
}

fn indexed_values(record: &Record, attribute: UseAttribute) -> Vec<&str> {
    match attribute {
        UseAttribute::Title => subfields(record, &["245", "246", "240"], 'a'),
        UseAttribute::Author => subfields(record, &["100", "110", "111", "700", "710"], 'a'),
        UseAttribute::Isbn => subfields(record, &["020"], 'a'),
        UseAttribute::Issn => subfields(record, &["022"], 'a'),
        UseAttribute::Subject => subfields(record, &["600", "610", "650", "651"], 'a'),
        UseAttribute::Publisher => subfields(record, &["260", "264"], 'b'),
        UseAttribute::DatePublication => {
            let mut values = subfields(record, &["260", "264"], 'c');
            if !record.year().is_empty() {
                values.push(record.year());
            }
            values
        },
        UseAttribute::LocalNumber => vec![record.id()],
        UseAttribute::Any | UseAttribute::Other(_) => {
            let mut values: Vec<&str> = record
                .fields()
                .flat_map(|f| f.subfields.iter().map(|s| s.value.as_str()))
                .collect();
            values.push(record.id());
            values
        },
    }
}

/// TCP listener serving a [`Catalog`].
#[derive(Debug)]
pub struct CatalogServer {
    listener: TcpListener,
    catalog: Arc<Catalog>,
}

impl CatalogServer {
    /// Bind to `addr`; use port 0 for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub fn bind(addr: impl ToSocketAddrs, catalog: Catalog) -> io::Result<Self> {
        Ok(CatalogServer {
            listener: TcpListener::bind(addr)?,
            catalog: Arc::new(catalog),
        })
    }

    /// Address actually bound.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections on a background thread until the handle shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            for stream in self.listener.incoming() {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let catalog = Arc::clone(&self.catalog);
                        thread::spawn(move || {
                            if let Err(err) = serve_connection(stream, &catalog) {
                                debug!(error = %err, "connection ended with error");
                            }
                        });
                    },
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
        });
        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }
}

/// Running [`CatalogServer`]; stops accepting when shut down or dropped.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address clients should connect to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port clients should connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    /// Connections already open run to completion.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::SeqCst);
            // Wake the blocking accept.
            let _ = TcpStream::connect(self.addr);
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Connection<'a> {
    catalog: &'a Catalog,
    initialized: bool,
    result_sets: HashMap<String, (String, Vec<usize>)>,
}

fn serve_connection(mut stream: TcpStream, catalog: &Catalog) -> io::Result<()> {
    stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    let peer = stream.peer_addr()?;
    let mut conn = Connection {
        catalog,
        initialized: false,
        result_sets: HashMap::new(),
    };
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let request = match apdu::decode(&buffer) {
            Ok((request, used)) => {
                buffer.drain(..used);
                request
            },
            Err(CodecError::Incomplete { .. }) => {
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    return Ok(());
                }
                buffer.extend_from_slice(&chunk[..n]);
                continue;
            },
            Err(err) => {
                warn!(%peer, error = %err, "undecodable request");
                let reply = close(CloseReason::ProtocolError, &err.to_string());
                stream.write_all(&apdu::encode(&reply))?;
                return Ok(());
            },
        };

        debug!(%peer, apdu = request.name(), "request");
        let (reply, done) = conn.respond(request);
        stream.write_all(&apdu::encode(&reply))?;
        if done {
            return Ok(());
        }
    }
}

fn close(reason: CloseReason, info: &str) -> Apdu {
    Apdu::Close(Close {
        reference_id: None,
        close_reason: reason,
        diagnostic_information: (!info.is_empty()).then(|| info.to_string()),
    })
}

impl Connection<'_> {
    // Reply plus whether the association ends.
    fn respond(&mut self, request: Apdu) -> (Apdu, bool) {
        match request {
            Apdu::InitRequest(req) => {
                let versions: Vec<usize> = (0..usize::from(SUPPORTED_VERSIONS))
                    .filter(|&bit| req.protocol_version.is_set(bit))
                    .collect();
                let granted: Vec<usize> = [options::SEARCH, options::PRESENT, options::NAMED_RESULT_SETS]
                    .into_iter()
                    .filter(|&bit| req.options.is_set(bit))
                    .collect();
                let accepted = !versions.is_empty() && self.login_ok(req.authentication.as_ref());
                self.initialized = accepted;
                let reply = Apdu::InitResponse(InitResponse {
                    reference_id: req.reference_id,
                    protocol_version: BitString::with_bits(usize::from(SUPPORTED_VERSIONS), &versions),
                    options: BitString::with_bits(options::NAMED_RESULT_SETS + 1, &granted),
                    preferred_message_size: req.preferred_message_size,
                    exceptional_record_size: req.exceptional_record_size,
                    result: accepted,
                    implementation_id: Some("fedcat-catalog".to_string()),
                    implementation_name: Some("fedcat catalog server".to_string()),
                    implementation_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                });
                (reply, !accepted)
            },
            Apdu::Close(req) => (
                Apdu::Close(Close {
                    reference_id: req.reference_id,
                    close_reason: CloseReason::Finished,
                    diagnostic_information: None,
                }),
                true,
            ),
            _ if !self.initialized => (close(CloseReason::ProtocolError, "Init required"), true),
            Apdu::SearchRequest(req) => (Apdu::SearchResponse(self.search(req)), false),
            Apdu::PresentRequest(req) => (Apdu::PresentResponse(self.present(req)), false),
            other => (
                close(
                    CloseReason::ProtocolError,
                    &format!("unexpected {}", other.name()),
                ),
                true,
            ),
        }
    }

    fn login_ok(&self, auth: Option<&apdu::Authentication>) -> bool {
        let Some((user, password)) = &self.catalog.credentials else {
            return true;
        };
        match auth {
            Some(apdu::Authentication::IdPass {
                user: Some(u),
                password: Some(p),
                ..
            }) => u == user && p == password,
            Some(apdu::Authentication::Open(text)) => *text == format!("{user}/{password}"),
            _ => false,
        }
    }

    fn search(&mut self, req: SearchRequest) -> SearchResponse {
        let failed = |diag: Diagnostic| SearchResponse {
            reference_id: None,
            result_count: 0,
            number_of_records_returned: 0,
            next_result_set_position: 0,
            search_status: false,
            result_set_status: None,
            present_status: None,
            records: Some(Records::NonSurrogateDiagnostic(diag)),
        };

        let [database] = req.database_names.as_slice() else {
            let mut resp = failed(Diagnostic::bib1(
                diagnostics::UNSUPPORTED_SEARCH,
                "exactly one database required",
            ));
            resp.reference_id = req.reference_id;
            return resp;
        };
        if !req.replace_indicator && self.result_sets.contains_key(&req.result_set_name) {
            let mut resp = failed(Diagnostic::bib1(21, "result set exists"));
            resp.reference_id = req.reference_id;
            return resp;
        }

        match self.catalog.search(database, &req.query.root) {
            Ok(hits) => {
                let hits: Vec<usize> = hits.into_iter().collect();
                let count = i64::try_from(hits.len()).unwrap_or(i64::MAX);
                self.result_sets
                    .insert(req.result_set_name, (database.clone(), hits));
                SearchResponse {
                    reference_id: req.reference_id,
                    result_count: count,
                    number_of_records_returned: 0,
                    next_result_set_position: 1,
                    search_status: true,
                    result_set_status: None,
                    present_status: None,
                    records: None,
                }
            },
            Err(diag) => {
                let mut resp = failed(diag);
                resp.reference_id = req.reference_id;
                resp
            },
        }
    }

    fn present(&self, req: PresentRequest) -> PresentResponse {
        let failed = |diag: Diagnostic| PresentResponse {
            reference_id: req.reference_id.clone(),
            number_of_records_returned: 0,
            next_result_set_position: 0,
            present_status: present_status::FAILURE,
            records: Some(Records::NonSurrogateDiagnostic(diag)),
        };

        let Some((database, hits)) = self.result_sets.get(&req.result_set_id) else {
            return failed(Diagnostic::bib1(
                diagnostics::RESULT_SET_NOT_FOUND,
                req.result_set_id.clone(),
            ));
        };
        if let Some(syntax) = &req.preferred_record_syntax {
            if *syntax != *MARC21_SYNTAX {
                return failed(Diagnostic::bib1(
                    diagnostics::UNSUPPORTED_SYNTAX,
                    syntax.to_string(),
                ));
            }
        }
        let start = usize::try_from(req.start_point).unwrap_or(0);
        let requested = usize::try_from(req.number_requested).unwrap_or(0);
        if start == 0 || start > hits.len() {
            return failed(Diagnostic::bib1(
                diagnostics::PRESENT_OUT_OF_RANGE,
                req.start_point.to_string(),
            ));
        }
        let end = (start - 1 + requested).min(hits.len());
        let Some(records) = self.catalog.databases.get(database.as_str()) else {
            return failed(Diagnostic::bib1(
                diagnostics::DATABASE_UNAVAILABLE,
                database.clone(),
            ));
        };
        let entries: Vec<NamePlusRecord> = hits[start - 1..end]
            .iter()
            .map(|&i| NamePlusRecord {
                database_name: Some(database.clone()),
                record: RecordContent::Retrieval(ExternalRecord::marc21(records[i].bytes.clone())),
            })
            .collect();
        let returned = entries.len();

        PresentResponse {
            reference_id: req.reference_id.clone(),
            number_of_records_returned: i64::try_from(returned).unwrap_or(0),
            next_result_set_position: if end >= hits.len() {
                0
            } else {
                i64::try_from(end + 1).unwrap_or(0)
            },
            present_status: present_status::SUCCESS,
            records: Some(Records::ResponseRecords(entries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bibliographic::{build, BibliographicData, CatalogingProfile};
    use crate::query::StructuredQuery;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        for (id, title, author) in [
            ("1", "Dune", "Herbert, Frank"),
            ("2", "Dune Messiah", "Herbert, Frank"),
            ("3", "Foundation", "Asimov, Isaac"),
        ] {
            let data = BibliographicData {
                id: id.to_string(),
                title: title.to_string(),
                author: author.to_string(),
                ..BibliographicData::default()
            };
            catalog
                .add_record("Default", build(CatalogingProfile::Aacr2, &data).unwrap())
                .unwrap();
        }
        catalog
    }

    fn hits(catalog: &Catalog, query: StructuredQuery) -> Vec<usize> {
        let rpn = query.to_rpn().unwrap();
        catalog
            .search("Default", &rpn.root)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_term_matching_by_attribute() {
        let catalog = catalog();
        assert_eq!(hits(&catalog, StructuredQuery::any("dune")), vec![0, 1]);
        assert_eq!(
            hits(&catalog, StructuredQuery::by(UseAttribute::Author, "ASIMOV")),
            vec![2]
        );
        assert_eq!(
            hits(&catalog, StructuredQuery::by(UseAttribute::LocalNumber, "2")),
            vec![1]
        );
    }

    #[test]
    fn test_boolean_operators() {
        let catalog = catalog();
        let dune = || StructuredQuery::by(UseAttribute::Title, "dune");
        let messiah = || StructuredQuery::by(UseAttribute::Title, "messiah");
        assert_eq!(hits(&catalog, dune().and(messiah())), vec![1]);
        assert_eq!(hits(&catalog, dune().and_not(messiah())), vec![0]);
        assert_eq!(
            hits(&catalog, messiah().or(StructuredQuery::any("foundation"))),
            vec![1, 2]
        );
    }

    #[test]
    fn test_unknown_database_and_attribute() {
        let catalog = catalog();
        let rpn = StructuredQuery::any("x").to_rpn().unwrap();
        let err = catalog.search("Nope", &rpn.root).unwrap_err();
        assert_eq!(err.condition, diagnostics::DATABASE_UNAVAILABLE);

        let rpn = StructuredQuery::by(UseAttribute::Other(9999), "x")
            .to_rpn()
            .unwrap();
        assert_eq!(catalog.search("Default", &rpn.root).unwrap_err().condition, 114);
    }

    #[test]
    fn test_requests_before_init_close_association() {
        let catalog = catalog();
        let mut conn = Connection {
            catalog: &catalog,
            initialized: false,
            result_sets: HashMap::new(),
        };
        let (reply, done) = conn.respond(Apdu::PresentRequest(PresentRequest {
            reference_id: None,
            result_set_id: "default".to_string(),
            start_point: 1,
            number_requested: 1,
            element_set_name: None,
            preferred_record_syntax: None,
        }));
        assert!(done);
        assert!(matches!(
            reply,
            Apdu::Close(Close {
                close_reason: CloseReason::ProtocolError,
                ..
            })
        ));
    }

    #[test]
    fn test_present_range_and_result_set_checks() {
        let catalog = catalog();
        let mut conn = Connection {
            catalog: &catalog,
            initialized: true,
            result_sets: HashMap::new(),
        };
        let present = |start: i64, set: &str| PresentRequest {
            reference_id: None,
            result_set_id: set.to_string(),
            start_point: start,
            number_requested: 10,
            element_set_name: None,
            preferred_record_syntax: None,
        };

        let missing = conn.present(present(1, "default"));
        assert_eq!(missing.present_status, present_status::FAILURE);

        let search = conn.search(SearchRequest {
            reference_id: None,
            small_set_upper_bound: 0,
            large_set_lower_bound: 1,
            medium_set_present_number: 0,
            replace_indicator: true,
            result_set_name: "default".to_string(),
            database_names: vec!["Default".to_string()],
            preferred_record_syntax: None,
            query: StructuredQuery::any("dune").to_rpn().unwrap(),
        });
        assert_eq!(search.result_count, 2);

        let page = conn.present(present(2, "default"));
        assert_eq!(page.number_of_records_returned, 1);
        assert_eq!(page.next_result_set_position, 0);

        let out_of_range = conn.present(present(3, "default"));
        assert_eq!(
            out_of_range.records.unwrap().diagnostic().unwrap().condition,
            diagnostics::PRESENT_OUT_OF_RANGE
        );
    }

    #[test]
    fn test_login_required() {
        let catalog = Catalog::new().require_login("u", "p");
        let conn = Connection {
            catalog: &catalog,
            initialized: false,
            result_sets: HashMap::new(),
        };
        assert!(!conn.login_ok(None));
        assert!(conn.login_ok(Some(&apdu::Authentication::IdPass {
            group: None,
            user: Some("u".to_string()),
            password: Some("p".to_string()),
        })));
        assert!(conn.login_ok(Some(&apdu::Authentication::Open("u/p".to_string()))));
    }
}
