//! One Z39.50 client connection.
//!
//! A [`Session`] walks `Closed → Connected → Initialized → SearchActive →
//! PresentActive` and refuses out-of-order calls before touching the network.
//! Every exchange is bounded by the configured timeout; a timeout, transport
//! failure or undecodable message closes the session for good.
//!
//! # Examples
//!
//! ```no_run
//! use fedcat::query::StructuredQuery;
//! use fedcat::z3950::{Oid, Session, SessionConfig, MARC21_SYNTAX};
//!
//! let mut session = Session::new("z3950.loc.gov", 7090, SessionConfig::default());
//! session.connect()?;
//! session.init()?;
//! let hits = session.search(&StructuredQuery::any("dune"), "Voyager")?;
//! if hits > 0 {
//!     let records = session.present(1, hits.min(5), &Oid::new(MARC21_SYNTAX))?;
//!     println!("{} records", records.len());
//! }
//! session.close();
//! # Ok::<(), fedcat::z3950::SessionError>(())
//! ```

use super::apdu::{
    self, options, Apdu, Authentication, Close, CloseReason, Diagnostic, InitRequest,
    PresentRequest, RecordContent, Records, SearchRequest,
};
use super::ber::{BitString, CodecError, Oid};
use super::{MARC21_SYNTAX, SUPPORTED_VERSIONS};
use crate::cancel::{CancelToken, Registration};
use crate::config::Credentials;
use crate::query::{QueryError, StructuredQuery};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Result set name used for every search.
pub const DEFAULT_RESULT_SET: &str = "default";

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Closed,
    /// TCP established, Init not yet done
    Connected,
    /// Init accepted
    Initialized,
    /// A result set exists
    SearchActive,
    /// At least one Present done on the current result set
    PresentActive,
}

/// Errors raised by a [`Session`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// TCP connect failed.
    #[error("cannot connect to {address}: {source}")]
    Connection {
        /// `host:port`
        address: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Init was rejected or no protocol version is shared.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// An operation outlived the session timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The call is not legal in the current state, or its arguments fall
    /// outside the current result set.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The query failed validation; nothing was sent.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    /// The peer sent bytes that do not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The peer answered with an APDU of the wrong kind.
    #[error("expected {expected}, received {received}")]
    UnexpectedApdu {
        /// APDU the session waited for
        expected: &'static str,
        /// APDU that arrived
        received: &'static str,
    },

    /// The target closed the association.
    #[error("target closed the session ({reason:?})")]
    ClosedByTarget {
        /// Reason the target gave
        reason: CloseReason,
    },

    /// The target reported failure.
    #[error("target diagnostic: {message}")]
    Diagnostic {
        /// Bib-1 condition, if one was sent
        condition: Option<i64>,
        /// Human-readable text
        message: String,
    },

    /// A record syntax other than MARC21 was requested.
    #[error("unsupported record syntax {0}")]
    UnsupportedSyntax(Oid),

    /// The session's cancel token fired.
    #[error("cancelled")]
    Cancelled,

    /// Other socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    fn from_diagnostic(diag: Option<&Diagnostic>, fallback: &str) -> Self {
        match diag {
            Some(diag) => SessionError::Diagnostic {
                condition: Some(diag.condition),
                message: diag.to_string(),
            },
            None => SessionError::Diagnostic {
                condition: None,
                message: fallback.to_string(),
            },
        }
    }
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on each network operation
    pub timeout: Duration,
    /// Offered at Init
    pub preferred_message_size: usize,
    /// Offered at Init as the exceptional record size
    pub max_record_size: usize,
    /// Login sent with Init
    pub credentials: Option<Credentials>,
    /// Implementation name sent with Init
    pub implementation_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: Duration::from_secs(30),
            preferred_message_size: 1024 * 1024,
            max_record_size: 1024 * 1024,
            credentials: None,
            implementation_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl SessionConfig {
    // A response may carry a full message of records plus one oversized
    // record; anything larger is refused.
    fn max_message_size(&self) -> usize {
        self.preferred_message_size
            .saturating_add(self.max_record_size)
    }
}

/// One entry returned by [`Session::present`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentedRecord {
    /// Raw record octets in the requested syntax
    Data(Vec<u8>),
    /// The target could not supply this record
    Diagnostic(Diagnostic),
}

/// A single Z39.50 association with one target.
#[derive(Debug)]
pub struct Session {
    host: String,
    port: u16,
    config: SessionConfig,
    state: SessionState,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    negotiated_version: Option<u8>,
    result_set_name: String,
    result_count: usize,
    finished: bool,
    cancel: Option<CancelToken>,
    registration: Option<Registration>,
}

impl Session {
    /// A closed session for `host:port`.
    pub fn new(host: impl Into<String>, port: u16, config: SessionConfig) -> Self {
        Session {
            host: host.into(),
            port,
            config,
            state: SessionState::Closed,
            stream: None,
            buffer: BytesMut::new(),
            negotiated_version: None,
            result_set_name: DEFAULT_RESULT_SET.to_string(),
            result_count: 0,
            finished: false,
            cancel: None,
            registration: None,
        }
    }

    /// Abort blocked I/O when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Highest protocol version both sides support, once initialized.
    #[must_use]
    pub fn negotiated_version(&self) -> Option<u8> {
        self.negotiated_version
    }

    /// Hits in the current result set.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Name of the current result set.
    #[must_use]
    pub fn result_set_name(&self) -> &str {
        &self.result_set_name
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(target_addr = %self.address(), from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Open the TCP connection.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless the session is fresh,
    /// [`SessionError::Timeout`] if the connect times out,
    /// [`SessionError::Connection`] for any other connect failure.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Closed || self.finished {
            return Err(SessionError::InvalidState(format!(
                "connect requires a fresh session, state is {:?}",
                self.state
            )));
        }
        if self.cancelled() {
            self.finished = true;
            return Err(SessionError::Cancelled);
        }

        let address = self.address();
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| {
                self.finished = true;
                SessionError::Connection {
                    address: address.clone(),
                    source,
                }
            })?;

        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.timeout) {
                Ok(stream) => return self.attach(stream),
                Err(err) => last_error = err,
            }
        }

        self.finished = true;
        if matches!(
            last_error.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ) {
            return Err(SessionError::Timeout("connect"));
        }
        Err(SessionError::Connection {
            address,
            source: last_error,
        })
    }

    fn attach(&mut self, stream: TcpStream) -> Result<(), SessionError> {
        let setup = || -> io::Result<Option<Registration>> {
            stream.set_nodelay(true)?;
            stream.set_write_timeout(Some(self.config.timeout))?;
            self.cancel
                .as_ref()
                .map(|token| token.register(&stream))
                .transpose()
        };
        match setup() {
            Ok(registration) => {
                self.registration = registration;
                self.stream = Some(stream);
                self.transition(SessionState::Connected);
                if self.cancelled() {
                    return Err(self.fail(SessionError::Cancelled));
                }
                Ok(())
            },
            Err(err) => {
                self.finished = true;
                Err(SessionError::Io(err))
            },
        }
    }

    /// Negotiate the association.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless connected,
    /// [`SessionError::Negotiation`] if the target refuses or shares no
    /// protocol version, or any transport error.
    pub fn init(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(self.invalid("init", "requires a connected session"));
        }

        let request = InitRequest {
            reference_id: None,
            protocol_version: BitString::with_bits(
                usize::from(SUPPORTED_VERSIONS),
                &[0, 1, 2],
            ),
            options: BitString::with_bits(
                options::NAMED_RESULT_SETS + 1,
                &[options::SEARCH, options::PRESENT, options::NAMED_RESULT_SETS],
            ),
            preferred_message_size: to_i64(self.config.preferred_message_size),
            exceptional_record_size: to_i64(self.config.max_record_size),
            authentication: self
                .config
                .credentials
                .as_ref()
                .map(|c| Authentication::IdPass {
                    group: c.group.clone(),
                    user: Some(c.user.clone()),
                    password: Some(c.password.clone()),
                }),
            implementation_id: Some(self.config.implementation_name.clone()),
            implementation_name: Some(self.config.implementation_name.clone()),
            implementation_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        let response = match self.exchange(Apdu::InitRequest(request), "init")? {
            Apdu::InitResponse(response) => response,
            other => return Err(self.unexpected("InitResponse", &other)),
        };

        if !response.result {
            return Err(self.fail(SessionError::Negotiation(
                "target rejected the Init request".to_string(),
            )));
        }
        let version = (0..SUPPORTED_VERSIONS)
            .rev()
            .find(|&bit| response.protocol_version.is_set(usize::from(bit)))
            .map(|bit| bit + 1);
        let Some(version) = version else {
            return Err(self.fail(SessionError::Negotiation(
                "no common protocol version".to_string(),
            )));
        };

        debug!(
            target_addr = %self.address(),
            version,
            implementation = response.implementation_name.as_deref().unwrap_or(""),
            "initialized"
        );
        self.negotiated_version = Some(version);
        self.transition(SessionState::Initialized);
        Ok(())
    }

    /// Run `query` against `database`, replacing the current result set.
    ///
    /// Returns the hit count; zero hits is success.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidQuery`] before any I/O for a bad query,
    /// [`SessionError::InvalidState`] before init or after close,
    /// [`SessionError::Diagnostic`] if the target reports failure, or any
    /// transport error.
    pub fn search(
        &mut self,
        query: &StructuredQuery,
        database: &str,
    ) -> Result<usize, SessionError> {
        let rpn = query.to_rpn()?;
        if !matches!(
            self.state,
            SessionState::Initialized | SessionState::SearchActive | SessionState::PresentActive
        ) {
            return Err(self.invalid("search", "requires an initialized session"));
        }

        let request = SearchRequest {
            reference_id: None,
            small_set_upper_bound: 0,
            large_set_lower_bound: 1,
            medium_set_present_number: 0,
            replace_indicator: true,
            result_set_name: self.result_set_name.clone(),
            database_names: vec![database.to_string()],
            preferred_record_syntax: Some(Oid::new(MARC21_SYNTAX)),
            query: rpn,
        };

        let response = match self.exchange(Apdu::SearchRequest(request), "search")? {
            Apdu::SearchResponse(response) => response,
            other => return Err(self.unexpected("SearchResponse", &other)),
        };

        if !response.search_status {
            self.result_count = 0;
            self.transition(SessionState::Initialized);
            return Err(SessionError::from_diagnostic(
                response.records.as_ref().and_then(Records::diagnostic),
                "search failed without a diagnostic",
            ));
        }

        self.result_count = usize::try_from(response.result_count).unwrap_or(0);
        debug!(target_addr = %self.address(), database, hits = self.result_count, "search done");
        self.transition(SessionState::SearchActive);
        Ok(self.result_count)
    }

    /// Fetch `count` records starting at 1-based ordinal `start`.
    ///
    /// `count` is clipped to the end of the result set; a zero count returns
    /// no records without contacting the target.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] without I/O if no search has run or
    /// `start` lies outside the result set,
    /// [`SessionError::UnsupportedSyntax`] for anything but MARC21,
    /// [`SessionError::Diagnostic`] if the target returns no records, or any
    /// transport error.
    pub fn present(
        &mut self,
        start: usize,
        count: usize,
        syntax: &Oid,
    ) -> Result<Vec<PresentedRecord>, SessionError> {
        if !matches!(
            self.state,
            SessionState::SearchActive | SessionState::PresentActive
        ) {
            return Err(self.invalid("present", "requires a completed search"));
        }
        if *syntax != *MARC21_SYNTAX {
            return Err(SessionError::UnsupportedSyntax(syntax.clone()));
        }
        if start == 0 || start > self.result_count {
            return Err(SessionError::InvalidState(format!(
                "present start {start} outside result set 1..={}",
                self.result_count
            )));
        }
        let count = count.min(self.result_count - start + 1);
        if count == 0 {
            return Ok(Vec::new());
        }

        let request = PresentRequest {
            reference_id: None,
            result_set_id: self.result_set_name.clone(),
            start_point: to_i64(start),
            number_requested: to_i64(count),
            element_set_name: Some("F".to_string()),
            preferred_record_syntax: Some(syntax.clone()),
        };

        let response = match self.exchange(Apdu::PresentRequest(request), "present")? {
            Apdu::PresentResponse(response) => response,
            other => return Err(self.unexpected("PresentResponse", &other)),
        };
        self.transition(SessionState::PresentActive);

        let records = match response.records {
            Some(Records::ResponseRecords(entries)) => entries,
            Some(other) => {
                return Err(SessionError::from_diagnostic(
                    other.diagnostic(),
                    "present failed",
                ));
            },
            None if response.present_status == apdu::present_status::FAILURE => {
                return Err(SessionError::from_diagnostic(None, "present failed"));
            },
            None => Vec::new(),
        };

        debug!(
            target_addr = %self.address(),
            start,
            requested = count,
            returned = records.len(),
            "present done"
        );
        Ok(records
            .into_iter()
            .map(|entry| match entry.record {
                RecordContent::Retrieval(external) => PresentedRecord::Data(external.data),
                RecordContent::SurrogateDiagnostic(diag) => PresentedRecord::Diagnostic(diag),
            })
            .collect())
    }

    /// End the association. Safe to call repeatedly.
    ///
    /// Sends Close and waits briefly for the target's Close before shutting
    /// the socket down; failures along the way are only logged.
    pub fn close(&mut self) {
        self.finished = true;
        if self.stream.is_none() {
            self.transition(SessionState::Closed);
            return;
        }
        if !self.cancelled() {
            let close = Apdu::Close(Close {
                reference_id: None,
                close_reason: CloseReason::Finished,
                diagnostic_information: None,
            });
            match self.exchange(close, "close") {
                Ok(Apdu::Close(_)) | Err(_) => {},
                Ok(other) => {
                    debug!(target_addr = %self.address(), received = other.name(), "ignoring reply to Close");
                },
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    warn!(target_addr = %self.address(), error = %err, "socket shutdown failed");
                }
            }
        }
        self.registration = None;
        self.buffer.clear();
        self.finished = true;
        self.transition(SessionState::Closed);
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.shutdown();
        err
    }

    fn invalid(&self, operation: &str, requirement: &str) -> SessionError {
        SessionError::InvalidState(format!(
            "{operation} {requirement}, state is {:?}",
            self.state
        ))
    }

    fn unexpected(&mut self, expected: &'static str, received: &Apdu) -> SessionError {
        let err = match received {
            Apdu::Close(close) => SessionError::ClosedByTarget {
                reason: close.close_reason,
            },
            other => SessionError::UnexpectedApdu {
                expected,
                received: other.name(),
            },
        };
        self.fail(err)
    }

    // Send one APDU and wait for the reply, all within one timeout window.
    fn exchange(&mut self, apdu: Apdu, operation: &'static str) -> Result<Apdu, SessionError> {
        let deadline = Instant::now() + self.config.timeout;
        let bytes = apdu::encode(&apdu);
        debug!(target_addr = %self.address(), apdu = apdu.name(), bytes = bytes.len(), "send");

        let sent = match self.stream.as_mut() {
            Some(stream) => stream.write_all(&bytes).and_then(|()| stream.flush()),
            None => return Err(self.invalid(operation, "requires an open connection")),
        };
        if let Err(err) = sent {
            return Err(self.io_failure(err, operation));
        }

        let reply = self.receive(deadline, operation)?;
        debug!(target_addr = %self.address(), apdu = reply.name(), "received");
        Ok(reply)
    }

    fn receive(&mut self, deadline: Instant, operation: &'static str) -> Result<Apdu, SessionError> {
        let limit = self.config.max_message_size();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if !self.buffer.is_empty() {
                match apdu::decode(&self.buffer) {
                    Ok((apdu, consumed)) => {
                        self.buffer.advance(consumed);
                        return Ok(apdu);
                    },
                    Err(CodecError::Incomplete { needed }) => {
                        if self.buffer.len().saturating_add(needed) > limit {
                            return Err(self.fail(SessionError::Protocol(CodecError::Malformed(
                                format!("message exceeds {limit} bytes"),
                            ))));
                        }
                    },
                    Err(err) => return Err(self.fail(SessionError::Protocol(err))),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fail(SessionError::Timeout(operation)));
            }
            let read = match self.stream.as_mut() {
                Some(stream) => stream
                    .set_read_timeout(Some(remaining))
                    .and_then(|()| stream.read(&mut chunk)),
                None => return Err(self.invalid(operation, "requires an open connection")),
            };
            match read {
                Ok(0) => {
                    let err = if self.cancelled() {
                        SessionError::Cancelled
                    } else {
                        SessionError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by target",
                        ))
                    };
                    return Err(self.fail(err));
                },
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(self.io_failure(err, operation)),
            }
        }
    }

    fn io_failure(&mut self, err: io::Error, operation: &'static str) -> SessionError {
        let mapped = if self.cancelled() {
            SessionError::Cancelled
        } else if matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ) {
            SessionError::Timeout(operation)
        } else {
            SessionError::Io(err)
        };
        self.fail(mapped)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.close();
        }
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::z3950::apdu::{InitResponse, SearchResponse};
    use std::net::TcpListener;
    use std::thread;

    fn config() -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    fn read_apdu(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<Apdu> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Ok((apdu, used)) = apdu::decode(buffer) {
                buffer.drain(..used);
                return Some(apdu);
            }
            let n = stream.read(&mut chunk).ok()?;
            if n == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn init_response(result: bool, versions: &[usize]) -> Apdu {
        Apdu::InitResponse(InitResponse {
            reference_id: None,
            protocol_version: BitString::with_bits(3, versions),
            options: BitString::with_bits(15, &[0, 1, 14]),
            preferred_message_size: 65_536,
            exceptional_record_size: 65_536,
            result,
            implementation_id: None,
            implementation_name: Some("stub".to_string()),
            implementation_version: None,
        })
    }

    // Replies to each request with the next scripted APDU; a byte slice
    // entry is written raw instead.
    fn scripted_target(replies: Vec<Result<Apdu, Vec<u8>>>) -> (u16, thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buffer = Vec::new();
            let mut seen = 0;
            for reply in replies {
                if read_apdu(&mut stream, &mut buffer).is_none() {
                    break;
                }
                seen += 1;
                let bytes = match reply {
                    Ok(apdu) => apdu::encode(&apdu),
                    Err(raw) => raw,
                };
                if stream.write_all(&bytes).is_err() {
                    break;
                }
            }
            while let Some(apdu) = read_apdu(&mut stream, &mut buffer) {
                seen += 1;
                if let Apdu::Close(close) = apdu {
                    let _ = stream.write_all(&apdu::encode(&Apdu::Close(close)));
                }
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn test_present_before_search_is_invalid_state() {
        let mut session = Session::new("127.0.0.1", 1, config());
        let err = session
            .present(1, 1, &Oid::new(MARC21_SYNTAX))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_init_before_connect_is_invalid_state() {
        let mut session = Session::new("127.0.0.1", 1, config());
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::InvalidState(_)
        ));
    }

    #[test]
    fn test_empty_query_rejected_without_io() {
        let mut session = Session::new("127.0.0.1", 1, config());
        let err = session
            .search(&StructuredQuery::any(" "), "Default")
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidQuery(QueryError::EmptyTerm)));
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut session = Session::new("127.0.0.1", port, config());
        assert!(matches!(
            session.connect().unwrap_err(),
            SessionError::Connection { .. } | SessionError::Timeout(_)
        ));
        assert!(matches!(
            session.connect().unwrap_err(),
            SessionError::InvalidState(_)
        ));
    }

    #[test]
    fn test_negotiates_highest_common_version() {
        let (port, handle) = scripted_target(vec![Ok(init_response(true, &[0, 1]))]);
        let mut session = Session::new("127.0.0.1", port, config());
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        session.init().unwrap();
        assert_eq!(session.negotiated_version(), Some(2));
        assert_eq!(session.state(), SessionState::Initialized);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close();
        drop(session);
        // Init plus Close
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_rejected_init_is_negotiation_error() {
        let (port, handle) = scripted_target(vec![Ok(init_response(false, &[0, 1, 2]))]);
        let mut session = Session::new("127.0.0.1", port, config());
        session.connect().unwrap();
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::Negotiation(_)
        ));
        assert_eq!(session.state(), SessionState::Closed);
        handle.join().unwrap();
    }

    #[test]
    fn test_no_common_version_is_negotiation_error() {
        let (port, handle) = scripted_target(vec![Ok(init_response(true, &[]))]);
        let mut session = Session::new("127.0.0.1", port, config());
        session.connect().unwrap();
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::Negotiation(_)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_search_carries_diagnostic() {
        let (port, handle) = scripted_target(vec![
            Ok(init_response(true, &[0, 1, 2])),
            Ok(Apdu::SearchResponse(SearchResponse {
                reference_id: None,
                result_count: 0,
                number_of_records_returned: 0,
                next_result_set_position: 0,
                search_status: false,
                result_set_status: None,
                present_status: None,
                records: Some(Records::NonSurrogateDiagnostic(Diagnostic::bib1(
                    109, "Nope",
                ))),
            })),
        ]);
        let mut session = Session::new("127.0.0.1", port, config());
        session.connect().unwrap();
        session.init().unwrap();
        match session.search(&StructuredQuery::any("x"), "Nope") {
            Err(SessionError::Diagnostic { condition, message }) => {
                assert_eq!(condition, Some(109));
                assert!(message.contains("Nope"));
            },
            other => panic!("expected diagnostic, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Initialized);
        drop(session);
        handle.join().unwrap();
    }

    #[test]
    fn test_malformed_reply_closes_session() {
        let (port, handle) = scripted_target(vec![Err(vec![0x30, 0x00])]);
        let mut session = Session::new("127.0.0.1", port, config());
        session.connect().unwrap();
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::Protocol(CodecError::Malformed(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::InvalidState(_)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_silent_target_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(600));
            drop(stream);
        });
        let mut session = Session::new(
            "127.0.0.1",
            port,
            SessionConfig {
                timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
        );
        session.connect().unwrap();
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::Timeout("init")
        ));
        assert_eq!(session.state(), SessionState::Closed);
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_aborts_blocked_init() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });
        let token = CancelToken::new();
        let mut session = Session::new("127.0.0.1", port, config()).with_cancel(token.clone());
        session.connect().unwrap();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = Instant::now();
        assert!(matches!(session.init().unwrap_err(), SessionError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(700));
        canceller.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_oversized_message_rejected() {
        // Declares a 16 MiB InitResponse
        let (port, handle) = scripted_target(vec![Err(vec![0xB5, 0x84, 0x01, 0x00, 0x00, 0x00])]);
        let mut session = Session::new(
            "127.0.0.1",
            port,
            SessionConfig {
                preferred_message_size: 1024,
                max_record_size: 1024,
                ..config()
            },
        );
        session.connect().unwrap();
        assert!(matches!(
            session.init().unwrap_err(),
            SessionError::Protocol(CodecError::Malformed(_))
        ));
        handle.join().unwrap();
    }
}
