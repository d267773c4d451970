//! Where federated searches get their records from.
//!
//! A [`Provider`] opens one [`TargetSearch`] per target; the orchestrator runs
//! `search` then `fetch` on it and drops it when done. Two providers ship with
//! the crate:
//!
//! - [`Z3950Provider`] talks to real targets through a [`Session`]
//! - [`MemoryProvider`] serves canned records, for tests and demos
//!
//! Per-record failures travel inside [`FetchedRecord`] so one bad record does
//! not cost the whole target.

use crate::cancel::CancelToken;
use crate::config::{SearchConfig, Target};
use crate::error::MarcError;
use crate::query::StructuredQuery;
use crate::reader::parse;
use crate::record::Record;
use crate::z3950::session::{PresentedRecord, Session, SessionError};
use crate::z3950::{Oid, MARC21_SYNTAX};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Errors raised by providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider knows no target by this name.
    #[error("unknown target {0}")]
    UnknownTarget(String),

    /// The Z39.50 session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// One record could not be decoded.
    #[error("record {id}: {source}")]
    Record {
        /// Identifier the record was fetched under
        id: String,
        /// Decoding failure
        #[source]
        source: MarcError,
    },

    /// The target refused or could not serve the request.
    #[error("{0}")]
    Unavailable(String),
}

impl ProviderError {
    /// True when the failure came from cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Session(SessionError::Cancelled))
    }
}

/// Hits of one search, in result-set order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSet {
    /// Target-local record identifiers
    Identifiers(Vec<String>),
    /// A Z39.50 result set addressed by 1-based ordinal
    Positions {
        /// Hit count
        count: usize,
    },
}

impl ResultSet {
    /// Number of hits.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ResultSet::Identifiers(ids) => ids.len(),
            ResultSet::Positions { count } => *count,
        }
    }

    /// True when nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of the first `n` hits; positions render as their ordinal.
    #[must_use]
    pub fn first(&self, n: usize) -> Vec<String> {
        match self {
            ResultSet::Identifiers(ids) => ids.iter().take(n).cloned().collect(),
            ResultSet::Positions { count } => (1..=n.min(*count)).map(|i| i.to_string()).collect(),
        }
    }
}

/// One record returned by [`TargetSearch::fetch`].
#[derive(Debug)]
pub struct FetchedRecord {
    /// Identifier it was requested under
    pub id: String,
    /// The decoded record, or why it could not be decoded
    pub record: Result<Record, ProviderError>,
}

/// Opens per-target searches.
pub trait Provider: Send + Sync {
    /// Connect to `target`. Blocking work must give up once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Any failure to reach or negotiate with the target.
    fn open(&self, target: &Target, cancel: &CancelToken)
        -> Result<Box<dyn TargetSearch>, ProviderError>;
}

/// An open search against one target.
pub trait TargetSearch: Send {
    /// Run the query.
    ///
    /// # Errors
    ///
    /// Any failure that prevents a result set from being produced.
    fn search(&mut self, query: &StructuredQuery) -> Result<ResultSet, ProviderError>;

    /// Retrieve records by identifier, in the order given.
    ///
    /// # Errors
    ///
    /// Failures that affect the whole request; per-record failures are
    /// reported inside the returned entries instead.
    fn fetch(&mut self, ids: &[String]) -> Result<Vec<FetchedRecord>, ProviderError>;

    /// Release the connection. Dropping does the same.
    fn close(&mut self) {}
}

/// [`Provider`] backed by Z39.50 sessions.
#[derive(Debug, Clone, Default)]
pub struct Z3950Provider {
    config: SearchConfig,
}

impl Z3950Provider {
    /// Provider using `config` for timeouts and message sizes.
    #[must_use]
    pub fn new(config: SearchConfig) -> Self {
        Z3950Provider { config }
    }
}

impl Provider for Z3950Provider {
    fn open(
        &self,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<Box<dyn TargetSearch>, ProviderError> {
        let mut session = Session::new(
            target.host.clone(),
            target.port,
            self.config.session_config(target),
        )
        .with_cancel(cancel.clone());
        session.connect()?;
        session.init()?;
        Ok(Box::new(Z3950Search {
            session,
            database: target.database.clone(),
        }))
    }
}

#[derive(Debug)]
struct Z3950Search {
    session: Session,
    database: String,
}

impl TargetSearch for Z3950Search {
    fn search(&mut self, query: &StructuredQuery) -> Result<ResultSet, ProviderError> {
        let count = self.session.search(query, &self.database)?;
        Ok(ResultSet::Positions { count })
    }

    fn fetch(&mut self, ids: &[String]) -> Result<Vec<FetchedRecord>, ProviderError> {
        let mut positions = Vec::with_capacity(ids.len());
        for id in ids {
            let position = id.parse::<usize>().map_err(|_| {
                ProviderError::Unavailable(format!("{id} is not a result set position"))
            })?;
            positions.push((id, position));
        }

        let syntax = Oid::new(MARC21_SYNTAX);
        let mut fetched = Vec::with_capacity(positions.len());
        let mut rest = positions.as_slice();
        while let Some(&(_, start)) = rest.first() {
            // Present whole runs of consecutive positions at once.
            let run = rest
                .windows(2)
                .take_while(|pair| pair[1].1 == pair[0].1 + 1)
                .count()
                + 1;
            let presented = self.session.present(start, run, &syntax)?;
            if presented.is_empty() {
                return Err(ProviderError::Unavailable(format!(
                    "target returned no records at position {start}"
                )));
            }
            let got = presented.len().min(run);
            for ((id, _), entry) in rest[..got].iter().zip(presented) {
                let record = match entry {
                    PresentedRecord::Data(bytes) => {
                        parse(&bytes).map_err(|source| ProviderError::Record {
                            id: (*id).clone(),
                            source,
                        })
                    },
                    PresentedRecord::Diagnostic(diag) => {
                        Err(ProviderError::Unavailable(diag.to_string()))
                    },
                };
                fetched.push(FetchedRecord {
                    id: (*id).clone(),
                    record,
                });
            }
            rest = &rest[got..];
        }
        Ok(fetched)
    }

    fn close(&mut self) {
        self.session.close();
    }
}

/// Canned behaviour for one [`MemoryProvider`] target.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    records: Vec<Vec<u8>>,
    open_error: Option<String>,
    search_error: Option<String>,
    fetch_error: Option<String>,
    delay: Duration,
}

impl MemoryTarget {
    /// A target with no records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve these ISO 2709 records; every one is a hit for any query.
    /// Bytes that do not parse are served as per-record failures.
    #[must_use]
    pub fn with_records(mut self, records: Vec<Vec<u8>>) -> Self {
        self.records = records;
        self
    }

    /// Fail to connect with `message`.
    #[must_use]
    pub fn unreachable(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    /// Fail every search with `message`.
    #[must_use]
    pub fn failing_search(mut self, message: &str) -> Self {
        self.search_error = Some(message.to_string());
        self
    }

    /// Search succeeds, fetch fails with `message`.
    #[must_use]
    pub fn failing_fetch(mut self, message: &str) -> Self {
        self.fetch_error = Some(message.to_string());
        self
    }

    /// Spend `delay` inside search, giving up early on cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct OpenCounter {
    open: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// In-memory [`Provider`] for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    targets: HashMap<String, MemoryTarget>,
    counter: Arc<OpenCounter>,
}

impl MemoryProvider {
    /// A provider with no targets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` under `name`.
    #[must_use]
    pub fn with_target(mut self, name: &str, target: MemoryTarget) -> Self {
        self.targets.insert(name.to_string(), target);
        self
    }

    /// Most searches that were open at the same time.
    #[must_use]
    pub fn peak_open(&self) -> usize {
        self.counter.peak.load(Ordering::SeqCst)
    }

    /// Searches opened so far.
    #[must_use]
    pub fn total_opened(&self) -> usize {
        self.counter.total.load(Ordering::SeqCst)
    }

    /// Searches currently open.
    #[must_use]
    pub fn currently_open(&self) -> usize {
        self.counter.open.load(Ordering::SeqCst)
    }
}

impl Provider for MemoryProvider {
    fn open(
        &self,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<Box<dyn TargetSearch>, ProviderError> {
        let canned = self
            .targets
            .get(&target.name)
            .ok_or_else(|| ProviderError::UnknownTarget(target.name.clone()))?;
        if let Some(message) = &canned.open_error {
            return Err(ProviderError::Unavailable(message.clone()));
        }
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled.into());
        }

        let open = self.counter.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counter.peak.fetch_max(open, Ordering::SeqCst);
        self.counter.total.fetch_add(1, Ordering::SeqCst);
        debug!(target_name = %target.name, open, "memory search opened");

        Ok(Box::new(MemorySearch {
            canned: canned.clone(),
            cancel: cancel.clone(),
            counter: Arc::clone(&self.counter),
        }))
    }
}

#[derive(Debug)]
struct MemorySearch {
    canned: MemoryTarget,
    cancel: CancelToken,
    counter: Arc<OpenCounter>,
}

impl MemorySearch {
    fn wait(&self) -> Result<(), ProviderError> {
        let deadline = Instant::now() + self.canned.delay;
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled.into());
            }
            thread::sleep(Duration::from_millis(5));
        }
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled.into());
        }
        Ok(())
    }
}

impl TargetSearch for MemorySearch {
    fn search(&mut self, _query: &StructuredQuery) -> Result<ResultSet, ProviderError> {
        self.wait()?;
        if let Some(message) = &self.canned.search_error {
            return Err(ProviderError::Unavailable(message.clone()));
        }
        Ok(ResultSet::Identifiers(
            (1..=self.canned.records.len()).map(|i| format!("mem-{i}")).collect(),
        ))
    }

    fn fetch(&mut self, ids: &[String]) -> Result<Vec<FetchedRecord>, ProviderError> {
        if let Some(message) = &self.canned.fetch_error {
            return Err(ProviderError::Unavailable(message.clone()));
        }
        ids.iter()
            .map(|id| {
                let bytes = id
                    .strip_prefix("mem-")
                    .and_then(|n| n.parse::<usize>().ok())
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| self.canned.records.get(i))
                    .ok_or_else(|| ProviderError::Unavailable(format!("no record {id}")))?;
                Ok(FetchedRecord {
                    id: id.clone(),
                    record: parse(bytes).map_err(|source| ProviderError::Record {
                        id: id.clone(),
                        source,
                    }),
                })
            })
            .collect()
    }
}

impl Drop for MemorySearch {
    fn drop(&mut self) {
        self.counter.open.fetch_sub(1, Ordering::SeqCst);
    }
}
