//! Federated search across many targets.
//!
//! [`FederatedSearch::search`] runs one search-then-fetch pipeline per target
//! on a bounded rayon pool. Workers never touch the caller's sink: they send
//! [`SearchEvent`]s down a bounded crossbeam channel and a single sink thread
//! drains it, so each event reaches the sink whole and a slow sink applies
//! backpressure to the workers instead of buffering the whole result.
//!
//! Every target ends with exactly one [`SearchStatus`]. A target that fails
//! contributes no results and never affects its siblings.
//!
//! ```no_run
//! use fedcat::{FederatedSearch, SearchConfig, SearchEvent, StructuredQuery, Target, Z3950Provider};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SearchConfig::from_env()?;
//! let search = FederatedSearch::new(Z3950Provider::new(config.clone()), config);
//! let targets = vec![Target::new("LoC", "lx2.loc.gov", 210, "LCDB")];
//! let mut events: Vec<SearchEvent> = Vec::new();
//! let report = search.search(&targets, &StructuredQuery::any("rust"), 5, &mut events)?;
//! println!("{} records", report.delivered());
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::config::{SearchConfig, Target};
use crate::provider::{Provider, ProviderError, TargetSearch};
use crate::query::{QueryError, StructuredQuery};
use crate::record::Record;
use crossbeam_channel::{bounded, Sender};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use unicode_normalization::UnicodeNormalization;

/// Status message for a target with no hits.
pub const NO_RECORDS_MESSAGE: &str = "No records found";

/// Status message for a target skipped or aborted by cancellation.
pub const CANCELLED_MESSAGE: &str = "Search cancelled";

/// One normalized record from one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Title proper
    pub title: String,
    /// Main entry
    pub author: String,
    /// First ISBN
    pub isbn: String,
    /// Publisher name
    pub publisher: String,
    /// Publication year
    pub year: String,
    /// Name of the target it came from
    pub source_target: String,
    /// Target-local identifier
    pub record_id: String,
}

impl SearchResult {
    /// Normalize `record` for display.
    ///
    /// Text is NFC-normalized and trailing ISBD punctuation (` /`, ` :`, `;`,
    /// `,`, `=`) is removed. `record_id` is the 001 control field, or
    /// `fetched_id` when the record has none.
    #[must_use]
    pub fn from_record(record: &Record, source_target: &str, fetched_id: &str) -> Self {
        let id = clean(record.id());
        SearchResult {
            title: clean(record.title()),
            author: clean(record.author()),
            isbn: clean(record.isbn()),
            publisher: clean(record.publisher()),
            year: clean_year(record.year()),
            source_target: source_target.to_string(),
            record_id: if id.is_empty() {
                fetched_id.to_string()
            } else {
                id
            },
        }
    }
}

fn clean(value: &str) -> String {
    let normalized: String = value.nfc().collect();
    normalized
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '/' | ':' | ';' | ',' | '='))
        .trim_start()
        .to_string()
}

// "[2019]." and "c2019." both become "2019"
fn clean_year(value: &str) -> String {
    clean(value)
        .trim_end_matches('.')
        .trim_matches(|c| c == '[' || c == ']')
        .trim_start_matches('c')
        .to_string()
}

/// Terminal report for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStatus {
    /// Target name
    pub target: String,
    /// Whether the target completed without error
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
}

/// An item in the stream delivered to a [`SearchSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchEvent {
    /// A target finished
    Status(SearchStatus),
    /// A record was retrieved
    Result(SearchResult),
}

impl SearchEvent {
    fn status(target: &str, success: bool, message: impl Into<String>) -> Self {
        SearchEvent::Status(SearchStatus {
            target: target.to_string(),
            success,
            message: message.into(),
        })
    }

    /// Name of the target the event belongs to.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            SearchEvent::Status(status) => &status.target,
            SearchEvent::Result(result) => &result.source_target,
        }
    }
}

/// Receives the event stream of a search. Only ever called from one thread
/// at a time.
pub trait SearchSink: Send {
    /// Accept one event.
    fn deliver(&mut self, event: SearchEvent);
}

impl SearchSink for Vec<SearchEvent> {
    fn deliver(&mut self, event: SearchEvent) {
        self.push(event);
    }
}

/// Adapts a closure into a [`SearchSink`].
#[derive(Debug)]
pub struct FnSink<F>(pub F);

impl<F> SearchSink for FnSink<F>
where
    F: FnMut(SearchEvent) + Send,
{
    fn deliver(&mut self, event: SearchEvent) {
        (self.0)(event);
    }
}

/// Writes each event as one JSON line and flushes it.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
    failures: usize,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer,
            failures: 0,
        }
    }

    /// Events that could not be written.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_event(&mut self, event: &SearchEvent) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write + Send> SearchSink for JsonLinesSink<W> {
    fn deliver(&mut self, event: SearchEvent) {
        if let Err(err) = self.write_event(&event) {
            self.failures += 1;
            warn!(error = %err, target_name = event.target(), "failed to write search event");
        }
    }
}

/// How one target ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    /// Results were delivered
    Delivered {
        /// Hits reported by the target
        hits: usize,
        /// Results actually delivered
        delivered: usize,
    },
    /// The search matched nothing
    NoRecords,
    /// The target failed; the message was sent as its status
    Failed(String),
    /// Skipped or aborted by cancellation
    Cancelled,
}

/// Outcome for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    /// Target name
    pub target: String,
    /// What happened
    pub status: TargetStatus,
}

/// Summary returned once every target has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReport {
    /// One entry per target, in request order
    pub outcomes: Vec<TargetOutcome>,
}

impl SearchReport {
    /// Results delivered across all targets.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                TargetStatus::Delivered { delivered, .. } => delivered,
                _ => 0,
            })
            .sum()
    }

    /// Targets that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TargetStatus::Failed(_)))
            .count()
    }

    /// Outcome for `target`.
    #[must_use]
    pub fn outcome(&self, target: &str) -> Option<&TargetStatus> {
        self.outcomes
            .iter()
            .find(|o| o.target == target)
            .map(|o| &o.status)
    }
}

/// Errors that abort a whole federated search.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The query was rejected before any target was contacted.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    /// The same target was named twice.
    #[error("duplicate target {0}")]
    DuplicateTarget(String),

    /// The search was cancelled; every target has still finished and
    /// released its connection.
    #[error("search cancelled")]
    Cancelled(SearchReport),

    /// The worker pool or sink thread failed.
    #[error("worker pool: {0}")]
    Pool(String),
}

/// Runs one query against many targets.
#[derive(Debug)]
pub struct FederatedSearch<P> {
    provider: P,
    config: SearchConfig,
    cancel: CancelToken,
}

impl<P: Provider> FederatedSearch<P> {
    /// Orchestrator over `provider`.
    pub fn new(provider: P, config: SearchConfig) -> Self {
        FederatedSearch {
            provider,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Use `token` for cancellation instead of a private one.
    ///
    /// Tokens cannot be reset, so once `token` fires every later search on
    /// this orchestrator reports all targets as cancelled.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels searches run by this orchestrator.
    ///
    /// Cancellation is terminal: after [`CancelToken::cancel`] every search,
    /// including later ones, ends with [`SearchError::Cancelled`] and opens no
    /// targets. Build a new orchestrator to search again.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The provider records come from.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Search every target in `targets` and stream events into `sink`.
    ///
    /// At most `limit` records are fetched per target; a `limit` of zero or
    /// less uses the configured default. Returns once every target has
    /// finished and the sink has received every event.
    ///
    /// # Errors
    ///
    /// [`SearchError::InvalidQuery`] and [`SearchError::DuplicateTarget`]
    /// before any I/O, [`SearchError::Cancelled`] after all targets have
    /// wound down if the token fired, or [`SearchError::Pool`] if the
    /// worker threads could not be started. Failures of individual targets
    /// are reported in the stream, not here.
    pub fn search(
        &self,
        targets: &[Target],
        query: &StructuredQuery,
        limit: i64,
        sink: &mut dyn SearchSink,
    ) -> Result<SearchReport, SearchError> {
        query.validate()?;
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.name.as_str()) {
                return Err(SearchError::DuplicateTarget(target.name.clone()));
            }
        }
        if targets.is_empty() {
            return Ok(SearchReport::default());
        }

        let limit = if limit <= 0 {
            self.config.result_limit
        } else {
            usize::try_from(limit).unwrap_or(usize::MAX)
        };
        let workers = self.config.max_concurrency.clamp(1, targets.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("fedcat-worker-{i}"))
            .build()
            .map_err(|e| SearchError::Pool(e.to_string()))?;
        debug!(targets = targets.len(), workers, limit, "federated search started");

        let (tx, rx) = bounded::<SearchEvent>(self.config.channel_capacity.max(1));
        let outcomes = thread::scope(|scope| {
            let drain = scope.spawn(move || {
                for event in rx {
                    sink.deliver(event);
                }
            });
            let outcomes: Vec<TargetOutcome> = pool.install(|| {
                targets
                    .par_iter()
                    .map(|target| self.run_target(target, query, limit, &tx))
                    .collect()
            });
            drop(tx);
            drain.join().map(|()| outcomes)
        })
        .map_err(|_| SearchError::Pool("event sink panicked".to_string()))?;

        let report = SearchReport { outcomes };
        if self.cancel.is_cancelled() {
            return Err(SearchError::Cancelled(report));
        }
        info!(
            targets = report.outcomes.len(),
            delivered = report.delivered(),
            failed = report.failed(),
            "federated search finished"
        );
        Ok(report)
    }

    fn run_target(
        &self,
        target: &Target,
        query: &StructuredQuery,
        limit: usize,
        tx: &Sender<SearchEvent>,
    ) -> TargetOutcome {
        let span = info_span!("target", target_name = %target.name);
        let _entered = span.enter();

        let status = self.search_target(target, query, limit, tx);
        let event = match &status {
            TargetStatus::Delivered { delivered, .. } => SearchEvent::status(
                &target.name,
                true,
                format!("Finished fetching {delivered} records"),
            ),
            TargetStatus::NoRecords => SearchEvent::status(&target.name, true, NO_RECORDS_MESSAGE),
            TargetStatus::Failed(message) => SearchEvent::status(&target.name, false, message.clone()),
            TargetStatus::Cancelled => SearchEvent::status(&target.name, false, CANCELLED_MESSAGE),
        };
        send(tx, event);
        TargetOutcome {
            target: target.name.clone(),
            status,
        }
    }

    fn search_target(
        &self,
        target: &Target,
        query: &StructuredQuery,
        limit: usize,
        tx: &Sender<SearchEvent>,
    ) -> TargetStatus {
        if self.cancel.is_cancelled() {
            return TargetStatus::Cancelled;
        }

        let mut search = match self.provider.open(target, &self.cancel) {
            Ok(search) => search,
            Err(err) => return self.failure("Connection failed", &err),
        };
        let status = self.search_and_fetch(search.as_mut(), target, query, limit, tx);
        search.close();
        status
    }

    fn search_and_fetch(
        &self,
        search: &mut dyn TargetSearch,
        target: &Target,
        query: &StructuredQuery,
        limit: usize,
        tx: &Sender<SearchEvent>,
    ) -> TargetStatus {
        let hits = match search.search(query) {
            Ok(hits) => hits,
            Err(err) => return self.failure("Search failed", &err),
        };
        if hits.is_empty() {
            info!(hits = 0, "no records found");
            return TargetStatus::NoRecords;
        }

        let fetched = match search.fetch(&hits.first(limit)) {
            Ok(fetched) => fetched,
            Err(err) => return self.failure("Fetch failed", &err),
        };
        if self.cancel.is_cancelled() {
            return TargetStatus::Cancelled;
        }

        let mut delivered = 0;
        for entry in fetched {
            match entry.record {
                Ok(record) => {
                    send(
                        tx,
                        SearchEvent::Result(SearchResult::from_record(
                            &record,
                            &target.name,
                            &entry.id,
                        )),
                    );
                    delivered += 1;
                },
                Err(err) => warn!(record_id = %entry.id, error = %err, "skipping record"),
            }
        }
        info!(hits = hits.len(), delivered, "finished fetching");
        TargetStatus::Delivered {
            hits: hits.len(),
            delivered,
        }
    }

    fn failure(&self, context: &str, err: &ProviderError) -> TargetStatus {
        if err.is_cancelled() || self.cancel.is_cancelled() {
            debug!(error = %err, "{context} after cancellation");
            return TargetStatus::Cancelled;
        }
        warn!(error = %err, "{context}");
        TargetStatus::Failed(format!("{context}: {err}"))
    }
}

fn send(tx: &Sender<SearchEvent>, event: SearchEvent) {
    // Only fails if the sink thread is gone, which the join reports.
    if tx.send(event).is_err() {
        debug!("event sink closed");
    }
}
