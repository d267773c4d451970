//! Federated search behaviour over in-memory and network providers.

mod common;

use fedcat::{
    FederatedSearch, JsonLinesSink, MemoryProvider, MemoryTarget, QueryError, SearchConfig,
    SearchError, SearchEvent, SearchResult, SearchStatus, StructuredQuery, Target, TargetStatus,
    UseAttribute, Z3950Provider,
};
use fedcat::z3950::server::Catalog;
use std::thread;
use std::time::{Duration, Instant};

fn target(name: &str) -> Target {
    Target::new(name, "memory", 210, "db")
}

fn statuses<'a>(events: &'a [SearchEvent], name: &str) -> Vec<&'a SearchStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            SearchEvent::Status(s) if s.target == name => Some(s),
            _ => None,
        })
        .collect()
}

fn results<'a>(events: &'a [SearchEvent], name: &str) -> Vec<&'a SearchResult> {
    events
        .iter()
        .filter_map(|e| match e {
            SearchEvent::Result(r) if r.source_target == name => Some(r),
            _ => None,
        })
        .collect()
}

// Every target ends with exactly one status, after all of its results.
fn assert_well_formed(events: &[SearchEvent], targets: &[Target]) {
    for t in targets {
        let mine: Vec<&SearchEvent> = events.iter().filter(|e| e.target() == t.name).collect();
        assert_eq!(statuses(events, &t.name).len(), 1, "target {}", t.name);
        assert!(
            matches!(mine.last(), Some(SearchEvent::Status(_))),
            "status for {} is not last",
            t.name
        );
    }
}

#[test]
fn test_zero_hit_target() {
    let provider = MemoryProvider::new().with_target("Empty", MemoryTarget::new());
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let targets = [target("Empty")];

    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&targets, &StructuredQuery::any("anything"), 5, &mut events)
        .unwrap();

    assert_eq!(events.len(), 1);
    let status = statuses(&events, "Empty")[0];
    assert!(status.success);
    assert_eq!(status.message, "No records found");
    assert_eq!(report.outcome("Empty"), Some(&TargetStatus::NoRecords));
}

#[test]
fn test_failing_target_does_not_affect_siblings() {
    for _ in 0..10 {
        let provider = MemoryProvider::new()
            .with_target("A", MemoryTarget::new().failing_search("index offline"))
            .with_target(
                "B",
                MemoryTarget::new().with_records(vec![common::book("b-1", "Only Hit", "Author")]),
            );
        let search = FederatedSearch::new(provider, SearchConfig::default());
        let targets = [target("A"), target("B")];

        let mut events: Vec<SearchEvent> = Vec::new();
        let report = search
            .search(&targets, &StructuredQuery::any("hit"), 5, &mut events)
            .unwrap();

        assert_eq!(events.len(), 3);
        assert_well_formed(&events, &targets);

        let a = statuses(&events, "A");
        assert!(!a[0].success);
        assert!(a[0].message.contains("index offline"), "{}", a[0].message);
        assert!(results(&events, "A").is_empty());

        let b = results(&events, "B");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].title, "Only Hit");
        assert_eq!(b[0].record_id, "b-1");
        let b_status = statuses(&events, "B")[0];
        assert!(b_status.success);
        assert_eq!(b_status.message, "Finished fetching 1 records");
        assert_eq!(report.failed(), 1);
    }
}

#[test]
fn test_limit_applies_per_target() {
    let provider = MemoryProvider::new()
        .with_target("Big", MemoryTarget::new().with_records(common::numbered_books("big", 100)))
        .with_target("Small", MemoryTarget::new().with_records(common::numbered_books("small", 2)));
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let targets = [target("Big"), target("Small")];

    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&targets, &StructuredQuery::any("book"), 5, &mut events)
        .unwrap();

    let big: Vec<&str> = results(&events, "Big")
        .iter()
        .map(|r| r.record_id.as_str())
        .collect();
    assert_eq!(big, vec!["big-1", "big-2", "big-3", "big-4", "big-5"]);
    assert_eq!(results(&events, "Small").len(), 2);
    assert_eq!(
        report.outcome("Big"),
        Some(&TargetStatus::Delivered {
            hits: 100,
            delivered: 5
        })
    );
    assert_eq!(statuses(&events, "Small")[0].message, "Finished fetching 2 records");
    assert_well_formed(&events, &targets);
}

#[test]
fn test_fetch_failure_reports_failure_status() {
    let provider = MemoryProvider::new().with_target(
        "Flaky",
        MemoryTarget::new()
            .with_records(common::numbered_books("f", 3))
            .failing_fetch("present refused"),
    );
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&[target("Flaky")], &StructuredQuery::any("x"), 5, &mut events)
        .unwrap();

    assert_eq!(events.len(), 1);
    let status = statuses(&events, "Flaky")[0];
    assert!(!status.success);
    assert!(status.message.starts_with("Fetch failed"), "{}", status.message);
    assert!(matches!(report.outcome("Flaky"), Some(TargetStatus::Failed(_))));
}

#[test]
fn test_undecodable_records_are_skipped() {
    let records = vec![
        common::book("ok-1", "First", "Author"),
        b"00042nam  2200025   4500 garbage".to_vec(),
        common::book("ok-2", "Second", "Author"),
    ];
    let provider =
        MemoryProvider::new().with_target("Mixed", MemoryTarget::new().with_records(records));
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let mut events: Vec<SearchEvent> = Vec::new();
    search
        .search(&[target("Mixed")], &StructuredQuery::any("x"), 5, &mut events)
        .unwrap();

    let ids: Vec<&str> = results(&events, "Mixed")
        .iter()
        .map(|r| r.record_id.as_str())
        .collect();
    assert_eq!(ids, vec!["ok-1", "ok-2"]);
    assert_eq!(statuses(&events, "Mixed")[0].message, "Finished fetching 2 records");
}

#[test]
fn test_unreachable_target() {
    let provider =
        MemoryProvider::new().with_target("Down", MemoryTarget::new().unreachable("connection refused"));
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let mut events: Vec<SearchEvent> = Vec::new();
    search
        .search(&[target("Down")], &StructuredQuery::any("x"), 5, &mut events)
        .unwrap();
    let status = statuses(&events, "Down")[0];
    assert!(!status.success);
    assert_eq!(status.message, "Connection failed: connection refused");
}

#[test]
fn test_rejected_before_any_io() {
    let provider = MemoryProvider::new().with_target("A", MemoryTarget::new());
    let search = FederatedSearch::new(provider, SearchConfig::default());

    let mut events: Vec<SearchEvent> = Vec::new();
    let err = search
        .search(
            &[target("A")],
            &StructuredQuery::by(UseAttribute::Title, " "),
            5,
            &mut events,
        )
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidQuery(QueryError::EmptyTerm)));

    let err = search
        .search(&[target("A"), target("A")], &StructuredQuery::any("x"), 5, &mut events)
        .unwrap_err();
    assert!(matches!(err, SearchError::DuplicateTarget(ref name) if name == "A"));

    assert!(events.is_empty());
    assert_eq!(search.provider().total_opened(), 0);
}

#[test]
fn test_concurrency_is_bounded() {
    let mut provider = MemoryProvider::new();
    let mut targets = Vec::new();
    for i in 0..12 {
        let name = format!("T{i}");
        provider = provider.with_target(
            &name,
            MemoryTarget::new()
                .with_records(common::numbered_books(&name, 1))
                .with_delay(Duration::from_millis(40)),
        );
        targets.push(target(&name));
    }
    let config = SearchConfig {
        max_concurrency: 3,
        channel_capacity: 2,
        ..SearchConfig::default()
    };
    let search = FederatedSearch::new(provider, config);

    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&targets, &StructuredQuery::any("x"), 5, &mut events)
        .unwrap();

    assert_eq!(report.delivered(), 12);
    assert_eq!(events.len(), 24);
    assert_well_formed(&events, &targets);
    let provider = search.provider();
    assert!(provider.peak_open() <= 3, "peak {}", provider.peak_open());
    assert_eq!(provider.total_opened(), 12);
    assert_eq!(provider.currently_open(), 0);
}

#[test]
fn test_cancellation_releases_every_target() {
    let mut provider = MemoryProvider::new();
    let mut targets = Vec::new();
    for i in 0..6 {
        let name = format!("Slow{i}");
        provider = provider.with_target(
            &name,
            MemoryTarget::new()
                .with_records(common::numbered_books(&name, 3))
                .with_delay(Duration::from_secs(10)),
        );
        targets.push(target(&name));
    }
    let config = SearchConfig {
        max_concurrency: 2,
        ..SearchConfig::default()
    };
    let search = FederatedSearch::new(provider, config);
    let token = search.cancel_token().clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        token.cancel();
    });

    let started = Instant::now();
    let mut events: Vec<SearchEvent> = Vec::new();
    let err = search
        .search(&targets, &StructuredQuery::any("x"), 5, &mut events)
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.join().unwrap();

    let SearchError::Cancelled(report) = err else {
        panic!("expected cancellation, got {err}");
    };
    assert_eq!(report.outcomes.len(), 6);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == TargetStatus::Cancelled));
    assert_well_formed(&events, &targets);
    assert!(events.iter().all(|e| matches!(
        e,
        SearchEvent::Status(s) if !s.success && s.message == "Search cancelled"
    )));
    assert_eq!(search.provider().currently_open(), 0);
}

#[test]
fn test_cancellation_is_terminal() {
    let provider = MemoryProvider::new()
        .with_target("A", MemoryTarget::new().with_records(common::numbered_books("a", 2)));
    let search = FederatedSearch::new(provider, SearchConfig::default());
    let targets = [target("A")];

    let mut events: Vec<SearchEvent> = Vec::new();
    search
        .search(&targets, &StructuredQuery::any("x"), 5, &mut events)
        .unwrap();
    assert_eq!(search.provider().total_opened(), 1);

    search.cancel_token().cancel();
    for _ in 0..2 {
        let mut events: Vec<SearchEvent> = Vec::new();
        let err = search
            .search(&targets, &StructuredQuery::any("x"), 5, &mut events)
            .unwrap_err();
        let SearchError::Cancelled(report) = err else {
            panic!("expected cancellation, got {err}");
        };
        assert_eq!(report.outcome("A"), Some(&TargetStatus::Cancelled));
        assert_eq!(statuses(&events, "A")[0].message, "Search cancelled");
    }
    assert_eq!(search.provider().total_opened(), 1);
}

#[test]
fn test_end_to_end_over_z3950() {
    common::init_logging();
    let server = common::spawn_catalog(common::server_test_catalog());

    let mut many = Catalog::new();
    for bytes in common::numbered_books("m", 12) {
        many.add_record("books", bytes).unwrap();
    }
    let many_server = common::spawn_catalog(many);

    let targets = vec![
        common::local_target("Default", server.port(), "Default"),
        common::local_target("Many", many_server.port(), "books"),
        common::local_target("NoSuchDb", server.port(), "Nope"),
        common::local_target("Offline", common::closed_port(), "Default"),
    ];
    let config = SearchConfig {
        timeout_secs: 5,
        ..SearchConfig::default()
    };
    let search = FederatedSearch::new(Z3950Provider::new(config.clone()), config);

    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&targets, &StructuredQuery::any("author"), 0, &mut events)
        .unwrap();
    assert_well_formed(&events, &targets);

    let default = results(&events, "Default");
    assert_eq!(default.len(), 1);
    assert_eq!(
        *default[0],
        SearchResult {
            title: "Server Test Title".to_string(),
            author: "Author".to_string(),
            isbn: "ISBN".to_string(),
            publisher: "Pub".to_string(),
            year: "2024".to_string(),
            source_target: "Default".to_string(),
            record_id: "srv-1".to_string(),
        }
    );

    let many: Vec<&str> = results(&events, "Many")
        .iter()
        .map(|r| r.record_id.as_str())
        .collect();
    assert_eq!(many, vec!["m-1", "m-2", "m-3", "m-4", "m-5"]);

    assert!(!statuses(&events, "NoSuchDb")[0].success);
    assert!(statuses(&events, "Offline")[0]
        .message
        .starts_with("Connection failed"));
    assert_eq!(report.failed(), 2);
    assert_eq!(report.delivered(), 6);
}

#[test]
fn test_deeply_nested_reply_fails_only_its_target() {
    common::init_logging();
    let server = common::spawn_catalog(common::server_test_catalog());
    let (port, hostile) = common::nesting_target(200_000);

    let targets = vec![
        common::local_target("Default", server.port(), "Default"),
        common::local_target("Nested", port, "Default"),
    ];
    let config = SearchConfig {
        timeout_secs: 5,
        ..SearchConfig::default()
    };
    let search = FederatedSearch::new(Z3950Provider::new(config.clone()), config);

    let mut events: Vec<SearchEvent> = Vec::new();
    let report = search
        .search(&targets, &StructuredQuery::any("author"), 5, &mut events)
        .unwrap();
    hostile.join().unwrap();

    assert_well_formed(&events, &targets);
    assert_eq!(results(&events, "Default").len(), 1);
    assert!(results(&events, "Nested").is_empty());
    assert!(!statuses(&events, "Nested")[0].success);
    assert_eq!(report.failed(), 1);
}

#[test]
fn test_json_lines_stream() {
    let provider = MemoryProvider::new()
        .with_target("A", MemoryTarget::new().with_records(common::numbered_books("a", 2)))
        .with_target("B", MemoryTarget::new());
    let search = FederatedSearch::new(provider, SearchConfig::default());

    let mut sink = JsonLinesSink::new(Vec::new());
    search
        .search(&[target("A"), target("B")], &StructuredQuery::any("x"), 5, &mut sink)
        .unwrap();

    let text = String::from_utf8(sink.into_inner()).unwrap();
    let events: Vec<SearchEvent> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(results(&events, "A").len(), 2);
    assert_eq!(statuses(&events, "B")[0].message, "No records found");
}
