//! Federated search across several catalogs
//!
//! With no arguments this starts two small local catalog servers, adds an
//! unreachable target, and searches all three so the output shows results
//! and failure statuses side by side. Pass a target registry to search real
//! catalogs instead:
//!
//! ```sh
//! cargo run --example federated_search
//! cargo run --example federated_search -- targets.json "moby dick"
//! RUST_LOG=fedcat=debug cargo run --example federated_search
//! ```
//!
//! Events are printed as JSON lines on stdout; logs go to stderr.

use anyhow::{Context, Result};
use fedcat::bibliographic::build;
use fedcat::z3950::server::{Catalog, CatalogServer, ServerHandle};
use fedcat::{
    BibliographicData, CatalogingProfile, FederatedSearch, JsonLinesSink, SearchConfig,
    SearchError, StructuredQuery, Target, TargetRegistry, Z3950Provider,
};
use std::io;
use std::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedcat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let term = args.get(1).map_or("whale", String::as_str);

    // Servers must outlive the search.
    let mut servers = Vec::new();
    let targets = match args.first() {
        Some(path) => TargetRegistry::load(path)
            .with_context(|| format!("loading targets from {path}"))?
            .to_vec(),
        None => local_targets(&mut servers)?,
    };

    let config = SearchConfig::from_env()?;
    let search = FederatedSearch::new(Z3950Provider::new(config.clone()), config);

    let mut sink = JsonLinesSink::new(io::stdout());
    match search.search(&targets, &StructuredQuery::any(term), 0, &mut sink) {
        Ok(report) => {
            eprintln!(
                "{} targets, {} records, {} failed",
                report.outcomes.len(),
                report.delivered(),
                report.failed()
            );
        },
        Err(SearchError::Cancelled(report)) => {
            eprintln!("cancelled after {} records", report.delivered());
        },
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn local_targets(servers: &mut Vec<ServerHandle>) -> Result<Vec<Target>> {
    let shelves: [(&str, &[(&str, &str, &str)]); 2] = [
        (
            "Harbor",
            &[
                ("h-1", "Moby Dick, or, The whale", "Melville, Herman"),
                ("h-2", "The whale road", "Hoare, Philip"),
                ("h-3", "Two years before the mast", "Dana, Richard Henry"),
            ],
        ),
        (
            "Lighthouse",
            &[
                ("l-1", "Whale nation", "Williams, Heathcote"),
                ("l-2", "To the lighthouse", "Woolf, Virginia"),
            ],
        ),
    ];

    let mut targets = Vec::new();
    for (name, books) in shelves {
        let mut catalog = Catalog::new();
        for &(id, title, author) in books {
            let data = BibliographicData {
                id: id.to_string(),
                title: title.to_string(),
                author: author.to_string(),
                ..BibliographicData::default()
            };
            catalog.add_record("books", build(CatalogingProfile::Rda, &data)?)?;
        }
        let server = CatalogServer::bind("127.0.0.1:0", catalog)?.spawn()?;
        targets.push(Target::new(name, "127.0.0.1", server.port(), "books"));
        servers.push(server);
    }

    // Nothing listens here once the listener is dropped.
    let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    targets.push(Target::new("Offline", "127.0.0.1", port, "books"));
    Ok(targets)
}
