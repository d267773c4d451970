//! Common test helpers and utilities shared across test suite.

#![allow(dead_code)]

use fedcat::z3950::apdu::{self, Apdu, InitResponse};
use fedcat::z3950::ber::BitString;
use fedcat::z3950::server::{Catalog, CatalogServer, ServerHandle};
use fedcat::{BibliographicData, CatalogingProfile, Target};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bibliographic data for a simple book.
pub fn book_data(id: &str, title: &str, author: &str) -> BibliographicData {
    BibliographicData {
        id: id.to_string(),
        title: title.to_string(),
        author: author.to_string(),
        ..BibliographicData::default()
    }
}

/// ISO 2709 bytes for a simple RDA book.
pub fn book(id: &str, title: &str, author: &str) -> Vec<u8> {
    fedcat::bibliographic::build(CatalogingProfile::Rda, &book_data(id, title, author))
        .expect("build test record")
}

/// `n` numbered books whose 001 is `prefix-i`.
pub fn numbered_books(prefix: &str, n: usize) -> Vec<Vec<u8>> {
    (1..=n)
        .map(|i| book(&format!("{prefix}-{i}"), &format!("Book {i}"), "Author"))
        .collect()
}

/// The single-record catalog used by the end-to-end scenarios.
pub fn server_test_catalog() -> Catalog {
    let data = BibliographicData {
        id: "srv-1".to_string(),
        title: "Server Test Title".to_string(),
        author: "Author".to_string(),
        isbn: "ISBN".to_string(),
        publisher: "Pub".to_string(),
        year: "2024".to_string(),
        ..BibliographicData::default()
    };
    let mut catalog = Catalog::new();
    catalog
        .add_record(
            "Default",
            fedcat::bibliographic::build(CatalogingProfile::Aacr2, &data).expect("build"),
        )
        .expect("add record");
    catalog
}

/// Serve `catalog` on an ephemeral local port.
pub fn spawn_catalog(catalog: Catalog) -> ServerHandle {
    CatalogServer::bind("127.0.0.1:0", catalog)
        .and_then(CatalogServer::spawn)
        .expect("start catalog server")
}

/// Target pointing at a local server.
pub fn local_target(name: &str, port: u16, database: &str) -> Target {
    Target::new(name, "127.0.0.1", port, database)
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
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

/// A target that accepts Init, echoes Close, and records the name of every
/// APDU it receives on its single connection.
pub fn recording_target() -> (u16, JoinHandle<Vec<&'static str>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return Vec::new();
        };
        let mut buffer = Vec::new();
        let mut seen = Vec::new();
        while let Some(request) = read_apdu(&mut stream, &mut buffer) {
            seen.push(request.name());
            let reply = match request {
                Apdu::InitRequest(_) => Apdu::InitResponse(InitResponse {
                    reference_id: None,
                    protocol_version: BitString::with_bits(3, &[0, 1, 2]),
                    options: BitString::with_bits(15, &[0, 1, 14]),
                    preferred_message_size: 65_536,
                    exceptional_record_size: 65_536,
                    result: true,
                    implementation_id: None,
                    implementation_name: Some("recorder".to_string()),
                    implementation_version: None,
                }),
                Apdu::Close(close) => Apdu::Close(close),
                _ => break,
            };
            if stream.write_all(&apdu::encode(&reply)).is_err() {
                break;
            }
        }
        seen
    });
    (port, handle)
}

/// A target that answers Init with an InitResponse made of `levels` nested
/// indefinite-length sequences that are never closed.
pub fn nesting_target(levels: usize) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut buffer = Vec::new();
        if read_apdu(&mut stream, &mut buffer).is_none() {
            return;
        }
        let mut reply = vec![0xB5, 0x80];
        for _ in 0..levels {
            reply.extend_from_slice(&[0x30, 0x80]);
        }
        // The client hangs up part way through.
        let _ = stream.write_all(&reply);
        let _ = stream.read_to_end(&mut buffer);
    });
    (port, handle)
}
