//! Property-style checks of the request parser over a generated grid of
//! hosts, ports, paths and queries.

use fyr::parse::{BadRequest, Request, DEFAULT_PORT, MAX_REQUEST_LEN};

const HOSTS: &[&str] = &["localhost", "example.org", "sub.deep.example.org", "x"];
const PORTS: &[Option<u16>] = &[None, Some(1), Some(1965), Some(7070), Some(65535)];
const PATHS: &[&str] = &["", "/", "/index.gmi", "/a/b/c", "/dir/", "/with space"];
const QUERIES: &[Option<&str>] = &[None, Some(""), Some("q"), Some("a=1&b=2")];

#[test]
fn round_trip_over_the_grid() {
    for host in HOSTS {
        for port in PORTS {
            for path in PATHS {
                for query in QUERIES {
                    let mut line = format!("gemini://{host}");
                    if let Some(port) = port {
                        line.push_str(&format!(":{port}"));
                    }
                    line.push_str(path);
                    if let Some(query) = query {
                        line.push('?');
                        line.push_str(query);
                    }
                    line.push_str("\r\n");

                    let request = Request::parse(line.as_bytes())
                        .unwrap_or_else(|err| panic!("{line:?} rejected: {err}"));
                    assert_eq!(request.host(), *host, "in {line:?}");
                    assert_eq!(request.port(), port.unwrap_or(DEFAULT_PORT), "in {line:?}");
                    assert_eq!(request.path(), *path, "in {line:?}");
                    assert_eq!(request.query(), query.unwrap_or(""), "in {line:?}");
                }
            }
        }
    }
}

#[test]
fn omitted_port_maps_to_default_only_without_colon() {
    let without = Request::parse(b"gemini://h/p\r\n").unwrap();
    assert_eq!(without.port(), DEFAULT_PORT);
    // An explicit default port is still an explicit port.
    let with = Request::parse(b"gemini://h:1965/p\r\n").unwrap();
    assert_eq!(with.port(), 1965);
    // A colon with nothing behind it is not "omitted".
    assert_eq!(
        Request::parse(b"gemini://h:/p\r\n").unwrap_err(),
        BadRequest::Port
    );
}

#[test]
fn non_gemini_schemes_fail() {
    for line in [
        "https://example.org/\r\n",
        "gopher://example.org/\r\n",
        "geminis://example.org/\r\n",
        "gemini:/example.org/\r\n",
        "://example.org/\r\n",
    ] {
        assert!(
            Request::parse(line.as_bytes()).is_err(),
            "{line:?} should be rejected"
        );
    }
}

#[test]
fn oversized_headers_fail() {
    let mut line = b"gemini://example.org/".to_vec();
    while line.len() <= MAX_REQUEST_LEN {
        line.push(b'a');
    }
    assert_eq!(Request::parse(&line).unwrap_err(), BadRequest::Length);

    // Exactly at the limit still parses.
    let mut line = b"gemini://example.org/".to_vec();
    while line.len() < MAX_REQUEST_LEN - 2 {
        line.push(b'a');
    }
    line.extend_from_slice(b"\r\n");
    assert!(Request::parse(&line).is_ok());
}

#[test]
fn surrounding_whitespace_is_trimmed_idempotently() {
    for line in [
        "gemini://h/p\r\n",
        " gemini://h/p \r\n",
        "\t\x0b\x0cgemini://h/p\n",
    ] {
        let first = Request::parse(line.as_bytes()).unwrap();
        assert_eq!(first.raw(), "gemini://h/p");
        let second = Request::parse(first.raw().as_bytes()).unwrap();
        assert_eq!(second.raw(), first.raw());
        assert_eq!(second.path(), first.path());
    }
}
