//! Parsing of the single-line Gemini request.
//!
//! The grammar is deliberately strict: a case-insensitive `gemini` scheme,
//! a literal `://`, a non-empty host free of `:/?`, an optional decimal
//! port in `1..=65535`, an optional path starting with `/` and an optional
//! query after `?`. Anything else is a bad request. Whitespace trimming is
//! pinned to ASCII (` \t\r\n\x0b\x0c`) so behavior never depends on
//! locale.

use crate::prelude::*;

/// Longest permitted request line, terminating `\r\n` included.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Default port when the request names none.
pub const DEFAULT_PORT: u16 = 1965;

/// Why a request line was rejected. Only surfaced at `debug` level; the
/// peer always just gets `59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadRequest {
    /// Longer than [`MAX_REQUEST_LEN`] bytes.
    Length,
    /// Not valid UTF-8.
    Encoding,
    /// Scheme is not `gemini` or the `://` separator is malformed.
    Scheme,
    /// Host is empty or starts with `/`.
    Host,
    /// Port is not a decimal integer in `1..=65535`.
    Port,
}
impl Display for BadRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Length => "request line too long",
            Self::Encoding => "request line is not UTF-8",
            Self::Scheme => "scheme is not gemini://",
            Self::Host => "missing or malformed host",
            Self::Port => "port out of range",
        })
    }
}

const fn is_ascii_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !is_ascii_space(*b))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !is_ascii_space(*b))
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// A parsed Gemini request line. Immutable after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    raw: String,
    host: String,
    port: u16,
    path: String,
    query: String,
}

impl Request {
    /// Parses a raw request line.
    ///
    /// `raw` is the bytes up to and including the first `\n` (a lone `\n`
    /// is accepted alongside `\r\n`). Leading and trailing ASCII
    /// whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns the first [`BadRequest`] violation, checked in the order of
    /// the grammar.
    pub fn parse(raw: &[u8]) -> Result<Self, BadRequest> {
        if raw.len() > MAX_REQUEST_LEN {
            return Err(BadRequest::Length);
        }
        let line = str::from_utf8(trim_ascii(raw)).map_err(|_| BadRequest::Encoding)?;

        let scheme = line.get(..6).ok_or(BadRequest::Scheme)?;
        if !scheme.eq_ignore_ascii_case("gemini") {
            return Err(BadRequest::Scheme);
        }
        let rest = line[6..].strip_prefix("://").ok_or(BadRequest::Scheme)?;

        let host_end = rest
            .find(|c| matches!(c, ':' | '/' | '?' | '\r' | '\n'))
            .unwrap_or(rest.len());
        let host = &rest[..host_end];
        if host.is_empty() || rest.starts_with('/') {
            return Err(BadRequest::Host);
        }
        let mut rest = &rest[host_end..];

        let port = if let Some(after) = rest.strip_prefix(':') {
            let digits_end = after
                .find(|c| matches!(c, '/' | '?' | '\r' | '\n'))
                .unwrap_or(after.len());
            let digits = &after[..digits_end];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(BadRequest::Port);
            }
            let port: u32 = digits.parse().map_err(|_| BadRequest::Port)?;
            if !(1..=65535).contains(&port) {
                return Err(BadRequest::Port);
            }
            rest = &after[digits_end..];
            port as u16
        } else {
            DEFAULT_PORT
        };

        // The path ends at the first `?` or terminator, the query at the
        // first terminator; bytes past a terminator are not part of the
        // request.
        let path_end = rest
            .find(|c| matches!(c, '?' | '\r' | '\n'))
            .unwrap_or(rest.len());
        let path = &rest[..path_end];
        let query = match rest[path_end..].strip_prefix('?') {
            Some(after) => {
                let query_end = after
                    .find(|c| matches!(c, '\r' | '\n'))
                    .unwrap_or(after.len());
                &after[..query_end]
            }
            None => "",
        };

        Ok(Self {
            raw: line.to_owned(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
            query: query.to_owned(),
        })
    }

    /// The trimmed request line as received, without the terminator.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
    /// The host component. Never empty, never contains `:/?`.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
    /// The port, [`DEFAULT_PORT`] when the request named none.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
    /// The path, possibly empty; a trailing `/` is preserved.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
    /// The query without its leading `?`, possibly empty.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gemini://{}:{}{}{}{}",
            self.host,
            self.port,
            self.path,
            if self.query.is_empty() { "" } else { "?" },
            self.query
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_request() {
        let req = Request::parse(b"gemini://example.org:1966/docs/a.gmi?q=1\r\n").unwrap();
        assert_eq!(req.host(), "example.org");
        assert_eq!(req.port(), 1966);
        assert_eq!(req.path(), "/docs/a.gmi");
        assert_eq!(req.query(), "q=1");
    }

    #[test]
    fn port_defaults_without_colon() {
        let req = Request::parse(b"gemini://localhost/hello.gmi\r\n").unwrap();
        assert_eq!(req.port(), DEFAULT_PORT);
        assert_eq!(req.path(), "/hello.gmi");
        assert_eq!(req.query(), "");
    }

    #[test]
    fn host_only() {
        let req = Request::parse(b"gemini://localhost\r\n").unwrap();
        assert_eq!(req.host(), "localhost");
        assert_eq!(req.path(), "");
        assert_eq!(req.query(), "");
    }

    #[test]
    fn host_and_query_without_path() {
        let req = Request::parse(b"gemini://localhost?asdf\r\n").unwrap();
        assert_eq!(req.path(), "");
        assert_eq!(req.query(), "asdf");
    }

    #[test]
    fn trailing_slash_is_distinguished() {
        let with = Request::parse(b"gemini://h/dir/\r\n").unwrap();
        let without = Request::parse(b"gemini://h/dir\r\n").unwrap();
        assert_eq!(with.path(), "/dir/");
        assert_eq!(without.path(), "/dir");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert!(Request::parse(b"GEMINI://h/\r\n").is_ok());
        assert!(Request::parse(b"Gemini://h/\r\n").is_ok());
    }

    #[test]
    fn wrong_scheme_fails() {
        assert_eq!(
            Request::parse(b"https://h/\r\n").unwrap_err(),
            BadRequest::Scheme
        );
        assert_eq!(
            Request::parse(b"gemini:/h\r\n").unwrap_err(),
            BadRequest::Scheme
        );
        assert_eq!(Request::parse(b"gem\r\n").unwrap_err(), BadRequest::Scheme);
    }

    #[test]
    fn four_slashes_fail() {
        // `gemini:////` would read as an empty host starting with `/`.
        assert_eq!(
            Request::parse(b"gemini:////etc/passwd\r\n").unwrap_err(),
            BadRequest::Host
        );
    }

    #[test]
    fn empty_host_fails() {
        assert_eq!(
            Request::parse(b"gemini://\r\n").unwrap_err(),
            BadRequest::Host
        );
        assert_eq!(
            Request::parse(b"gemini://?q\r\n").unwrap_err(),
            BadRequest::Host
        );
    }

    #[test]
    fn port_bounds() {
        assert_eq!(Request::parse(b"gemini://h:65535/\r\n").unwrap().port(), 65535);
        assert_eq!(Request::parse(b"gemini://h:1/\r\n").unwrap().port(), 1);
        assert_eq!(
            Request::parse(b"gemini://h:0/\r\n").unwrap_err(),
            BadRequest::Port
        );
        assert_eq!(
            Request::parse(b"gemini://h:65536/\r\n").unwrap_err(),
            BadRequest::Port
        );
        assert_eq!(
            Request::parse(b"gemini://h:/\r\n").unwrap_err(),
            BadRequest::Port
        );
        assert_eq!(
            Request::parse(b"gemini://h:12ab/\r\n").unwrap_err(),
            BadRequest::Port
        );
    }

    #[test]
    fn embedded_terminator_ends_each_component() {
        // The manager truncates at the first `\n`, so an embedded `\r`
        // can reach the parser; everything after it is dropped.
        let req = Request::parse(b"gemini://h/a\rb\r\n").unwrap();
        assert_eq!(req.path(), "/a");
        assert_eq!(req.query(), "");

        let req = Request::parse(b"gemini://h/p?q\rjunk\r\n").unwrap();
        assert_eq!(req.path(), "/p");
        assert_eq!(req.query(), "q");

        let req = Request::parse(b"gemini://h\rjunk\r\n").unwrap();
        assert_eq!(req.host(), "h");
        assert_eq!(req.path(), "");
        assert_eq!(req.query(), "");

        let req = Request::parse(b"gemini://h:7\rjunk\r\n").unwrap();
        assert_eq!(req.port(), 7);
        assert_eq!(req.path(), "");
    }

    #[test]
    fn oversized_line_fails() {
        let mut raw = b"gemini://h/".to_vec();
        raw.resize(1025, b'a');
        assert_eq!(Request::parse(&raw).unwrap_err(), BadRequest::Length);
    }

    #[test]
    fn whitespace_trim_is_idempotent() {
        let req = Request::parse(b"  \tgemini://h/a \r\n").unwrap();
        assert_eq!(req.raw(), "gemini://h/a");
        let again = Request::parse(req.raw().as_bytes()).unwrap();
        assert_eq!(again.raw(), req.raw());
    }

    #[test]
    fn round_trip() {
        for (host, port, path, query) in [
            ("example.org", Some(1965_u16), "/", None),
            ("localhost", None, "/a/b.gmi", Some("x=y")),
            ("h", Some(42), "", None),
            ("sub.domain.tld", Some(65535), "/d/", Some("")),
        ] {
            let mut line = format!("gemini://{host}");
            if let Some(p) = port {
                line.push_str(&format!(":{p}"));
            }
            line.push_str(path);
            if let Some(q) = query {
                line.push_str(&format!("?{q}"));
            }
            line.push_str("\r\n");

            let req = Request::parse(line.as_bytes()).unwrap();
            assert_eq!(req.host(), host);
            assert_eq!(req.port(), port.unwrap_or(DEFAULT_PORT));
            assert_eq!(req.path(), path);
            assert_eq!(req.query(), query.unwrap_or(""));
        }
    }
}
