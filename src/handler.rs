//! The handler capability interface and the factory registry.
//!
//! A handler is a match predicate plus a request acceptor. Handlers are
//! shared across all connections; anything per-request lives in the
//! future returned by [`Handler::handle`]. The [`ClientConnection`]
//! façade is all a handler ever sees of the transport: the parsed
//! request, `send`, and `close`.

use crate::prelude::*;
use crate::settings::ConfigError;
use regex::Regex;
use std::future::Future;
use std::pin::Pin;

/// The boxed future returned by [`Handler::handle`].
pub type HandleFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A request producer, selected by host and path.
pub trait Handler: Send + Sync {
    /// Whether this handler wants the request. Must stay synchronous and
    /// cheap; it runs for every handler in declaration order until one
    /// accepts.
    fn should_handle(&self, host: &str, path: &str) -> bool;

    /// Produces the response. The handler owns the response framing: the
    /// first line it sends is the Gemini header. Dropping `client`
    /// without sending anything closes the connection silently.
    fn handle(&self, client: ClientConnection) -> HandleFuture<'_>;
}

/// Host/path match data shared by every handler kind.
#[derive(Debug)]
pub struct Matcher {
    host: Option<Regex>,
    path: Option<Regex>,
    base: Option<String>,
    rules: Vec<Regex>,
}

impl Matcher {
    pub fn new(
        host: Option<Regex>,
        path: Option<Regex>,
        base: Option<String>,
        rules: Vec<Regex>,
    ) -> Self {
        Self {
            host,
            path,
            base,
            rules,
        }
    }

    /// The selection predicate: host pattern, path pattern, then the
    /// allow rules against the path with the base prefix removed.
    #[must_use]
    pub fn matches(&self, host: &str, path: &str) -> bool {
        if let Some(host_re) = &self.host {
            if !host_re.is_match(host) {
                return false;
            }
        }
        if let Some(path_re) = &self.path {
            if !path_re.is_match(path) {
                return false;
            }
        }
        let Some(sub) = self.sub_path(path) else {
            return false;
        };
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.is_match(sub))
    }

    /// The path with the base prefix removed; `None` when the path does
    /// not live under the base.
    #[must_use]
    pub fn sub_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        match &self.base {
            Some(base) => pathutil::strip_base(path, base),
            None => Some(path),
        }
    }

    /// The configured base prefix, if any.
    #[must_use]
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }
}

/// What a factory gets to build a handler from: its YAML document, the
/// compiled match data, the owning listener's cache and the opaque id
/// that namespaces this handler's cache keys.
pub struct FactoryContext<'a> {
    /// The configuration file, for error reports.
    pub file: &'a Path,
    pub doc: &'a serde_yaml::Value,
    pub matcher: Matcher,
    pub cache: Cache,
    pub owner: u64,
}

/// Constructor for one handler kind.
pub type HandlerFactory = fn(FactoryContext) -> Result<Arc<dyn Handler>, ConfigError>;

/// Maps factory tags (the `handler:` key) to constructors.
pub struct HandlerRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl HandlerRegistry {
    /// A registry with the shipped handlers: `filehandler`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("filehandler", filehandler::FileHandler::factory);
        registry
    }

    pub fn register(&mut self, tag: &'static str, factory: HandlerFactory) {
        self.factories.insert(tag, factory);
    }

    /// Looks a tag up; `None` marks an unknown handler kind.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<HandlerFactory> {
        self.factories.get(tag).copied()
    }
}
impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

/// The transport façade handed to a handler for one request.
///
/// Sent bytes travel through the connection's buffer pipe; [`send`]
/// applies backpressure by awaiting room. The first line of the first
/// `send` is logged as the response header.
pub struct ClientConnection {
    request: Request,
    writer: pipe::PipeWriter,
    header_sent: bool,
}

impl ClientConnection {
    pub(crate) fn new(request: Request, writer: pipe::PipeWriter) -> Self {
        Self {
            request,
            writer,
            header_sent: false,
        }
    }

    /// The parsed request this connection carries.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Streams bytes to the peer. An `Err` means the peer is gone and
    /// production should stop.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), pipe::Broken> {
        if !self.header_sent && !bytes.is_empty() {
            self.header_sent = true;
            let line = bytes
                .split(|b| *b == b'\n')
                .next()
                .unwrap_or(bytes);
            info!(
                "\"{}\" -> {}",
                self.request.raw(),
                String::from_utf8_lossy(line).trim_end()
            );
        }
        self.writer.write(bytes).await
    }

    /// Finishes the response. Queued bytes still drain to the socket
    /// before the connection closes.
    pub fn close(self) {
        self.writer.close();
    }
}
impl Debug for ClientConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("request", &self.request)
            .field("header_sent", &self.header_sent)
            .finish()
    }
}
