//! Listener management and the per-connection state machine.
//!
//! One [`Manager`] owns every configured listener. A connection walks
//! `reading-header → dispatching → streaming → closing`: the request line
//! is collected under the idle timeout, parsed, matched against the
//! listener's handlers in declaration order, and the winner streams its
//! response through the connection's buffer pipe. Protocol violations
//! crash the connection (RST, no status line); everything else gets a
//! proper Gemini status before the orderly close.

use crate::encryption::TlsConnection;
use crate::handler::HandlerRegistry;
use crate::parse::BadRequest;
use crate::prelude::*;
use crate::settings::{ConfigError, Settings};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

/// Idle budget while the request line trickles in.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-await budget once a handler is producing.
pub const PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);
/// How long shutdown waits for in-flight responses.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const BAD_REQUEST: &[u8] = b"59 Bad Request\r\n";
const NO_HANDLER: &[u8] = b"41 There is no server available to take your request\r\n";

struct Listener {
    name: String,
    host: String,
    port: u16,
    tls: Arc<rustls::ServerConfig>,
    handlers: Vec<Arc<dyn Handler>>,
    cache: Cache,
    pool: BufferPool,
}

/// The configured server: listeners, their handler chains, their caches.
pub struct Manager {
    listeners: Vec<Listener>,
}

impl Manager {
    /// Builds listeners and handlers from loaded settings.
    ///
    /// Handler files with problems (unknown tag, unknown server, bad
    /// patterns, factory failures) are logged and skipped. Unusable TLS
    /// material for a declared listener is fatal.
    pub fn from_settings(settings: &Settings, registry: &HandlerRegistry) -> io::Result<Self> {
        let mut listeners = Vec::new();
        for server in &settings.servers {
            let tls = encryption::load_server_config(&server.cert, &server.key).map_err(
                |err| {
                    error!("listener {:?}: {err}", server.name);
                    err
                },
            )?;
            listeners.push(Listener {
                name: server.name.clone(),
                host: server.host.clone(),
                port: server.port,
                tls,
                handlers: Vec::new(),
                cache: Cache::new(server.cache_size),
                pool: BufferPool::new(),
            });
        }

        for (owner, file) in settings.handlers.iter().enumerate() {
            let common = &file.common;
            let Some(listener) = listeners.iter_mut().find(|l| l.name == common.server) else {
                error!(
                    "{}",
                    ConfigError::message(
                        &file.path,
                        format!("references unknown server {:?}", common.server)
                    )
                );
                continue;
            };
            let Some(factory) = registry.get(&common.handler) else {
                error!(
                    "{}",
                    ConfigError::message(
                        &file.path,
                        format!("unknown handler {:?}", common.handler)
                    )
                );
                continue;
            };
            let matcher = match build_matcher(file) {
                Ok(matcher) => matcher,
                Err(err) => {
                    error!("{err}");
                    continue;
                }
            };
            match factory(handler::FactoryContext {
                file: &file.path,
                doc: &file.doc,
                matcher,
                cache: listener.cache.clone(),
                owner: owner as u64 + 1,
            }) {
                Ok(handler) => {
                    debug!(
                        "handler {:?} ({}) attached to {:?}",
                        file.path, common.handler, common.server
                    );
                    listener.handlers.push(handler);
                }
                Err(err) => error!("{err}"),
            }
        }

        Ok(Self { listeners })
    }

    /// The number of configured listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Binds every listener and serves until ctrl-c, then lets in-flight
    /// responses drain.
    ///
    /// # Errors
    ///
    /// A bind failure is fatal, as is a broken signal handler.
    pub async fn run(self) -> io::Result<()> {
        let active = ActiveConnections::default();
        let mut accept_tasks = Vec::new();

        for listener in self.listeners {
            let socket = TcpListener::bind((listener.host.as_str(), listener.port))
                .await
                .map_err(|err| {
                    error!(
                        "cannot bind {}:{} for {:?}: {err}",
                        listener.host, listener.port, listener.name
                    );
                    err
                })?;
            info!(
                "{:?} listening on {}:{} with {} handler(s)",
                listener.name,
                listener.host,
                listener.port,
                listener.handlers.len()
            );
            accept_tasks.push(tokio::spawn(accept_loop(
                socket,
                Arc::new(listener),
                active.clone(),
            )));
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        for task in &accept_tasks {
            task.abort();
        }
        active.drained(DRAIN_GRACE).await;
        Ok(())
    }
}
impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.listeners.iter().map(|l| {
                format!("{}:{} ({}, {} handlers)", l.host, l.port, l.name, l.handlers.len())
            }))
            .finish()
    }
}

fn build_matcher(file: &crate::settings::HandlerFile) -> Result<handler::Matcher, ConfigError> {
    let compile = |pattern: &str| {
        Regex::new(pattern)
            .map_err(|err| ConfigError::message(&file.path, format!("pattern {pattern:?}: {err}")))
    };
    let host = file.common.host.as_deref().map(compile).transpose()?;
    let path = file.common.path.as_deref().map(compile).transpose()?;
    let rules = file
        .common
        .rules
        .iter()
        .map(|rule| compile(rule))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(handler::Matcher::new(
        host,
        path,
        file.common.base.clone(),
        rules,
    ))
}

async fn accept_loop(socket: TcpListener, listener: Arc<Listener>, active: ActiveConnections) {
    loop {
        match socket.accept().await {
            Ok((stream, addr)) => {
                trace!("accepted {addr} on {:?}", listener.name);
                let listener = Arc::clone(&listener);
                let guard = active.guard();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = handle_connection(stream, addr, &listener).await {
                        debug!("connection from {addr}: {err}");
                    }
                });
            }
            Err(err) => {
                // Transient resource exhaustion must not kill the loop.
                error!("accept on {:?} failed: {err}", listener.name);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    listener: &Listener,
) -> Result<(), Error> {
    let mut tls = TlsConnection::new(stream, Arc::clone(&listener.tls), listener.pool.clone())?;
    match timeout(HEADER_TIMEOUT, tls.handshake()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tls.crash();
            return Err(err);
        }
        Err(_) => {
            tls.crash();
            return Err(Error::TimedOut);
        }
    }

    // ReadingHeader: collect until the first `\n`, crash past 1024 bytes.
    let mut header = Vec::with_capacity(256);
    loop {
        let mut buf = listener.pool.acquire();
        let n = match timeout(HEADER_TIMEOUT, tls.read(&mut buf[..])).await {
            Ok(Ok(0)) => {
                tls.crash();
                return Err(Error::ClosedEarly);
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                tls.crash();
                return Err(err);
            }
            Err(_) => {
                tls.crash();
                return Err(Error::TimedOut);
            }
        };
        header.extend_from_slice(&buf[..n]);
        if let Some(pos) = header.iter().position(|b| *b == b'\n') {
            header.truncate(pos + 1);
            break;
        }
        if header.len() > parse::MAX_REQUEST_LEN {
            tls.crash();
            return Err(Error::RequestTooLong);
        }
    }

    // Dispatching.
    let request = match Request::parse(&header) {
        Ok(request) => request,
        Err(err) => {
            debug!("bad request from {addr}: {err}");
            return match err {
                // No parsed form at all: no status line, just a reset.
                BadRequest::Length | BadRequest::Encoding => {
                    tls.crash();
                    Ok(())
                }
                _ => {
                    let _ = tls.write_all(BAD_REQUEST).await;
                    let _ = timeout(HEADER_TIMEOUT, tls.close()).await;
                    Ok(())
                }
            };
        }
    };

    let selected = listener
        .handlers
        .iter()
        .find(|handler| handler.should_handle(request.host(), request.path()));
    let Some(selected) = selected else {
        info!("\"{}\" -> 41 no handler", request.raw());
        let _ = tls.write_all(NO_HANDLER).await;
        let _ = timeout(HEADER_TIMEOUT, tls.close()).await;
        return Ok(());
    };

    // Streaming: the handler produces into the pipe while the drain loop
    // encrypts onto the socket. Each await runs under the extended
    // processing budget.
    let (writer, mut reader) = pipe::pipe();
    let client = ClientConnection::new(request, writer);
    let handler_fut = selected.handle(client);
    let drain_fut = async {
        loop {
            let chunk = match timeout(PROCESSING_TIMEOUT, reader.next_chunk(BUF_SIZE)).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Ok(()),
                Err(_) => {
                    reader.mark_broken();
                    return Err(Error::TimedOut);
                }
            };
            match timeout(PROCESSING_TIMEOUT, tls.write_all(&chunk)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    reader.mark_broken();
                    return Err(err);
                }
                Err(_) => {
                    reader.mark_broken();
                    return Err(Error::TimedOut);
                }
            }
        }
    };
    let ((), drained) = tokio::join!(handler_fut, drain_fut);

    // Closing.
    match drained {
        Ok(()) => {
            let _ = timeout(HEADER_TIMEOUT, tls.close()).await;
            Ok(())
        }
        Err(err) => {
            tls.crash();
            Err(err)
        }
    }
}

/// Connection counter used to drain on shutdown.
#[derive(Clone, Default)]
struct ActiveConnections {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}
struct ActiveGuard {
    active: ActiveConnections,
}
impl ActiveConnections {
    fn guard(&self) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            active: self.clone(),
        }
    }
    async fn drained(&self, grace: Duration) {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.count.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if timeout(grace, wait).await.is_err() {
            warn!(
                "{} connection(s) still open after {grace:?}; exiting anyway",
                self.count.load(Ordering::Acquire)
            );
        }
    }
}
impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.count.fetch_sub(1, Ordering::Release);
        self.active.idle.notify_waiters();
    }
}
