//! TLS termination for incoming connections.
//!
//! Based on [`rustls`]. Instead of pulling in an adapter crate, the
//! connection drives the [`ServerConnection`] record machine directly
//! against the socket: the session's `wants_read()` / `wants_write()`
//! states decide when encrypted bytes are pumped in or out, and the
//! application only ever sees plaintext through [`TlsConnection::read`]
//! and [`TlsConnection::write_all`]. Encrypted records travel through
//! pool-allocated 1 KiB buffers.

use crate::prelude::*;
use rustls::{ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Reads the certificate chain and private key for a listener and builds
/// its [`ServerConfig`]. Runs synchronously; only called at startup.
///
/// # Errors
///
/// Any unreadable file or unusable TLS material. The caller treats this
/// as fatal for the declared listener.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)?,
    ))?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates in {}", cert_path.display()),
        ));
    }

    let key = read_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Arc::new(config))
}

/// Accepts PKCS#8, RSA (PKCS#1) and SEC1 keys, taking the first one found.
fn read_private_key(path: &Path) -> io::Result<rustls::PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(_) => continue,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("no private key in {}", path.display()),
                ))
            }
        }
    }
}

/// One client's TLS state: the socket, the session, and the EOF flag the
/// socket has reported.
pub struct TlsConnection {
    stream: TcpStream,
    session: ServerConnection,
    pool: BufferPool,
    eof: bool,
}

impl TlsConnection {
    /// Wraps a freshly accepted stream. The handshake has not run yet;
    /// call [`handshake`](Self::handshake) before reading.
    pub fn new(
        stream: TcpStream,
        config: Arc<ServerConfig>,
        pool: BufferPool,
    ) -> Result<Self, Error> {
        let session = ServerConnection::new(config)?;
        Ok(Self {
            stream,
            session,
            pool,
            eof: false,
        })
    }

    /// Pumps one socket read into the session and decrypts what arrived.
    async fn read_tls_once(&mut self) -> Result<(), Error> {
        let mut buf = self.pool.acquire();
        let n = self.stream.read(&mut buf[..]).await?;
        if n == 0 {
            self.eof = true;
            return Ok(());
        }
        let mut slice = &buf[..n];
        while !slice.is_empty() {
            if self.session.read_tls(&mut slice)? == 0 {
                break;
            }
            self.session.process_new_packets().map_err(|err| {
                // The alert describing the failure never makes it out;
                // this connection is about to be crashed anyway.
                Error::Tls(err)
            })?;
        }
        Ok(())
    }

    /// Writes every pending encrypted record to the socket.
    async fn flush_tls(&mut self) -> Result<(), Error> {
        while self.session.wants_write() {
            let mut buf = self.pool.acquire();
            let written = {
                let mut slice: &mut [u8] = &mut buf;
                self.session.write_tls(&mut slice)?
            };
            self.stream.write_all(&buf[..written]).await?;
        }
        Ok(())
    }

    /// Runs the handshake to completion.
    ///
    /// # Errors
    ///
    /// TLS protocol violations, socket errors, and the peer hanging up
    /// mid-flight.
    pub async fn handshake(&mut self) -> Result<(), Error> {
        while self.session.is_handshaking() {
            self.flush_tls().await?;
            if !self.session.is_handshaking() {
                break;
            }
            if self.session.wants_read() {
                self.read_tls_once().await?;
                if self.eof {
                    return Err(Error::ClosedEarly);
                }
            }
        }
        self.flush_tls().await
    }

    /// Reads decrypted bytes, pumping the socket while the session wants
    /// more. `Ok(0)` means the peer is done sending (close-notify or EOF).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(err) => return Err(err.into()),
            }
            if self.eof {
                return Ok(0);
            }
            self.flush_tls().await?;
            self.read_tls_once().await?;
        }
    }

    /// Encrypts and sends `data`, flushing record by record so the
    /// session never buffers more than one chunk of plaintext.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(BUF_SIZE) {
            self.session
                .writer()
                .write_all(chunk)
                .map_err(Error::Io)?;
            self.flush_tls().await?;
        }
        Ok(())
    }

    /// Orderly shutdown: close-notify, drain, FIN.
    pub async fn close(mut self) -> Result<(), Error> {
        self.session.send_close_notify();
        self.flush_tls().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Hard reset. Queued data is discarded and the peer sees an RST
    /// rather than an orderly close.
    pub fn crash(self) {
        let _ = self.stream.set_linger(Some(std::time::Duration::ZERO));
        drop(self.stream);
    }
}

impl Debug for TlsConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("peer", &self.stream.peer_addr().ok())
            .field("handshaking", &self.session.is_handshaking())
            .field("eof", &self.eof)
            .finish()
    }
}
