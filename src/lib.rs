//! Fyr is a TLS-terminating [Gemini](https://geminiprotocol.net) server.
//!
//! Listeners are declared in `servers/*.yml`, request handlers in
//! `handlers/*.yml`. The shipped [`filehandler`] serves a sandboxed
//! directory tree, with generated listings and CGI-style scripts, behind
//! a single-flight response [`cache`]. Everything runs cooperatively on
//! one reactor thread.
//!
//! The layering, outside in:
//! 1. [`manager`] — listeners, accept loops, the per-connection state
//!    machine.
//! 2. [`encryption`] — the bridge between the TLS engine and the socket.
//! 3. [`handler`] — the capability interface request producers implement.
//! 4. [`cache`] — coalescing storage for produced responses.

// Module declaration
pub mod cache;
pub mod encryption;
pub mod error;
pub mod executor;
pub mod filehandler;
pub mod handler;
pub mod manager;
pub mod parse;
pub mod pathutil;
pub mod pipe;
pub mod pool;
pub mod prelude;
pub mod settings;

// When the user only imports crate::* and not crate::prelude::*
pub use cache::{Artifact, Cache, CacheKey};
pub use error::Error;
pub use handler::{ClientConnection, Handler, HandlerRegistry};
pub use manager::Manager;
pub use parse::Request;
pub use settings::Settings;

pub const SERVER_NAME: &str = "Fyr";
pub const SERVER_SOFTWARE: &str = concat!("fyr/", env!("CARGO_PKG_VERSION"));
