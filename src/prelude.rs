//! **The Fyr prelude**
//!
//! Keeps module dependencies obvious and imports consistent across the
//! server. Brings in the commonly used std items, the `log` macros, and
//! the crate's own types.

// External commonly used dependencies
pub use bytes::{Bytes, BytesMut};
pub use log::{debug, error, info, trace, warn};
pub use std::cmp;
pub use std::collections::HashMap;
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::io;
pub use std::path::{Path, PathBuf};
pub use std::str;
pub use std::sync::{Arc, Mutex};

// Modules
pub use crate::cache;
pub use crate::encryption;
pub use crate::error;
pub use crate::executor;
pub use crate::filehandler;
pub use crate::handler;
pub use crate::manager;
pub use crate::parse;
pub use crate::pathutil;
pub use crate::pipe;
pub use crate::pool;
pub use crate::settings;

// Crate types
pub use crate::cache::{Artifact, Cache, CacheKey};
pub use crate::error::Error;
pub use crate::handler::{ClientConnection, Handler};
pub use crate::parse::Request;
pub use crate::pool::{BufferPool, BUF_SIZE};
pub use crate::{SERVER_NAME, SERVER_SOFTWARE};
