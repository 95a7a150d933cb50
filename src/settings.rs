//! Typed views over the YAML configuration tree.
//!
//! Two directories under the configuration root are read at startup:
//! `servers/*.yml` (one listener each) and `handlers/*.yml` (one handler
//! each). A file that fails to parse is reported with its source location
//! and skipped; startup only aborts when no listener loads at all.

use crate::prelude::*;
use serde::Deserialize;
use std::fs;

fn default_listen() -> String {
    "0.0.0.0".to_owned()
}
const fn default_port() -> u16 {
    1965
}

/// One `servers/*.yml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// The name handlers reference through their `server` key.
    pub name: String,
    /// Listen address.
    #[serde(default = "default_listen")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// Response-cache bound in bytes; `0` leaves it unbounded.
    #[serde(default)]
    pub cache_size: usize,
}

/// The keys every `handlers/*.yml` document shares. Handler-specific keys
/// stay in the raw document and are interpreted by the factory.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerCommon {
    /// Factory tag, e.g. `filehandler`.
    pub handler: String,
    /// Name of the listener this handler serves.
    pub server: String,
    /// Host pattern (regular expression); absent accepts every host.
    #[serde(default)]
    pub host: Option<String>,
    /// Path pattern (regular expression); absent accepts every path.
    #[serde(default)]
    pub path: Option<String>,
    /// URL prefix stripped before rule checks and filesystem joins.
    #[serde(default)]
    pub base: Option<String>,
    /// Allow rules, matched against the path with `base` removed.
    #[serde(default)]
    pub rules: Vec<String>,
}

/// A parsed handler document: the shared keys plus the raw value for the
/// factory.
#[derive(Debug, Clone)]
pub struct HandlerFile {
    pub path: PathBuf,
    pub common: HandlerCommon,
    pub doc: serde_yaml::Value,
}

/// A configuration failure tied to its source.
#[derive(Debug)]
pub struct ConfigError {
    pub file: PathBuf,
    pub message: String,
    /// 1-based line and column, when the parser reported one.
    pub location: Option<(usize, usize)>,
}

impl ConfigError {
    pub fn parse(file: impl Into<PathBuf>, err: &serde_yaml::Error) -> Self {
        Self {
            file: file.into(),
            message: err.to_string(),
            location: err.location().map(|l| (l.line(), l.column())),
        }
    }
    pub fn message(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
            location: None,
        }
    }
}
impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.location {
            Some((line, column)) => write!(
                f,
                "{}:{}:{}: {}",
                self.file.display(),
                line,
                column,
                self.message
            ),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}
impl std::error::Error for ConfigError {}

/// Everything the configuration root yielded. Files that failed are
/// already logged; they appear in `errors` for the caller to inspect.
#[derive(Debug, Default)]
pub struct Settings {
    pub servers: Vec<ServerSettings>,
    pub handlers: Vec<HandlerFile>,
    pub errors: Vec<ConfigError>,
}

impl Settings {
    /// Reads `servers/` and `handlers/` under `root`. Runs synchronous
    /// file I/O; only called at startup.
    pub fn load(root: &Path) -> io::Result<Self> {
        let mut settings = Self::default();

        for path in yaml_files(&root.join("servers"))? {
            match fs::read_to_string(&path)
                .map_err(|err| ConfigError::message(&path, err.to_string()))
                .and_then(|text| {
                    serde_yaml::from_str::<ServerSettings>(&text)
                        .map_err(|err| ConfigError::parse(&path, &err))
                }) {
                Ok(server) => {
                    if settings.servers.iter().any(|s| s.name == server.name) {
                        settings.skip(ConfigError::message(
                            &path,
                            format!("duplicate server name {:?}", server.name),
                        ));
                    } else {
                        debug!(
                            "loaded server {:?} on {}:{}",
                            server.name, server.host, server.port
                        );
                        settings.servers.push(server);
                    }
                }
                Err(err) => settings.skip(err),
            }
        }

        for path in yaml_files(&root.join("handlers"))? {
            match fs::read_to_string(&path)
                .map_err(|err| ConfigError::message(&path, err.to_string()))
                .and_then(|text| {
                    serde_yaml::from_str::<serde_yaml::Value>(&text)
                        .map_err(|err| ConfigError::parse(&path, &err))
                }) {
                Ok(doc) => match serde_yaml::from_value::<HandlerCommon>(doc.clone()) {
                    Ok(common) => settings.handlers.push(HandlerFile { path, common, doc }),
                    Err(err) => settings.skip(ConfigError::parse(&path, &err)),
                },
                Err(err) => settings.skip(err),
            }
        }

        Ok(settings)
    }

    fn skip(&mut self, err: ConfigError) {
        error!("{err}");
        self.errors.push(err);
    }

    /// The listener a handler document references, if it loaded.
    #[must_use]
    pub fn server_named(&self, name: &str) -> Option<&ServerSettings> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// The `.yml`/`.yaml` files directly under `dir`, sorted by name so
/// handler declaration order is stable. A missing directory is just
/// empty.
fn yaml_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}
