//! The file-serving handler.
//!
//! Resolves request paths against a sandboxed root: normalization
//! redirects, allow-rule checks, realpath containment, directory indexes
//! and generated listings, chunked file streaming, and CGI execution for
//! configured extensions. Everything except CGI output is produced
//! through the listener's single-flight cache, so concurrent requests
//! for the same resource trigger one production.

use crate::prelude::*;
use crate::executor::{find_program, Executor};
use crate::handler::{FactoryContext, HandleFuture, Matcher};
use crate::settings::ConfigError;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Deserialize;
use std::ffi::OsString;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::time::Duration;

const ILLEGAL: &str = "51 Illegal File\r\n";
const NOT_FOUND: &str = "51 File does not exist\r\n";
const ESCAPED: &str = "51 You are not allowed to access this file\r\n";
const CGI_FAILED: &str = "42 Could not run script\r\n";
const RUNTIME_FAILED: &str = "42 Request failed\r\n";
const BAD_PATH: &str = "59 Bad Request\r\n";

/// The handler-specific keys of a `handler: filehandler` document.
#[derive(Debug, Deserialize)]
struct FileSettings {
    /// Directory served; resolved to its realpath at load time.
    root: PathBuf,
    /// Allow rules for absolute filesystem paths. Empty means "anything
    /// under `root`".
    #[serde(default)]
    allow: Vec<String>,
    /// Generate listings for directories without an index.
    #[serde(default)]
    read_dirs: bool,
    /// File suffixes executed as CGI instead of being read.
    #[serde(default)]
    cgi_extensions: Vec<String>,
    /// Extension → interpreter program, resolved against `PATH` once.
    #[serde(default)]
    cgi_interpreter: HashMap<String, String>,
    /// Extra environment for CGI children.
    #[serde(default)]
    environment: HashMap<String, String>,
    /// Cache lifetime for produced responses, in seconds. `0` keeps them
    /// until size eviction claims them.
    #[serde(default)]
    cache_time: f64,
}

/// Serves a directory tree, with optional CGI.
pub struct FileHandler {
    matcher: Matcher,
    root: PathBuf,
    allow: Vec<Regex>,
    read_dirs: bool,
    cgi_extensions: Vec<String>,
    interpreters: HashMap<String, PathBuf>,
    environment: Vec<(String, OsString)>,
    cache: Cache,
    owner: u64,
    lifetime: Duration,
    pool: BufferPool,
}

enum Outcome {
    Artifact(Artifact),
    Cgi {
        script: PathBuf,
        interpreter: Option<PathBuf>,
    },
}

enum FileError {
    /// Pre-stat rule denial.
    Illegal,
    /// Missing file, unreadable directory.
    NotFound,
    /// Realpath escaped the sandbox.
    Escaped,
    /// Runtime filesystem failure.
    Io(io::Error),
}
impl From<io::Error> for FileError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl FileHandler {
    /// The `filehandler` factory registered under that tag.
    pub fn factory(ctx: FactoryContext) -> Result<Arc<dyn Handler>, ConfigError> {
        let settings: FileSettings = serde_yaml::from_value(ctx.doc.clone())
            .map_err(|err| ConfigError::parse(ctx.file, &err))?;

        let root = std::fs::canonicalize(&settings.root).map_err(|err| {
            ConfigError::message(
                ctx.file,
                format!("root {}: {err}", settings.root.display()),
            )
        })?;

        let mut allow = Vec::with_capacity(settings.allow.len());
        for rule in &settings.allow {
            allow.push(Regex::new(rule).map_err(|err| {
                ConfigError::message(ctx.file, format!("allow rule {rule:?}: {err}"))
            })?);
        }

        let mut interpreters = HashMap::new();
        for (ext, program) in &settings.cgi_interpreter {
            let resolved = find_program(program).ok_or_else(|| {
                ConfigError::message(ctx.file, format!("interpreter {program:?} not found"))
            })?;
            interpreters.insert(ext.trim_start_matches('.').to_owned(), resolved);
        }

        let environment = settings
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), OsString::from(v)))
            .collect();

        Ok(Arc::new(Self {
            matcher: ctx.matcher,
            root,
            allow,
            read_dirs: settings.read_dirs,
            cgi_extensions: settings
                .cgi_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_owned())
                .collect(),
            interpreters,
            environment,
            cache: ctx.cache,
            owner: ctx.owner,
            lifetime: Duration::from_secs_f64(settings.cache_time.max(0.0)),
            pool: BufferPool::new(),
        }))
    }

    /// Pre-stat rule check on the joined candidate path.
    fn allowed(&self, candidate: &Path) -> bool {
        if self.allow.is_empty() {
            pathutil::is_within(&self.root, candidate)
        } else {
            let text = candidate.to_string_lossy();
            self.allow.iter().any(|rule| rule.is_match(&text))
        }
    }

    fn is_cgi(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.cgi_extensions.iter().any(|suffix| suffix == ext)
    }

    async fn handle_request(&self, mut client: ClientConnection) {
        let request = client.request().clone();

        let Ok(decoded) = percent_decode_str(request.path()).decode_utf8() else {
            let _ = client.send(BAD_PATH.as_bytes()).await;
            return client.close();
        };
        let decoded = decoded.into_owned();

        // Step 1: normalization redirect. An empty path normalizes to `/`.
        let norm = pathutil::del_ups(&decoded);
        if norm != decoded {
            let _ = client.send(format!("31 {norm}\r\n").as_bytes()).await;
            return client.close();
        }

        // Step 2: strip the base, join onto the root.
        let Some(sub) = self.matcher.sub_path(&norm) else {
            let _ = client.send(ILLEGAL.as_bytes()).await;
            return client.close();
        };
        let candidate = pathutil::join(&self.root, &pathutil::del_ups(sub));

        // Step 3: pre-stat rule check.
        if !self.allowed(&candidate) {
            let _ = client.send(ILLEGAL.as_bytes()).await;
            return client.close();
        }

        // Coalesce on <host>:<port><path>.
        let key = CacheKey::new(
            self.owner,
            format!("{}:{}{}", request.host(), request.port(), norm),
        );
        match self.cache.get_notified(&key) {
            cache::Lookup::Ready(artifact) => {
                trace!("cache hit for {}", key.name());
                return send_artifact(client, &artifact).await;
            }
            cache::Lookup::Waiting(subscription) => match subscription.wait().await {
                cache::Notified::Ready(artifact) => {
                    return send_artifact(client, &artifact).await;
                }
                // The producer bailed; this request inherits the role.
                cache::Notified::Produce => {}
            },
            cache::Lookup::Absent => {}
        }

        self.cache.loading(&key);
        match self.produce(&norm, &candidate).await {
            Ok(Outcome::Artifact(artifact)) => {
                self.cache.add(&key, artifact.clone());
                send_artifact(client, &artifact).await;
            }
            Ok(Outcome::Cgi {
                script,
                interpreter,
            }) => {
                // CGI output is streamed, never cached; a waiting
                // subscriber takes over production of its own response.
                self.cache.cancel(&key);
                self.run_cgi(&mut client, &request, &norm, &script, interpreter.as_deref())
                    .await;
                client.close();
            }
            Err(err) => {
                self.cache.cancel(&key);
                let status: &str = match &err {
                    FileError::Illegal => ILLEGAL,
                    FileError::NotFound => NOT_FOUND,
                    FileError::Escaped => ESCAPED,
                    FileError::Io(io_err) => {
                        warn!("serving {} failed: {io_err}", candidate.display());
                        RUNTIME_FAILED
                    }
                };
                let _ = client.send(status.as_bytes()).await;
                client.close();
            }
        }
    }

    /// Stat → directory/file resolution → artifact or CGI decision.
    async fn produce(&self, norm: &str, candidate: &Path) -> Result<Outcome, FileError> {
        let meta = fs::metadata(candidate)
            .await
            .map_err(|_| FileError::NotFound)?;

        if meta.is_dir() {
            if !norm.ends_with('/') {
                return Ok(Outcome::Artifact(self.artifact(31, format!("{norm}/"), Bytes::new())));
            }
            // Realpath sandbox before the directory is enumerated; stat
            // follows symlinks, so the joined path alone proves nothing.
            let real = fs::canonicalize(candidate)
                .await
                .map_err(|_| FileError::NotFound)?;
            if !pathutil::is_within(&self.root, &real) && !self.allowed(&real) {
                return Err(FileError::Escaped);
            }
            if let Some(index) = self.find_index(&real).await? {
                return self.read_file(norm, &index).await;
            }
            if !self.read_dirs {
                return Err(FileError::NotFound);
            }
            let listing = self.directory_listing(norm, &real).await?;
            return Ok(Outcome::Artifact(self.artifact(20, "text/gemini", listing)));
        }

        if norm.ends_with('/') {
            let target = norm.trim_end_matches('/');
            let target = if target.is_empty() { "/" } else { target };
            return Ok(Outcome::Artifact(self.artifact(31, target, Bytes::new())));
        }
        self.read_file(norm, candidate).await
    }

    /// The first `index.*` entry that passes the allow rules, in name
    /// order.
    async fn find_index(&self, dir: &Path) -> Result<Option<PathBuf>, FileError> {
        let mut entries = fs::read_dir(dir).await?;
        let mut indexes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("index.") && self.allowed(&entry.path()) {
                indexes.push(entry.path());
            }
        }
        indexes.sort();
        Ok(indexes.into_iter().next())
    }

    /// Realpath sandbox, CGI decision, then a chunked read.
    async fn read_file(&self, norm: &str, candidate: &Path) -> Result<Outcome, FileError> {
        let real = fs::canonicalize(candidate)
            .await
            .map_err(|_| FileError::NotFound)?;
        if !pathutil::is_within(&self.root, &real) && !self.allowed(&real) {
            return Err(FileError::Escaped);
        }

        if self.is_cgi(&real) {
            let interpreter = real
                .extension()
                .and_then(|e| e.to_str())
                .and_then(|ext| self.interpreters.get(ext))
                .cloned();
            return Ok(Outcome::Cgi {
                script: real,
                interpreter,
            });
        }

        let mut file = fs::File::open(&real).await?;
        let mut body = BytesMut::new();
        let mut buf = self.pool.acquire();
        loop {
            let n = file.read(&mut buf[..]).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        Ok(Outcome::Artifact(self.artifact(20, mime_of(&real), body.freeze())))
    }

    /// The generated gemtext listing for a directory.
    async fn directory_listing(&self, norm: &str, dir: &Path) -> Result<Bytes, FileError> {
        let mut entries = fs::read_dir(dir).await?;
        let mut folders = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => folders.push(name),
                Ok(_) => files.push(name),
                Err(_) => {}
            }
        }
        folders.sort();
        files.sort();

        let mut listing = String::with_capacity(256);
        listing.push_str("# DirectoryContents\n\n");
        listing.push_str(&format!("## {norm}\n\n"));
        listing.push_str(&format!("=> {} back\n\n", pathutil::parent(norm)));
        for folder in &folders {
            listing.push_str(&format!("=> {norm}{folder}/ {folder}/\n"));
        }
        listing.push('\n');
        for file in &files {
            listing.push_str(&format!("=> {norm}{file} {file}\n"));
        }
        Ok(Bytes::from(listing))
    }

    fn artifact(&self, status: u8, meta: impl Into<String>, body: Bytes) -> Artifact {
        Artifact::new(status, meta, body, self.lifetime)
    }

    /// Builds the CGI environment and streams the child's stdout.
    async fn run_cgi(
        &self,
        client: &mut ClientConnection,
        request: &Request,
        norm: &str,
        script: &Path,
        interpreter: Option<&Path>,
    ) {
        let mut env: Vec<(String, OsString)> = vec![
            ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
            ("GEMINI_DOCUMENT_ROOT".into(), self.root.as_os_str().to_owned()),
            ("GEMINI_SCRIPT_FILENAME".into(), script.as_os_str().to_owned()),
            ("GEMINI_URL".into(), request.raw().into()),
            ("GEMINI_URL_PATH".into(), request.path().into()),
            ("QUERY_STRING".into(), request.query().into()),
            ("SCRIPT_NAME".into(), norm.into()),
            ("SERVER_NAME".into(), request.host().into()),
            ("SERVER_PORT".into(), request.port().to_string().into()),
            ("SERVER_PROTOCOL".into(), "GEMINI".into()),
            ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ];
        if let Some(path) = std::env::var_os("PATH") {
            env.push(("PATH".into(), path));
        }
        env.extend(self.environment.iter().cloned());

        let executor = Executor::new(script, interpreter, env);
        if let Err(err) = executor.run(client, &self.pool).await {
            warn!("spawning {} failed: {err}", script.display());
            let _ = client.send(CGI_FAILED.as_bytes()).await;
        }
    }
}

impl Handler for FileHandler {
    fn should_handle(&self, host: &str, path: &str) -> bool {
        self.matcher.matches(host, path)
    }

    fn handle(&self, client: ClientConnection) -> HandleFuture<'_> {
        Box::pin(self.handle_request(client))
    }
}
impl Debug for FileHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandler")
            .field("root", &self.root)
            .field("read_dirs", &self.read_dirs)
            .field("cgi_extensions", &self.cgi_extensions)
            .finish()
    }
}

/// MIME for the `20` header. `text/gemini` is pinned for gemtext, the
/// rest comes from the shared lookup table.
fn mime_of(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gmi") | Some("gemini") => "text/gemini".to_owned(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned(),
    }
}

async fn send_artifact(mut client: ClientConnection, artifact: &Artifact) {
    if client.send(artifact.header().as_bytes()).await.is_ok() && artifact.is_success() {
        let _ = client.send(&artifact.body).await;
    }
    client.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(root: &Path, read_dirs: bool) -> Arc<dyn Handler> {
        build_with(root, read_dirs, serde_yaml::Mapping::new())
    }

    fn build_with(
        root: &Path,
        read_dirs: bool,
        mut extra: serde_yaml::Mapping,
    ) -> Arc<dyn Handler> {
        extra.insert("handler".into(), "filehandler".into());
        extra.insert("server".into(), "test".into());
        extra.insert("root".into(), root.to_string_lossy().as_ref().into());
        extra.insert("read_dirs".into(), read_dirs.into());
        let doc = serde_yaml::Value::Mapping(extra);
        FileHandler::factory(FactoryContext {
            file: Path::new("test.yml"),
            doc: &doc,
            matcher: Matcher::new(None, None, None, Vec::new()),
            cache: Cache::new(0),
            owner: 1,
        })
        .unwrap()
    }

    async fn respond(handler: &Arc<dyn Handler>, url: &str) -> Vec<u8> {
        let request = Request::parse(url.as_bytes()).unwrap();
        let (writer, mut reader) = pipe::pipe();
        let client = ClientConnection::new(request, writer);
        handler.handle(client).await;
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk(4096).await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn serves_a_gemtext_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.gmi"), "# Hi\n").unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://localhost/hello.gmi\r\n").await;
        assert_eq!(response, b"20 text/gemini\r\n# Hi\n");
    }

    #[tokio::test]
    async fn up_dir_paths_redirect_to_their_normal_form() {
        let root = tempfile::tempdir().unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/a/../b\r\n").await;
        assert_eq!(response, b"31 /b\r\n");
        let response = respond(&handler, "gemini://x/../etc/passwd\r\n").await;
        assert_eq!(response, b"31 /etc/passwd\r\n");
    }

    #[tokio::test]
    async fn directory_without_slash_redirects() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("pub")).unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/pub\r\n").await;
        assert_eq!(response, b"31 /pub/\r\n");
    }

    #[tokio::test]
    async fn directory_without_index_and_without_read_dirs_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("pub")).unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/pub/\r\n").await;
        assert_eq!(response, NOT_FOUND.as_bytes());
    }

    #[tokio::test]
    async fn directory_listing_lists_folders_then_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("pub");
        std::fs::create_dir(&dir).unwrap();
        std::fs::create_dir(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.gmi"), "a").unwrap();
        let handler = build(root.path(), true);

        let response = respond(&handler, "gemini://x/pub/\r\n").await;
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("20 text/gemini\r\n# DirectoryContents\n\n## /pub/\n\n=> / back\n\n"));
        assert!(text.contains("=> /pub/sub/ sub/\n"));
        assert!(text.contains("=> /pub/a.gmi a.gmi\n"));
        let folder_pos = text.find("sub/").unwrap();
        let file_pos = text.find("a.gmi").unwrap();
        assert!(folder_pos < file_pos);
    }

    #[tokio::test]
    async fn index_file_is_served_for_directories() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("pub");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("index.gmi"), "# Index\n").unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/pub/\r\n").await;
        assert_eq!(response, b"20 text/gemini\r\n# Index\n");
    }

    #[tokio::test]
    async fn file_with_trailing_slash_redirects_back() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.gmi"), "a").unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/a.gmi/\r\n").await;
        assert_eq!(response, b"31 /a.gmi\r\n");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/nope.gmi\r\n").await;
        assert_eq!(response, NOT_FOUND.as_bytes());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_the_root_is_refused() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("leak"))
            .unwrap();
        let handler = build(root.path(), false);

        let response = respond(&handler, "gemini://x/leak\r\n").await;
        assert_eq!(response, ESCAPED.as_bytes());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directory_is_not_listed() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("leak")).unwrap();
        let handler = build(root.path(), true);

        // Neither a listing nor an index probe may enumerate the target.
        let response = respond(&handler, "gemini://x/leak/\r\n").await;
        assert_eq!(response, ESCAPED.as_bytes());
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("hello.gmi");
        std::fs::write(&file, "# v1\n").unwrap();
        let handler = build(root.path(), false);

        assert_eq!(
            respond(&handler, "gemini://x/hello.gmi\r\n").await,
            b"20 text/gemini\r\n# v1\n"
        );
        // The production ran once; a changed file is not re-read.
        std::fs::write(&file, "# v2\n").unwrap();
        assert_eq!(
            respond(&handler, "gemini://x/hello.gmi\r\n").await,
            b"20 text/gemini\r\n# v1\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cgi_scripts_stream_their_own_response() {
        let sh = find_program("sh").expect("a shell");
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("run.sh"),
            "#!/bin/sh\nprintf '20 text/gemini\\r\\n# from %s\\n' \"$SERVER_PROTOCOL\"\n",
        )
        .unwrap();

        let mut extra = serde_yaml::Mapping::new();
        extra.insert("cgi_extensions".into(), serde_yaml::Value::Sequence(vec!["sh".into()]));
        let mut interpreters = serde_yaml::Mapping::new();
        interpreters.insert("sh".into(), sh.to_string_lossy().as_ref().into());
        extra.insert("cgi_interpreter".into(), serde_yaml::Value::Mapping(interpreters));
        let handler = build_with(root.path(), false, extra);

        let response = respond(&handler, "gemini://x/run.sh\r\n").await;
        assert_eq!(response, b"20 text/gemini\r\n# from GEMINI\n");
    }

    #[tokio::test]
    async fn percent_encoded_updirs_cannot_escape() {
        let root = tempfile::tempdir().unwrap();
        let handler = build(root.path(), false);

        // `%2e%2e` decodes to `..`; normalization turns it into a redirect.
        let response = respond(&handler, "gemini://x/%2e%2e/etc/passwd\r\n").await;
        assert_eq!(response, b"31 /etc/passwd\r\n");
    }
}
